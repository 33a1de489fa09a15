//! Per-thread cooperative fiber scheduler.
//!
//! A [`Scheduler`] owns a `ready` FIFO and a `waiting` set of fibers bound
//! to one thread, and is itself a [`HostLoopSource`]: the embedding host
//! loop polls it via `prepare`/`check` and runs its ready fibers via
//! `dispatch`. Fibers suspend by awaiting a [`fluxion_future::Future`]
//! through the [`Context`] handed to their body; when that future settles,
//! the scheduler moves the fiber back to `ready` and wakes the host loop.

mod error;
mod host_loop;
mod registry;
mod scheduler;

pub use error::{Error, Result};
pub use host_loop::HostLoopSource;
pub use registry::{current, process_default, set_process_default, set_thread_default, thread_default};
pub use scheduler::{Context, DetachedFiber, FiberId, Scheduler};

/// Construction-time knobs for a [`Scheduler`].
///
/// Deliberately minimal: the scheduling model is a single-threaded,
/// non-preemptive, non-work-stealing FIFO runner with no policy knobs to
/// expose. Kept as a distinct type (rather than extra `Scheduler::new`
/// arguments) so later, backwards-compatible additions have somewhere to
/// land without breaking callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerConfig {
    _private: (),
}
