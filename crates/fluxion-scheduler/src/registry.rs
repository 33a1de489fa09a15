//! Process-default and thread-default scheduler lookup.
//!
//! Convenience entrypoints that need a scheduler but weren't handed one
//! consult these; nothing on the critical path (spawn/await/dispatch) does.

use std::cell::RefCell;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::scheduler::Scheduler;

static PROCESS_DEFAULT: OnceLock<Scheduler> = OnceLock::new();

thread_local! {
    static THREAD_DEFAULT: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

/// Sets the process-wide default scheduler. May only succeed once; treat
/// this as process initialization, not mutable runtime state.
pub fn set_process_default(scheduler: Scheduler) -> Result<()> {
    PROCESS_DEFAULT
        .set(scheduler)
        .map_err(|_| Error::AlreadyInitialized)
}

/// Returns the process-default scheduler, if one has been set.
pub fn process_default() -> Option<Scheduler> {
    PROCESS_DEFAULT.get().cloned()
}

/// Rebinds the calling thread's default scheduler, returning the previous
/// one if any.
pub fn set_thread_default(scheduler: Scheduler) -> Option<Scheduler> {
    THREAD_DEFAULT.with(|slot| slot.borrow_mut().replace(scheduler))
}

/// Returns the calling thread's default scheduler, if one has been bound.
pub fn thread_default() -> Option<Scheduler> {
    THREAD_DEFAULT.with(|slot| slot.borrow().clone())
}

/// Convenience mirroring `dex_scheduler_get_thread_default`: the
/// thread-default scheduler if bound, else the process-default.
pub fn current() -> Option<Scheduler> {
    thread_default().or_else(process_default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_default_round_trips() {
        assert!(thread_default().is_none());
        let sched = Scheduler::new();
        assert!(set_thread_default(sched).is_none());
        assert!(thread_default().is_some());
    }
}
