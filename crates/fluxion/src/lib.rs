//! Cooperative fiber/future/channel/AIO runtime core.
//!
//! `fluxion` re-exports the workspace's narrowly-scoped crates behind one
//! namespace: a deferred-result [`Future`]/[`Promise`] pair with observer
//! chaining ([`fluxion_future`]); stackful [`fluxion_fiber`] coroutines run
//! by a per-thread [`Scheduler`] ([`fluxion_scheduler`]); a bounded,
//! future-valued [`Channel`] ([`fluxion_channel`]); and, behind the `aio`
//! feature, a ring-based asynchronous I/O backend ([`fluxion_aio`]).
//!
//! None of these components run anything on their own — they're driven by
//! an embedder-supplied host readiness loop implementing [`HostLoopSource`]
//! for each of the [`Scheduler`] and any AIO context in use. For standalone
//! use (examples, doctests, this crate's own integration tests) a minimal
//! reference loop is available behind the `reference-loop` feature; see
//! [`loop_::ReferenceLoop`].
//!
//! ```
//! use fluxion::prelude::*;
//!
//! let (future, promise) = pending::<i32>();
//! promise.resolve(7).unwrap();
//! assert_eq!(*future.peek().unwrap().unwrap(), 7);
//! ```

#[cfg(feature = "diagnostics")]
pub mod diagnostics;
#[cfg(all(unix, feature = "reference-loop"))]
pub mod loop_;
pub mod prelude;

pub use fluxion_channel::Channel;
pub use fluxion_future::{chain, pending, race, timeout, Error, Future, Outcome, Promise, Result};
pub use fluxion_scheduler::{
    current, process_default, set_process_default, set_thread_default, thread_default, Context, DetachedFiber,
    FiberId, HostLoopSource, Scheduler, SchedulerConfig,
};

#[cfg(unix)]
pub use fluxion_fiber::{Stack, StackConfig, StackPool};

#[cfg(feature = "aio")]
pub mod aio {
    //! Asynchronous I/O: submits `read`/`write` against caller-owned file
    //! descriptors and completes a [`crate::Future`] per operation.
    pub use fluxion_aio::{AioBackend, AioResult, RingConfig};

    #[cfg(all(unix, feature = "ring"))]
    pub use fluxion_aio::RingAio;
    #[cfg(all(unix, feature = "thread-pool-aio"))]
    pub use fluxion_aio::ThreadPoolAio;
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn fiber_awaits_two_promises_and_sums_them_out_of_order() {
        let scheduler = Scheduler::new();
        let (a, pa) = pending::<i32>();
        let (b, pb) = pending::<i32>();

        let sum = scheduler.spawn(move |ctx| {
            let x = *ctx.await_future(&a).unwrap();
            let y = *ctx.await_future(&b).unwrap();
            x + y
        });

        scheduler.dispatch();
        pb.resolve(10).unwrap();
        scheduler.dispatch();
        pa.resolve(32).unwrap();
        scheduler.dispatch();

        assert_eq!(*sum.peek().unwrap().unwrap(), 42);
    }

    #[test]
    fn channel_send_and_receive_round_trip_through_a_fiber() {
        let scheduler = Scheduler::new();
        let channel = Channel::<i32>::new(Some(1));

        let ack = channel.send(Future::new_resolved(9));
        assert_eq!(*ack.peek().unwrap().unwrap(), 1);

        let received = scheduler.spawn({
            let channel = channel.clone();
            move |ctx| {
                let delivery = channel.receive();
                *ctx.await_future(&delivery).unwrap()
            }
        });
        scheduler.dispatch();
        assert_eq!(*received.peek().unwrap().unwrap(), 9);
    }
}
