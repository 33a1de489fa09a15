//! A future specialization that rejects with [`Error::TimedOut`] when a
//! deadline elapses.
//!
//! `fluxion-future` has no opinion on how deadlines are actually scheduled
//! (that's the host loop's job — see `fluxion-scheduler`'s timer wheel), so
//! this module is generic over a small [`TimerDriver`] trait the scheduler
//! implements.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::Error;
use crate::future::{pending, Future, Promise};

/// Opaque handle to a single armed, one-shot timer within a [`TimerDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(pub u64);

/// A source of deadline-triggered callbacks, implemented by whatever host
/// loop integration is driving the scheduler.
pub trait TimerDriver: Send + Sync {
    /// Schedules `fire` to run at or after `deadline`. The returned token
    /// may later be passed to [`cancel`](TimerDriver::cancel).
    fn schedule(&self, deadline: Instant, fire: Box<dyn FnOnce() + Send>) -> TimerToken;

    /// Cancels a previously scheduled timer. A no-op if it already fired.
    fn cancel(&self, token: TimerToken);
}

struct Armed {
    driver: Arc<dyn TimerDriver>,
    token: Mutex<Option<TimerToken>>,
}

/// A handle controlling one in-flight timeout. Dropping it does not cancel
/// the timeout; use an explicit `TimerDriver::cancel` via the owning
/// scheduler for that.
pub struct Timeout<T> {
    promise: Promise<T>,
    armed: Arc<Armed>,
}

impl<T: Send + Sync + 'static> Timeout<T> {
    /// Creates a future that rejects with `Error::TimedOut` at `deadline`,
    /// scheduled through `driver`.
    pub fn new(driver: Arc<dyn TimerDriver>, deadline: Instant) -> (Future<T>, Timeout<T>) {
        let (future, promise) = pending();
        let armed = Arc::new(Armed {
            driver: driver.clone(),
            token: Mutex::new(None),
        });
        let token = arm(&driver, &armed, &promise, deadline);
        *armed.token.lock().unwrap() = Some(token);
        (future, Timeout { promise, armed })
    }

    /// Atomically resets the deadline to `new_deadline`, provided the
    /// timeout has not already fired. If it already fired (or was otherwise
    /// disarmed), this is a no-op.
    pub fn postpone_until(&self, new_deadline: Instant) {
        let mut guard = self.armed.token.lock().unwrap();
        if let Some(old) = guard.take() {
            self.armed.driver.cancel(old);
            let token = arm(&self.armed.driver, &self.armed, &self.promise, new_deadline);
            *guard = Some(token);
        }
    }
}

fn arm<T: Send + Sync + 'static>(
    driver: &Arc<dyn TimerDriver>,
    armed: &Arc<Armed>,
    promise: &Promise<T>,
    deadline: Instant,
) -> TimerToken {
    let armed = armed.clone();
    let promise = promise.clone();
    driver.schedule(
        deadline,
        Box::new(move || {
            let _ = promise.reject(Error::TimedOut);
            *armed.token.lock().unwrap() = None;
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct ImmediateDriver {
        pending: StdMutex<Vec<(u64, Box<dyn FnOnce() + Send>)>>,
        next_id: std::sync::atomic::AtomicU64,
    }

    impl ImmediateDriver {
        fn new() -> Self {
            ImmediateDriver {
                pending: StdMutex::new(Vec::new()),
                next_id: std::sync::atomic::AtomicU64::new(0),
            }
        }

        fn fire_all(&self) {
            let fns = std::mem::take(&mut *self.pending.lock().unwrap());
            for (_, f) in fns {
                f();
            }
        }
    }

    impl TimerDriver for ImmediateDriver {
        fn schedule(&self, _deadline: Instant, fire: Box<dyn FnOnce() + Send>) -> TimerToken {
            let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.pending.lock().unwrap().push((id, fire));
            TimerToken(id)
        }

        fn cancel(&self, token: TimerToken) {
            self.pending.lock().unwrap().retain(|(id, _)| *id != token.0);
        }
    }

    #[test]
    fn fires_rejects_timed_out() {
        let driver = Arc::new(ImmediateDriver::new());
        let (future, _timeout) = Timeout::<i32>::new(driver.clone(), Instant::now());
        driver.fire_all();
        assert!(matches!(future.peek().unwrap(), Err(Error::TimedOut)));
    }

    #[test]
    fn postpone_cancels_old_timer() {
        let driver = Arc::new(ImmediateDriver::new());
        let (future, timeout) = Timeout::<i32>::new(driver.clone(), Instant::now());
        timeout.postpone_until(Instant::now() + std::time::Duration::from_secs(60));
        driver.fire_all();
        // The original armed timer was cancelled by postpone_until; only the
        // rescheduled one is pending, and firing "all pending" fires it too,
        // so this still resolves -- but exactly once, not twice.
        assert!(future.peek().is_some());
    }
}
