use std::mem;
use std::sync::{Arc, Mutex};

use crate::error::{AlreadyResolved, Error};

/// The terminal value of a future: either the resolved payload or the
/// rejection error. The payload is wrapped in `Arc` so that it can be handed
/// to an arbitrary number of observers without requiring `T: Clone` — this
/// mirrors the reference-counted, opaque-value semantics of the system this
/// primitive is modeled on.
pub type Outcome<T> = Result<Arc<T>, Error>;

type ObserverFn<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

enum State<T> {
    Pending(Vec<ObserverFn<T>>),
    Done(Outcome<T>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

impl<T> Inner<T> {
    fn id(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

/// A read-only handle to a result that will become available.
///
/// Cloning a `Future` is cheap (an `Arc` bump) and yields another handle to
/// the same underlying state; this is how a single future supports multiple
/// independent observers.
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            inner: self.inner.clone(),
        }
    }
}

/// The write side of a future, held by the producer.
///
/// At most one `resolve`/`reject`/`complete` call on a given promise
/// succeeds; subsequent attempts return [`AlreadyResolved`] and are
/// otherwise no-ops, per the future's terminal-transition invariant.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: self.inner.clone(),
        }
    }
}

/// Creates a fresh pending future/promise pair.
pub fn pending<T>() -> (Future<T>, Promise<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State::Pending(Vec::new())),
    });
    (
        Future {
            inner: inner.clone(),
        },
        Promise { inner },
    )
}

impl<T: Send + Sync + 'static> Future<T> {
    /// Produces a terminal, already-resolved future.
    pub fn new_resolved(value: T) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::Done(Ok(Arc::new(value)))),
        });
        Future { inner }
    }

    /// Produces a terminal, already-rejected future.
    pub fn new_rejected(error: Error) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::Done(Err(error))),
        });
        Future { inner }
    }

    /// True while the future has not yet transitioned to a terminal status.
    pub fn is_pending(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), State::Pending(_))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), State::Done(Ok(_)))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), State::Done(Err(_)))
    }

    /// Returns the terminal outcome if this future has already settled,
    /// without registering an observer.
    pub fn peek(&self) -> Option<Outcome<T>> {
        match &*self.inner.state.lock().unwrap() {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    /// Attaches a completion observer.
    ///
    /// If the future is already terminal, `cb` runs synchronously before
    /// this call returns. Otherwise it is appended to the observer list and
    /// runs exactly once, in registration order, when the future settles —
    /// on whichever thread calls `resolve`/`reject`/`complete`. No lock is
    /// held while `cb` runs.
    pub fn attach_observer<F>(&self, cb: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        let mut guard = self.inner.state.lock().unwrap();
        match &mut *guard {
            State::Done(outcome) => {
                let outcome = outcome.clone();
                drop(guard);
                cb(outcome);
            }
            State::Pending(observers) => {
                observers.push(Box::new(cb));
            }
        }
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Returns a future handle sharing this promise's state.
    pub fn future(&self) -> Future<T> {
        Future {
            inner: self.inner.clone(),
        }
    }

    /// Resolves the promise with `value`, waking observers in registration
    /// order. Returns `Err(AlreadyResolved)` if the promise already settled.
    pub fn resolve(&self, value: T) -> Result<(), AlreadyResolved> {
        self.complete(Ok(Arc::new(value)))
    }

    /// Rejects the promise with `error`. Returns `Err(AlreadyResolved)` if
    /// the promise already settled.
    pub fn reject(&self, error: Error) -> Result<(), AlreadyResolved> {
        self.complete(Err(error))
    }

    /// Generalized terminal transition, used internally by timeout and AIO
    /// completion producers that already hold an `Outcome`.
    pub fn complete(&self, outcome: Outcome<T>) -> Result<(), AlreadyResolved> {
        let observers = {
            let mut guard = self.inner.state.lock().unwrap();
            if matches!(&*guard, State::Done(_)) {
                return Err(AlreadyResolved);
            }
            match mem::replace(&mut *guard, State::Done(outcome.clone())) {
                State::Pending(observers) => observers,
                State::Done(_) => unreachable!("checked above"),
            }
        };
        tracing::trace!(future = self.inner.id(), resolved = outcome.is_ok(), "future settled");
        for observer in observers {
            observer(outcome.clone());
        }
        Ok(())
    }
}

/// Propagates `source`'s eventual outcome into `target`, preserving both the
/// value and the error case. A re-resolution of `target` from elsewhere (a
/// race, e.g. against a timeout) is treated the same as any other
/// already-resolved attempt: silently ignored.
pub fn chain<T: Send + Sync + 'static>(source: &Future<T>, target: Promise<T>) {
    source.attach_observer(move |outcome| {
        let _ = target.complete(outcome);
    });
}

/// The "first of" composite primitive: resolves or rejects with whichever
/// of `futures` settles first (e.g. an operation racing a timeout).
///
/// Every candidate is chained into the same target promise, so the winner's
/// outcome wins the race and every loser's later completion lands on an
/// already-resolved promise and is silently dropped — it completes
/// harmlessly, as specified for timeout/operation races.
pub fn race<T: Send + Sync + 'static>(futures: impl IntoIterator<Item = Future<T>>) -> Future<T> {
    let (out, promise) = pending();
    for candidate in futures {
        chain(&candidate, promise.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn resolve_wakes_observers_in_order() {
        let (future, promise) = pending::<i32>();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            future.attach_observer(move |_outcome| order.lock().unwrap().push(i));
        }
        promise.resolve(42).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn observer_attached_after_resolve_fires_immediately() {
        let (future, promise) = pending::<i32>();
        promise.resolve(7).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        future.attach_observer(move |outcome| {
            seen2.store(*outcome.unwrap(), Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn second_resolve_is_a_noop() {
        let (_future, promise) = pending::<i32>();
        promise.resolve(1).unwrap();
        assert_eq!(promise.resolve(2), Err(AlreadyResolved));
    }

    #[test]
    fn second_reject_is_a_noop() {
        let (_future, promise) = pending::<i32>();
        promise.reject(Error::TimedOut).unwrap();
        assert_eq!(promise.reject(Error::TimedOut), Err(AlreadyResolved));
    }

    #[test]
    fn round_trip_resolve() {
        let (future, promise) = pending::<&'static str>();
        promise.resolve("hello").unwrap();
        assert_eq!(*future.peek().unwrap().unwrap(), "hello");
    }

    #[test]
    fn round_trip_reject() {
        let (future, promise) = pending::<i32>();
        promise.reject(Error::Cancelled("test".into())).unwrap();
        assert!(matches!(future.peek().unwrap(), Err(Error::Cancelled(_))));
    }

    #[test]
    fn chain_propagates_value() {
        let (source, source_promise) = pending::<i32>();
        let (target, target_promise) = pending::<i32>();
        chain(&source, target_promise);
        source_promise.resolve(9).unwrap();
        assert_eq!(*target.peek().unwrap().unwrap(), 9);
    }

    #[test]
    fn chain_propagates_rejection() {
        let (source, source_promise) = pending::<i32>();
        let (target, target_promise) = pending::<i32>();
        chain(&source, target_promise);
        source_promise.reject(Error::ChannelClosed).unwrap();
        assert!(matches!(target.peek().unwrap(), Err(Error::ChannelClosed)));
    }

    #[test]
    fn race_resolves_with_the_first_winner_and_ignores_the_loser() {
        let (winner, winner_promise) = pending::<i32>();
        let (loser, loser_promise) = pending::<i32>();
        let raced = race([winner, loser]);
        winner_promise.resolve(1).unwrap();
        assert_eq!(*raced.peek().unwrap().unwrap(), 1);
        // The loser settling afterwards must not panic or change the outcome.
        loser_promise.resolve(2).unwrap();
        assert_eq!(*raced.peek().unwrap().unwrap(), 1);
    }

    #[test]
    fn race_against_a_rejection_propagates_whichever_settles_first() {
        let (timeout, timeout_promise) = pending::<i32>();
        let (op, _op_promise) = pending::<i32>();
        let raced = race([op, timeout]);
        timeout_promise.reject(Error::TimedOut).unwrap();
        assert!(matches!(raced.peek().unwrap(), Err(Error::TimedOut)));
    }

    #[test]
    fn new_resolved_fires_immediately() {
        let future = Future::new_resolved(5);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        future.attach_observer(move |outcome| seen2.store(*outcome.unwrap(), Ordering::SeqCst));
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }
}
