use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use std::cell::RefCell;

use fluxion_fiber::{Fiber, RunResult, Stack, StackConfig, StackPool};
use fluxion_future::{Future, Outcome, Promise};
use parking_lot::ReentrantMutex;
use slab::Slab;

use crate::host_loop::HostLoopSource;

/// Opaque handle to a fiber hosted by a [`Scheduler`], stable for the
/// fiber's whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(usize);

/// Result of running a hosted fiber for one turn.
enum Step {
    Suspended,
    Finished,
}

/// Type-erases a fiber plus whatever it needs to resolve its own result
/// future on completion, so the scheduler's bookkeeping never has to know
/// the fiber body's return type.
trait Runnable: Send {
    fn step(&mut self) -> Step;

    /// Reclaims the stack backing this fiber. Only valid to call once
    /// `step()` has returned `Step::Finished`.
    fn take_stack(&mut self) -> Stack;
}

struct SpawnedFiber<T> {
    fiber: Fiber<(), (), ()>,
    promise: Promise<T>,
}

impl<T: Send + Sync + 'static> Runnable for SpawnedFiber<T> {
    fn step(&mut self) -> Step {
        match self.fiber.resume(()) {
            RunResult::Yield(()) => Step::Suspended,
            RunResult::Return(()) => Step::Finished,
            RunResult::Panicked(payload) => {
                let message = panic_message(&payload);
                let _ = self.promise.reject(fluxion_future::Error::cancelled(message));
                Step::Finished
            }
        }
    }

    fn take_stack(&mut self) -> Stack {
        self.fiber.take_stack()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "fiber body panicked".to_string()
    }
}

struct Slot {
    // `None` while the fiber is actively running (taken out so `step()`
    // can run with no scheduler lock held); `Some` while ready or waiting.
    runnable: Option<Box<dyn Runnable>>,
}

struct State {
    fibers: Slab<Slot>,
    ready: std::collections::VecDeque<FiberId>,
    waiting: std::collections::HashSet<FiberId>,
    current: Option<FiberId>,
}

struct Inner {
    mutex: ReentrantMutex<RefCell<State>>,
    stacks: StackPool,
    /// Invoked whenever `ready` gains work, so a host loop blocked on a
    /// different thread wakes up promptly instead of waiting out its poll
    /// timeout. Typically writes to a self-pipe or eventfd.
    wake_host: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

/// A per-thread cooperative runner of fibers, registered with the host
/// loop as a [`HostLoopSource`].
///
/// Cloning a `Scheduler` is cheap (an `Arc` bump); every clone refers to
/// the same ready/waiting queues and the same owning thread.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_stack_pool(StackPool::with_defaults())
    }

    /// Builds a scheduler whose fiber stacks follow `config` instead of the
    /// platform defaults.
    pub fn with_stack_config(config: StackConfig) -> Self {
        Self::with_stack_pool(StackPool::from_config(config))
    }

    pub fn with_stack_pool(stacks: StackPool) -> Self {
        Scheduler {
            inner: Arc::new(Inner {
                mutex: ReentrantMutex::new(RefCell::new(State {
                    fibers: Slab::new(),
                    ready: std::collections::VecDeque::new(),
                    waiting: std::collections::HashSet::new(),
                    current: None,
                })),
                stacks,
                wake_host: Mutex::new(None),
            }),
        }
    }

    /// Registers a callback invoked when this scheduler gains ready work.
    /// The host loop integration uses this to wake its blocking poll.
    pub fn set_wake_host(&self, wake: Arc<dyn Fn() + Send + Sync>) {
        *self.inner.wake_host.lock().unwrap() = Some(wake);
    }

    /// Creates a fiber bound to `self`'s stack pool, but does not enqueue
    /// it — the fiber data model's "created detached" state. The fiber
    /// will not run until handed to a scheduler with
    /// [`migrate_to`](Scheduler::migrate_to) (commonly the same scheduler
    /// that created it, but this is also the mechanism for handing a fresh
    /// fiber off to a different thread's scheduler).
    pub fn create<T, F>(&self, func: F) -> (Future<T>, DetachedFiber)
    where
        T: Send + Sync + 'static,
        F: FnOnce(&Context) -> T + Send + 'static,
    {
        let (future, promise) = fluxion_future::pending();
        let promise_for_body = promise.clone();
        let binding: Binding = Arc::new(Mutex::new(None));
        let binding_for_body = binding.clone();

        let stack = self
            .inner
            .stacks
            .allocate()
            .expect("stack pool exhausted or the platform mapping failed");

        let fiber = Fiber::new(stack, move |(), suspend| {
            let (id, scheduler) = binding_for_body
                .lock()
                .unwrap()
                .clone()
                .expect("fiber resumed before being migrated to a scheduler");
            let ctx = Context {
                suspend,
                id,
                scheduler,
            };
            let result = func(&ctx);
            let _ = promise_for_body.resolve(result);
        });

        let runnable: Box<dyn Runnable> = Box::new(SpawnedFiber { fiber, promise });
        (future, DetachedFiber { runnable, binding })
    }

    /// Convenience for the common case of creating a fiber and immediately
    /// handing it to this same scheduler.
    pub fn spawn<T, F>(&self, func: F) -> Future<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&Context) -> T + Send + 'static,
    {
        let (future, detached) = self.create(func);
        self.migrate_to(detached);
        future
    }

    /// Places a detached fiber in `ready` and wakes this scheduler's
    /// readiness source. Legal from any thread — the standard way to hand
    /// a freshly created fiber off to the thread that should run it.
    pub fn migrate_to(&self, detached: DetachedFiber) {
        let id = {
            let guard = self.inner.mutex.lock();
            let mut state = guard.borrow_mut();
            let id = FiberId(state.fibers.insert(Slot { runnable: None }));
            state.fibers[id.0].runnable = Some(detached.runnable);
            state.ready.push_back(id);
            id
        };
        *detached.binding.lock().unwrap() = Some((id, self.clone()));
        self.note_ready();
    }

    fn mark_waiting(&self, id: FiberId) {
        let guard = self.inner.mutex.lock();
        let mut state = guard.borrow_mut();
        state.waiting.insert(id);
    }

    fn wake(&self, id: FiberId) {
        let became_ready = {
            let guard = self.inner.mutex.lock();
            let mut state = guard.borrow_mut();
            if !state.waiting.remove(&id) {
                // Already woken by a racing observer fire; ignore.
                return;
            }
            state.ready.push_back(id);
            state.ready.len() == 1
        };
        if became_ready {
            self.note_ready();
        }
    }

    fn note_ready(&self) {
        if let Some(wake) = self.inner.wake_host.lock().unwrap().as_ref() {
            wake();
        }
    }

    fn ready_is_empty(&self) -> bool {
        let guard = self.inner.mutex.lock();
        guard.borrow().ready.is_empty()
    }

    /// Runs one fiber to its next suspend/finish point. `false` if the
    /// ready queue was already empty.
    fn run_one(&self) -> bool {
        let (id, mut runnable) = {
            let guard = self.inner.mutex.lock();
            let mut state = guard.borrow_mut();
            let id = match state.ready.pop_front() {
                Some(id) => id,
                None => return false,
            };
            state.current = Some(id);
            let runnable = state.fibers[id.0]
                .runnable
                .take()
                .expect("fiber already running");
            (id, runnable)
        };

        tracing::trace!(fiber = id.0, "resuming fiber");
        // No scheduler lock is held across this call. The fiber body may
        // re-enter the scheduler (`Context::await_future` -> `mark_waiting`)
        // on this same thread, which the reentrant mutex admits, or another
        // thread may concurrently resolve a future and call `wake`.
        let step = runnable.step();
        // Reclaimed before the fiber's slot is dropped, and recycled into
        // the pool only after the scheduler lock is released below — the
        // pool has its own lock and there's no reason to hold this one
        // across it.
        let reclaimed_stack = matches!(step, Step::Finished).then(|| runnable.take_stack());

        let guard = self.inner.mutex.lock();
        let mut state = guard.borrow_mut();
        state.current = None;
        match step {
            Step::Suspended => {
                state.fibers[id.0].runnable = Some(runnable);
            }
            Step::Finished => {
                state.fibers.remove(id.0);
                tracing::trace!(fiber = id.0, "fiber finished");
            }
        }
        drop(state);
        drop(guard);
        if let Some(stack) = reclaimed_stack {
            self.inner.stacks.recycle(stack);
        }
        true
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostLoopSource for Scheduler {
    fn prepare(&self, _timeout: &mut Option<Duration>) -> bool {
        !self.ready_is_empty()
    }

    fn check(&self) -> bool {
        !self.ready_is_empty()
    }

    fn dispatch(&self) -> bool {
        let _span = tracing::debug_span!("scheduler::dispatch").entered();
        // Demonstrates (and exercises) reentrancy: a fiber body that calls
        // back into the host loop on this thread will re-enter `dispatch`
        // while this guard is conceptually still "held" by the outer call;
        // `ReentrantMutex` permits that same-thread re-acquisition.
        let guard = self.inner.mutex.lock();
        drop(guard);
        loop {
            if !self.run_one() {
                return false;
            }
            if self.ready_is_empty() {
                return false;
            }
        }
    }
}

type Binding = Arc<Mutex<Option<(FiberId, Scheduler)>>>;

/// A fiber created but not yet bound to any scheduler's `ready` queue.
pub struct DetachedFiber {
    runnable: Box<dyn Runnable>,
    binding: Binding,
}

/// Handed to a fiber's body so it can await futures and discover which
/// scheduler/fiber it's running as.
pub struct Context<'a> {
    suspend: &'a fluxion_fiber::Suspend<(), (), ()>,
    id: FiberId,
    scheduler: Scheduler,
}

impl<'a> Context<'a> {
    /// The scheduler currently running this fiber.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Suspends the running fiber until `future` settles, returning its
    /// outcome. If `future` is already terminal, returns immediately
    /// without suspending.
    pub fn await_future<T: Send + Sync + 'static>(&self, future: &Future<T>) -> Outcome<T> {
        if let Some(outcome) = future.peek() {
            return outcome;
        }

        let slot: Arc<Mutex<Option<Outcome<T>>>> = Arc::new(Mutex::new(None));
        let slot_for_observer = slot.clone();
        let scheduler = self.scheduler.clone();
        let id = self.id;

        self.scheduler.mark_waiting(id);
        future.attach_observer(move |outcome| {
            *slot_for_observer.lock().unwrap() = Some(outcome);
            scheduler.wake(id);
        });

        self.suspend.suspend(());

        slot.lock()
            .unwrap()
            .take()
            .expect("fiber resumed before its awaited future recorded an outcome")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn spawn_without_awaiting_runs_to_completion() {
        let sched = Scheduler::new();
        let result = sched.spawn(|_ctx| 2 + 2);
        sched.dispatch();
        assert_eq!(*result.peek().unwrap().unwrap(), 4);
    }

    #[test]
    fn finished_fiber_returns_its_stack_to_the_pool() {
        let sched = Scheduler::with_stack_pool(StackPool::new(64 << 10, 4 << 10, 8));
        assert_eq!(sched.inner.stacks.cached_len(), 0);
        sched.spawn(|_ctx| ());
        sched.dispatch();
        assert_eq!(
            sched.inner.stacks.cached_len(),
            1,
            "a finished fiber's stack must be recycled, not unmapped"
        );

        // Spawning again should reuse the cached stack instead of mapping a
        // fresh one.
        sched.spawn(|_ctx| ());
        sched.dispatch();
        assert_eq!(sched.inner.stacks.cached_len(), 1);
    }

    #[test]
    fn fiber_awaits_two_promises_out_of_order() {
        let sched = Scheduler::new();
        let (f1, p1) = fluxion_future::pending::<i32>();
        let (f2, p2) = fluxion_future::pending::<i32>();

        let sum = sched.spawn(move |ctx| {
            let a = *ctx.await_future(&f1).unwrap();
            let b = *ctx.await_future(&f2).unwrap();
            a + b
        });

        sched.dispatch();
        assert!(sum.is_pending());

        p2.resolve(10).unwrap();
        sched.dispatch();
        assert!(sum.is_pending());

        p1.resolve(32).unwrap();
        sched.dispatch();
        assert_eq!(*sum.peek().unwrap().unwrap(), 42);
    }

    #[test]
    fn panicking_fiber_rejects_its_result_future() {
        let sched = Scheduler::new();
        let result: Future<()> = sched.spawn(|_ctx| panic!("nope"));
        sched.dispatch();
        assert!(result.is_rejected());
    }

    #[test]
    fn many_fibers_run_in_ready_order() {
        let sched = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let order = order.clone();
            let counter = counter.clone();
            sched.spawn(move |_ctx| {
                let i = counter.fetch_add(1, Ordering::SeqCst);
                order.lock().unwrap().push(i);
            });
        }
        sched.dispatch();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
