//! A minimal `poll(2)`-driven reference host loop.
//!
//! `fluxion` itself never implements a host event loop — [`HostLoopSource`]
//! is a contract meant to be satisfied by whatever loop the embedder already
//! runs (GLib's `GMainLoop`, an async runtime's reactor, a bespoke service
//! loop). [`ReferenceLoop`] exists only so this crate is usable standalone,
//! in its own tests and doctests, without requiring an embedder to supply
//! one. It is not a production host-loop replacement: no priorities, no
//! nested dispatch beyond what the scheduler's own reentrant mutex already
//! permits, no nontrivial scaling beyond a handful of sources.
//!
//! A source registers itself with a readiness file descriptor: for an AIO
//! backend that's its own `wakeup_fd()`; for a [`Scheduler`], which has no
//! natural OS-level fd, [`ReferenceLoop::register_scheduler`] wires one up
//! with a self-pipe written to from [`Scheduler::set_wake_host`]. A second,
//! independent readiness axis — deadline timers — is served directly by the
//! loop, which implements [`TimerDriver`] with a small unsorted list
//! (reference-loop scale, not a real timer wheel).

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fluxion_future::timeout::{TimerDriver, TimerToken};
use fluxion_scheduler::{HostLoopSource, Scheduler};

struct TimerEntry {
    id: u64,
    deadline: Instant,
    fire: Option<Box<dyn FnOnce() + Send>>,
}

struct Registered {
    source: Arc<dyn HostLoopSource>,
    fd: RawFd,
}

struct Inner {
    sources: Mutex<Vec<Registered>>,
    timers: Mutex<Vec<TimerEntry>>,
    next_timer_id: AtomicU64,
    // Self-pipe fds created by `register_scheduler` must outlive the
    // registration; nothing else reads them directly.
    owned_fds: Mutex<Vec<OwnedFd>>,
}

/// A tiny standalone host loop: `poll(2)` over every registered source's
/// readiness fd, plus a scan over armed timers, repeated until the caller's
/// `done` predicate is satisfied.
pub struct ReferenceLoop {
    inner: Arc<Inner>,
}

impl Default for ReferenceLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceLoop {
    pub fn new() -> Self {
        ReferenceLoop {
            inner: Arc::new(Inner {
                sources: Mutex::new(Vec::new()),
                timers: Mutex::new(Vec::new()),
                next_timer_id: AtomicU64::new(0),
                owned_fds: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers an arbitrary [`HostLoopSource`] that signals readiness by
    /// making `fd` readable — an AIO backend's `wakeup_fd()`, typically.
    pub fn register_source(&self, source: Arc<dyn HostLoopSource>, fd: RawFd) {
        self.inner.sources.lock().unwrap().push(Registered { source, fd });
    }

    /// Registers a [`Scheduler`], wiring a self-pipe into
    /// [`Scheduler::set_wake_host`] so a fiber becoming ready from another
    /// thread wakes this loop's `poll(2)` promptly.
    pub fn register_scheduler(&self, scheduler: &Scheduler) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe(2) failed: {}", std::io::Error::last_os_error());
        let [read_fd, write_fd] = fds;
        unsafe {
            for fd in [read_fd, write_fd] {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }

        scheduler.set_wake_host(Arc::new(move || {
            let one = [1u8];
            unsafe {
                libc::write(write_fd, one.as_ptr().cast(), 1);
            }
        }));

        self.register_source(Arc::new(scheduler.clone()), read_fd);
        let mut owned = self.inner.owned_fds.lock().unwrap();
        owned.push(unsafe { OwnedFd::from_raw_fd(read_fd) });
        owned.push(unsafe { OwnedFd::from_raw_fd(write_fd) });
    }

    /// Runs the loop — blocking and dispatching ready sources and due
    /// timers — until `done` returns `true`. Checked once before each block,
    /// so a `done` that is already satisfied returns without polling.
    pub fn run_until(&self, mut done: impl FnMut() -> bool) {
        loop {
            if done() {
                return;
            }
            self.fire_expired_timers(Instant::now());
            if done() {
                return;
            }

            let (wait, mut pollfds) = self.prepare_sources();

            let timeout_ms: i32 = wait.as_millis().try_into().unwrap_or(i32::MAX);
            unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms);
            }

            self.dispatch_ready(&pollfds);
            self.fire_expired_timers(Instant::now());
        }
    }

    /// Calls `prepare` on every source, computes how long `poll(2)` should
    /// block, and builds the matching `pollfd` table.
    fn prepare_sources(&self) -> (Duration, Vec<libc::pollfd>) {
        let sources = self.inner.sources.lock().unwrap();
        let mut immediate = false;
        let mut timeout_hint: Option<Duration> = None;
        for reg in sources.iter() {
            let mut per_source = None;
            if reg.source.prepare(&mut per_source) {
                immediate = true;
            }
            if let Some(d) = per_source {
                timeout_hint = Some(timeout_hint.map_or(d, |cur: Duration| cur.min(d)));
            }
        }
        if let Some(next) = self.earliest_timer_wait(Instant::now()) {
            timeout_hint = Some(timeout_hint.map_or(next, |cur| cur.min(next)));
        }
        let wait = if immediate {
            Duration::ZERO
        } else {
            timeout_hint.unwrap_or(Duration::from_millis(100))
        };
        let pollfds = sources
            .iter()
            .map(|r| libc::pollfd {
                fd: r.fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        (wait, pollfds)
    }

    /// Drains readable wakeup fds and dispatches every source that reports
    /// itself ready, one whose `dispatch` claims more immediate work is run
    /// again before moving to the next source.
    fn dispatch_ready(&self, pollfds: &[libc::pollfd]) {
        let sources = self.inner.sources.lock().unwrap();
        for (reg, pfd) in sources.iter().zip(pollfds.iter()) {
            let readable = pfd.revents & libc::POLLIN != 0;
            if readable {
                drain_fd(reg.fd);
            }
            if readable || reg.source.check() {
                while reg.source.dispatch() {}
            }
        }
    }

    fn earliest_timer_wait(&self, now: Instant) -> Option<Duration> {
        let timers = self.inner.timers.lock().unwrap();
        timers.iter().map(|t| t.deadline.saturating_duration_since(now)).min()
    }

    fn fire_expired_timers(&self, now: Instant) {
        let due: Vec<TimerEntry> = {
            let mut timers = self.inner.timers.lock().unwrap();
            let mut i = 0;
            let mut due = Vec::new();
            while i < timers.len() {
                if timers[i].deadline <= now {
                    due.push(timers.remove(i));
                } else {
                    i += 1;
                }
            }
            due
        };
        for entry in due {
            if let Some(fire) = entry.fire {
                fire();
            }
        }
    }
}

/// Drains a readiness fd (self-pipe byte or eventfd counter) so the next
/// `poll(2)` blocks again instead of spinning. Harmless to call on a fd an
/// AIO backend's own `dispatch` already drained.
fn drain_fd(fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

impl TimerDriver for ReferenceLoop {
    fn schedule(&self, deadline: Instant, fire: Box<dyn FnOnce() + Send>) -> TimerToken {
        let id = self.inner.next_timer_id.fetch_add(1, Ordering::Relaxed);
        self.inner.timers.lock().unwrap().push(TimerEntry {
            id,
            deadline,
            fire: Some(fire),
        });
        TimerToken(id)
    }

    fn cancel(&self, token: TimerToken) {
        self.inner.timers.lock().unwrap().retain(|t| t.id != token.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxion_future::{race, Error};

    #[test]
    fn fiber_spawned_on_scheduler_runs_to_completion_via_the_loop() {
        let sched = Scheduler::new();
        let host_loop = ReferenceLoop::new();
        host_loop.register_scheduler(&sched);

        let result = sched.spawn(|_ctx| 2 + 2);
        host_loop.run_until(|| result.is_resolved());
        assert_eq!(*result.peek().unwrap().unwrap(), 4);
    }

    #[test]
    fn timeout_wins_a_race_against_a_promise_that_never_resolves() {
        let host_loop = Arc::new(ReferenceLoop::new());
        let (never, _never_promise) = fluxion_future::pending::<i32>();
        let (timeout_future, _timeout) =
            fluxion_future::timeout::Timeout::<i32>::new(host_loop.clone(), Instant::now() + Duration::from_millis(10));

        let raced = race([never, timeout_future]);
        host_loop.run_until(|| raced.peek().is_some());
        assert!(matches!(raced.peek().unwrap(), Err(Error::TimedOut)));
    }
}
