//! The ring-based [`AioBackend`]: submissions and completions flow through a
//! Linux `io_uring` instance, with a backlog FIFO absorbing operations that
//! don't fit in the current submission ring.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fluxion_future::{pending, Future, Outcome, Promise};
use fluxion_scheduler::HostLoopSource;
use io_uring::{opcode, types, IoUring};
use slab::Slab;

use crate::backend::{AioBackend, AioResult};
use crate::config::RingConfig;
use crate::error::map_errno;
use crate::eventfd;

#[derive(Clone, Copy)]
enum Kind {
    Read,
    Write,
}

/// An operation that has not yet been handed to the kernel: either brand
/// new, or evicted from the ring back onto the backlog because a submission
/// slot wasn't available.
struct QueuedOp {
    kind: Kind,
    fd: RawFd,
    buf: Vec<u8>,
    offset: u64,
    promise: Promise<AioResult>,
}

/// An operation the kernel currently owns. Keeps `buf` alive (the kernel
/// writes/reads through the raw pointer handed to it in the SQE) and
/// `promise` so the completion handler can resolve it without a second
/// lookup structure — the slab key doubles as the SQE's `user_data`.
struct Inflight {
    kind: Kind,
    buf: Vec<u8>,
    promise: Promise<AioResult>,
}

struct State {
    ring: IoUring,
    inflight: Slab<Inflight>,
    backlog: VecDeque<QueuedOp>,
}

impl State {
    /// Attempts to place `op` directly into a submission-queue slot. Returns
    /// `op` back on failure (ring full) so the caller can backlog it.
    fn try_submit(&mut self, op: QueuedOp) -> Result<(), QueuedOp> {
        if self.ring.submission().is_full() {
            return Err(op);
        }
        let QueuedOp {
            kind,
            fd,
            mut buf,
            offset,
            promise,
        } = op;
        let ptr = buf.as_mut_ptr();
        let len = buf.len() as u32;
        let entry = match kind {
            Kind::Read => opcode::Read::new(types::Fd(fd), ptr, len).offset(offset).build(),
            Kind::Write => opcode::Write::new(types::Fd(fd), ptr, len).offset(offset).build(),
        };
        let key = self.inflight.insert(Inflight { kind, buf, promise });
        let entry = entry.user_data(key as u64);
        // SAFETY: `ptr` stays valid until the completion is drained — the
        // buffer backing it lives in `self.inflight[key]`, which is only
        // removed by `drain_completions` after the kernel has reported this
        // same `user_data` as done.
        unsafe {
            self.ring
                .submission()
                .push(&entry)
                .expect("checked not full immediately above, and only this thread submits");
        }
        Ok(())
    }

    /// Hands the pending SQEs to the kernel if there are any.
    fn submit_if_pending(&mut self) {
        if !self.ring.submission().is_empty() {
            let _ = self.ring.submitter().submit();
        }
    }

    /// Promotes as much of the backlog into the ring as slots allow.
    /// Returns the number of operations promoted.
    fn drain_backlog(&mut self) -> usize {
        let mut promoted = 0;
        while let Some(op) = self.backlog.pop_front() {
            match self.try_submit(op) {
                Ok(()) => promoted += 1,
                Err(op) => {
                    self.backlog.push_front(op);
                    break;
                }
            }
        }
        promoted
    }

    fn completion_ready(&mut self) -> bool {
        let mut cq = self.ring.completion();
        cq.sync();
        !cq.is_empty()
    }

    /// Drains every available completion entry, resolving each op-future
    /// exactly once. Completion ordering is the kernel's; no ordering across
    /// different ops is promised here.
    fn drain_completions(&mut self) {
        let mut done = Vec::new();
        {
            let mut cq = self.ring.completion();
            cq.sync();
            for cqe in &mut cq {
                done.push((cqe.user_data() as usize, cqe.result()));
            }
        }
        for (key, result) in done {
            let Some(inflight) = self.inflight.try_remove(key) else {
                tracing::warn!(key, "completion for unknown or already-seen op");
                continue;
            };
            let outcome: Outcome<AioResult> = if result >= 0 {
                Ok(Arc::new(AioResult {
                    buf: inflight.buf,
                    n: result as usize,
                }))
            } else {
                Err(map_errno(result))
            };
            let _ = inflight.promise.complete(outcome);
        }
    }
}

/// A per-loop asynchronous I/O context backed by Linux `io_uring`.
///
/// Implements both [`AioBackend`] (the `read`/`write` surface callers use)
/// and [`HostLoopSource`] (so an embedding host loop can drive it the same
/// way it drives a [`fluxion_scheduler::Scheduler`]): the context is itself
/// a host readiness source.
pub struct RingAio {
    state: Mutex<State>,
    wakeup: OwnedFd,
}

impl RingAio {
    /// Initializes a ring of the configured depth, registers an eventfd for
    /// completion notifications, and returns the context ready for use.
    pub fn new(config: RingConfig) -> std::io::Result<Arc<Self>> {
        let depth = if config.depth == 0 {
            RingConfig::DEFAULT_DEPTH
        } else {
            config.depth
        };
        let mut builder = IoUring::builder();
        if config.sqpoll {
            builder.setup_sqpoll(100);
        }
        let ring = builder.build(depth)?;
        let wakeup = eventfd::create()?;
        ring.submitter().register_eventfd(wakeup.as_raw_fd())?;

        tracing::debug!(depth, sqpoll = config.sqpoll, "initialized io_uring AIO context");

        Ok(Arc::new(RingAio {
            state: Mutex::new(State {
                ring,
                inflight: Slab::new(),
                backlog: VecDeque::new(),
            }),
            wakeup,
        }))
    }

    /// The fd a host loop should poll for readability; becomes readable
    /// whenever at least one completion is available.
    pub fn wakeup_fd(&self) -> RawFd {
        self.wakeup.as_raw_fd()
    }

    fn queue(&self, kind: Kind, fd: RawFd, buf: Vec<u8>, offset: u64) -> Future<AioResult> {
        let (future, promise) = pending();
        let op = QueuedOp {
            kind,
            fd,
            buf,
            offset,
            promise,
        };
        let mut state = self.state.lock().unwrap();
        // Earlier backlogged ops must reach the ring before this one, so
        // only attempt a direct submission when the backlog is already
        // empty; otherwise this op joins the back of the line.
        if state.backlog.is_empty() {
            match state.try_submit(op) {
                Ok(()) => {
                    tracing::trace!(fd, "aio op submitted directly");
                }
                Err(op) => {
                    tracing::trace!(fd, "aio op backlogged (ring full)");
                    state.backlog.push_back(op);
                }
            }
        } else {
            tracing::trace!(fd, "aio op backlogged (earlier ops pending)");
            state.backlog.push_back(op);
        }
        future
    }
}

impl AioBackend for RingAio {
    fn read(&self, fd: RawFd, buf: Vec<u8>, offset: u64) -> Future<AioResult> {
        self.queue(Kind::Read, fd, buf, offset)
    }

    fn write(&self, fd: RawFd, buf: Vec<u8>, offset: u64) -> Future<AioResult> {
        self.queue(Kind::Write, fd, buf, offset)
    }
}

impl HostLoopSource for RingAio {
    fn prepare(&self, _timeout: &mut Option<Duration>) -> bool {
        let mut state = self.state.lock().unwrap();
        state.submit_if_pending();
        if state.drain_backlog() > 0 {
            state.submit_if_pending();
        }
        state.completion_ready()
    }

    fn check(&self) -> bool {
        self.state.lock().unwrap().completion_ready()
    }

    fn dispatch(&self) -> bool {
        eventfd::drain(self.wakeup.as_raw_fd());
        let mut state = self.state.lock().unwrap();
        state.drain_completions();
        state.submit_if_pending();
        if state.drain_backlog() > 0 {
            state.submit_if_pending();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::fd::FromRawFd;

    #[test]
    fn read_from_a_pipe_resolves_with_byte_count() {
        let ctx = RingAio::new(RingConfig::default()).expect("io_uring unavailable in this environment");

        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe(2) failed: {}", std::io::Error::last_os_error());
        let [read_fd, write_fd] = fds;

        let mut write_end = unsafe { std::fs::File::from_raw_fd(write_fd) };
        write_end.write_all(b"hello").unwrap();
        drop(write_end);

        let future = ctx.read(read_fd, vec![0u8; 5], 0);

        // Drive the context directly (no host loop in this test): submit,
        // wait for the kernel to signal, dispatch.
        let mut timeout = None;
        while !ctx.prepare(&mut timeout) {
            std::thread::sleep(Duration::from_millis(1));
        }
        ctx.dispatch();

        let outcome = future.peek().expect("completion should have resolved the future");
        let result = outcome.expect("read should succeed");
        assert_eq!(result.n, 5);
        assert_eq!(&result.buf, b"hello");

        unsafe {
            libc::close(read_fd);
        }
    }
}
