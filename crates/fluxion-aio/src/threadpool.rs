//! A fallback [`AioBackend`] for platforms or kernels without `io_uring`:
//! blocking `pread`/`pwrite` syscalls run on a small worker pool, with
//! completions funneled back through a queue and an eventfd wakeup so the
//! backend can still be driven as a [`HostLoopSource`], same as the
//! ring-based implementation.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fluxion_future::{pending, Future, Outcome, Promise};
use fluxion_scheduler::HostLoopSource;

use crate::backend::{AioBackend, AioResult};
use crate::eventfd;

enum Kind {
    Read,
    Write,
}

struct Job {
    kind: Kind,
    fd: RawFd,
    buf: Vec<u8>,
    offset: u64,
    promise: Promise<AioResult>,
}

struct Completed {
    promise: Promise<AioResult>,
    outcome: Outcome<AioResult>,
}

struct Shared {
    completed: Mutex<VecDeque<Completed>>,
    wakeup: OwnedFd,
}

/// Default worker count when [`ThreadPoolAio::new`]'s caller has no strong
/// opinion: enough to keep a handful of slow disks or sockets from serializing
/// behind each other without spawning a thread per op.
pub const DEFAULT_WORKERS: usize = 4;

pub struct ThreadPoolAio {
    jobs: Sender<Job>,
    shared: Arc<Shared>,
}

impl ThreadPoolAio {
    /// Spawns `workers` (at least 1) long-lived worker threads pulling jobs
    /// from a shared queue.
    pub fn new(workers: usize) -> std::io::Result<Arc<Self>> {
        let wakeup = eventfd::create()?;
        let shared = Arc::new(Shared {
            completed: Mutex::new(VecDeque::new()),
            wakeup,
        });
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..workers.max(1) {
            let rx = rx.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("fluxion-aio-worker-{i}"))
                .spawn(move || worker_loop(rx, shared))
                .expect("failed to spawn fluxion-aio worker thread");
        }
        Ok(Arc::new(ThreadPoolAio { jobs: tx, shared }))
    }

    pub fn wakeup_fd(&self) -> RawFd {
        self.shared.wakeup.as_raw_fd()
    }

    fn queue(&self, kind: Kind, fd: RawFd, buf: Vec<u8>, offset: u64) -> Future<AioResult> {
        let (future, promise) = pending();
        let job = Job {
            kind,
            fd,
            buf,
            offset,
            promise,
        };
        self.jobs
            .send(job)
            .expect("fluxion-aio thread pool's workers have all exited");
        future
    }
}

fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Job>>>, shared: Arc<Shared>) {
    loop {
        let job = {
            let rx = rx.lock().unwrap();
            match rx.recv() {
                Ok(job) => job,
                Err(_) => return,
            }
        };
        let Job {
            kind,
            mut buf,
            fd,
            offset,
            promise,
        } = job;
        let result = unsafe {
            match kind {
                Kind::Read => libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), offset as libc::off_t),
                Kind::Write => libc::pwrite(fd, buf.as_ptr().cast(), buf.len(), offset as libc::off_t),
            }
        };
        let outcome: Outcome<AioResult> = if result >= 0 {
            Ok(Arc::new(AioResult {
                buf,
                n: result as usize,
            }))
        } else {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            Err(fluxion_future::Error::io(errno))
        };
        shared.completed.lock().unwrap().push_back(Completed { promise, outcome });
        eventfd::notify(shared.wakeup.as_raw_fd());
    }
}

impl AioBackend for ThreadPoolAio {
    fn read(&self, fd: RawFd, buf: Vec<u8>, offset: u64) -> Future<AioResult> {
        self.queue(Kind::Read, fd, buf, offset)
    }

    fn write(&self, fd: RawFd, buf: Vec<u8>, offset: u64) -> Future<AioResult> {
        self.queue(Kind::Write, fd, buf, offset)
    }
}

impl HostLoopSource for ThreadPoolAio {
    fn prepare(&self, _timeout: &mut Option<Duration>) -> bool {
        !self.shared.completed.lock().unwrap().is_empty()
    }

    fn check(&self) -> bool {
        !self.shared.completed.lock().unwrap().is_empty()
    }

    fn dispatch(&self) -> bool {
        eventfd::drain(self.shared.wakeup.as_raw_fd());
        let drained: Vec<Completed> = {
            let mut q = self.shared.completed.lock().unwrap();
            q.drain(..).collect()
        };
        for item in drained {
            let _ = item.promise.complete(item.outcome);
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
        let ctx = ThreadPoolAio::new(2).expect("eventfd unavailable in this environment");

        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0, "pipe(2) failed: {}", std::io::Error::last_os_error());
        let [read_fd, write_fd] = fds;

        let mut write_end = unsafe { std::fs::File::from_raw_fd(write_fd) };
        write_end.write_all(b"hello").unwrap();
        drop(write_end);

        let future = ctx.read(read_fd, vec![0u8; 5], 0);

        while !ctx.prepare(&mut None) {
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

    #[test]
    fn write_then_read_back_round_trips() {
        use std::os::fd::AsRawFd;

        let ctx = ThreadPoolAio::new(2).expect("eventfd unavailable in this environment");
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();

        let write_future = ctx.write(fd, b"abcde".to_vec(), 0);
        while !ctx.prepare(&mut None) {
            std::thread::sleep(Duration::from_millis(1));
        }
        ctx.dispatch();
        assert_eq!(write_future.peek().unwrap().unwrap().n, 5);

        let read_future = ctx.read(fd, vec![0u8; 5], 0);
        while !ctx.prepare(&mut None) {
            std::thread::sleep(Duration::from_millis(1));
        }
        ctx.dispatch();
        let result = read_future.peek().unwrap().unwrap();
        assert_eq!(&result.buf, b"abcde");
        // `file` stays alive (and owns `fd`) for the duration of both ops;
        // the backend never closes caller-owned descriptors.
    }
}
