//! A tiny shared helper: both AIO backends notify a blocked host loop by
//! writing to an eventfd-style counter, the wakeup file descriptor
//! registered for completion notifications on the AIO context.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

use rustix::event::{eventfd, EventfdFlags};

pub(crate) fn create() -> io::Result<OwnedFd> {
    eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).map_err(io::Error::from)
}

/// Drains the eventfd's 64-bit counter so a subsequent `poll`/`epoll` wait
/// blocks again instead of immediately returning readable.
pub(crate) fn drain(fd: RawFd) {
    let mut buf = [0u8; 8];
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let _ = rustix::io::read(borrowed, &mut buf);
}

pub(crate) fn notify(fd: RawFd) {
    let one: u64 = 1;
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let _ = rustix::io::write(borrowed, &one.to_ne_bytes());
}
