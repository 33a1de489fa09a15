//! Unix stack mapping: one anonymous, page-aligned region with a
//! `PROT_NONE` guard at the low end.

use std::io;
use std::ptr::NonNull;

use rustix::mm::{mmap_anonymous, mprotect, munmap, MapFlags, MprotectFlags, ProtFlags};

pub(crate) fn page_size() -> usize {
    rustix::param::page_size()
}

/// Maps `total_len` bytes (already page-rounded), carves out the first
/// `guard_len` bytes as an inaccessible guard page, and leaves the rest
/// read-write.
pub(crate) unsafe fn map_guarded(total_len: usize, guard_len: usize) -> io::Result<*mut u8> {
    let addr = mmap_anonymous(
        std::ptr::null_mut(),
        total_len,
        ProtFlags::empty(),
        MapFlags::PRIVATE,
    )
    .map_err(io::Error::from)?;

    let usable = addr.cast::<u8>().add(guard_len);
    if let Err(err) = mprotect(
        NonNull::new(usable).unwrap().as_ptr().cast(),
        total_len - guard_len,
        MprotectFlags::READ | MprotectFlags::WRITE,
    ) {
        let _ = munmap(addr, total_len);
        return Err(io::Error::from(err));
    }

    Ok(addr.cast())
}

pub(crate) unsafe fn unmap(base: *mut u8, len: usize) {
    let _ = munmap(base.cast(), len);
}
