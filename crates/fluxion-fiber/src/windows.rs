//! Windows backend: the native Win32 Fiber API already does everything our
//! hand-rolled Unix assembly does (its own guard-paged stack, its own
//! context switch), so there's no separate `Stack`/`StackPool` story here —
//! `CreateFiber` owns the stack for the lifetime of the `WinFiber`.

use std::ffi::c_void;
use std::io;
use std::ptr::NonNull;

use windows_sys::Win32::System::Threading::{
    ConvertFiberToThread, ConvertThreadToFiber, CreateFiberEx, DeleteFiber, SwitchToFiber,
    LPFIBER_START_ROUTINE,
};

/// Per-OS-thread bookkeeping: a thread must be converted to a fiber before
/// `SwitchToFiber` can target it, and converted back (or leaked) once fiber
/// use on that thread ends.
pub(crate) struct ThreadFiber {
    handle: NonNull<c_void>,
    converted: bool,
}

impl ThreadFiber {
    /// Converts the calling thread into a fiber, if it isn't one already.
    pub(crate) fn current() -> io::Result<Self> {
        let handle = unsafe { ConvertThreadToFiber(std::ptr::null()) };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(ThreadFiber {
            handle: NonNull::new(handle).unwrap(),
            converted: true,
        })
    }

    pub(crate) fn raw(&self) -> *mut c_void {
        self.handle.as_ptr()
    }
}

impl Drop for ThreadFiber {
    fn drop(&mut self) {
        if self.converted {
            unsafe {
                ConvertFiberToThread();
            }
        }
    }
}

/// A fiber created via `CreateFiberEx`, running `start` on its own stack
/// once first switched to.
pub(crate) struct WinFiber {
    handle: NonNull<c_void>,
}

unsafe impl Send for WinFiber {}

impl WinFiber {
    pub(crate) fn new(
        stack_commit: usize,
        stack_reserve: usize,
        start: LPFIBER_START_ROUTINE,
        param: *mut c_void,
    ) -> io::Result<Self> {
        let handle = unsafe { CreateFiberEx(stack_commit, stack_reserve, 0, start, param) };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(WinFiber {
            handle: NonNull::new(handle).unwrap(),
        })
    }

    pub(crate) fn switch_to(&self) {
        unsafe { SwitchToFiber(self.handle.as_ptr()) }
    }
}

impl Drop for WinFiber {
    fn drop(&mut self) {
        unsafe {
            DeleteFiber(self.handle.as_ptr());
        }
    }
}
