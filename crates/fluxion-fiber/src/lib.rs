//! Stackful coroutines.
//!
//! A [`Fiber`] runs a closure on its own stack and can be suspended
//! mid-call via [`Suspend::suspend`], handing control back to whatever
//! resumed it along with a `Yield` value, and later resumed again with a
//! `Resume` value picking up exactly where it left off. This is the
//! primitive the scheduler uses to let a unit of work block on a future
//! without blocking the thread: the future's completion callback resumes
//! the fiber that's waiting on it.
//!
//! On Unix this is built from scratch: a pooled, guard-paged [`stack::Stack`]
//! and a hand-written assembly context switch (`src/arch/*.s`) that saves
//! and restores only the callee-saved registers and the stack pointer,
//! exactly like an ordinary function call except that the "call" returns on
//! a different stack than it was made from. On Windows the native Win32
//! Fiber API already provides this, so we ride it directly instead.

use std::any::Any;
use std::marker::PhantomData;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod stack;
        mod unix;
        pub use stack::{Stack, StackConfig, StackPool};
    } else if #[cfg(windows)] {
        mod windows;
    }
}

/// What happened the last time a fiber ran.
pub enum RunResult<Yield, Return> {
    /// The fiber called [`Suspend::suspend`] with this value and is parked,
    /// waiting to be resumed.
    Yield(Yield),
    /// The fiber's body returned. The fiber is now finished; resuming it
    /// again is a programming error.
    Return(Return),
    /// The fiber's body panicked. The payload can be re-raised with
    /// [`std::panic::resume_unwind`].
    Panicked(Box<dyn Any + Send>),
}

enum Transfer<Yield, Return> {
    Yield(Yield),
    Return(Return),
    Panicked(Box<dyn Any + Send>),
}

/// A raw pointer wrapper asserting it's safe to move across the fiber/host
/// boundary. Sound because the pointee (`Shared`) outlives both sides by
/// construction: it's owned by the `Fiber`, which cannot be dropped while
/// suspended (that would leak the stack mid-use), and the fiber body only
/// ever touches it while it is the active, resumed side.
struct SendPtr<T>(*const T);
unsafe impl<T> Send for SendPtr<T> {}

#[cfg(unix)]
mod unix_shared {
    use std::cell::UnsafeCell;

    pub(crate) struct Platform {
        pub(crate) host_sp: UnsafeCell<*mut u8>,
        pub(crate) fiber_sp: UnsafeCell<*mut u8>,
    }

    // SAFETY: access is synchronized by construction — only one of the host
    // or the fiber is ever running at a time, and a context switch is a
    // full memory barrier (it's implemented with a `mov`-based save/restore
    // in assembly, not a compiler-visible operation the optimizer could
    // reorder across).
    unsafe impl Send for Platform {}
    unsafe impl Sync for Platform {}

    impl Platform {
        pub(crate) fn new() -> Self {
            Platform {
                host_sp: UnsafeCell::new(std::ptr::null_mut()),
                fiber_sp: UnsafeCell::new(std::ptr::null_mut()),
            }
        }
    }
}

#[cfg(windows)]
mod windows_shared {
    use std::cell::UnsafeCell;
    use std::ffi::c_void;

    pub(crate) struct Platform {
        pub(crate) host_fiber: UnsafeCell<*mut c_void>,
    }

    unsafe impl Send for Platform {}
    unsafe impl Sync for Platform {}

    impl Platform {
        pub(crate) fn new() -> Self {
            Platform {
                host_fiber: UnsafeCell::new(std::ptr::null_mut()),
            }
        }
    }
}

#[cfg(unix)]
use unix_shared::Platform;
#[cfg(windows)]
use windows_shared::Platform;

struct Shared<Resume, Yield, Return> {
    resume_slot: std::cell::UnsafeCell<Option<Resume>>,
    transfer: std::cell::UnsafeCell<Option<Transfer<Yield, Return>>>,
    platform: Platform,
}

impl<Resume, Yield, Return> Shared<Resume, Yield, Return> {
    fn new() -> Self {
        Shared {
            resume_slot: std::cell::UnsafeCell::new(None),
            transfer: std::cell::UnsafeCell::new(None),
            platform: Platform::new(),
        }
    }
}

/// A handle the fiber body uses to hand control back to whoever resumed it.
///
/// Borrowed for the duration of a single call into the fiber's closure;
/// storing it anywhere longer-lived is a logic error (there is nothing to
/// suspend to once the closure returns).
pub struct Suspend<Resume, Yield, Return> {
    shared: SendPtr<Shared<Resume, Yield, Return>>,
}

impl<Resume, Yield, Return> Suspend<Resume, Yield, Return> {
    /// Hands `value` back to the resumer and blocks until the fiber is
    /// resumed again, returning whatever [`Fiber::resume`] was called with.
    pub fn suspend(&self, value: Yield) -> Resume {
        unsafe {
            let shared = &*self.shared.0;
            *shared.transfer.get() = Some(Transfer::Yield(value));
            switch_to_host(shared);
            (*shared.resume_slot.get())
                .take()
                .expect("fiber resumed without a resume value")
        }
    }
}

#[cfg(unix)]
extern "C" {
    fn fluxion_fiber_switch(save_sp: *mut *mut u8, load_sp: *mut u8);
}

#[cfg(unix)]
#[no_mangle]
unsafe extern "C" fn fluxion_fiber_run_initial(env: *mut u8) -> ! {
    let thunk: Box<dyn FnOnce() + Send> = *Box::from_raw(env.cast());
    thunk();
    unreachable!("a fiber's entry thunk must switch back to the host, not return");
}

#[cfg(unix)]
unsafe fn switch_to_host<R, Y, Ret>(shared: &Shared<R, Y, Ret>) {
    let host_sp = *shared.platform.host_sp.get();
    fluxion_fiber_switch(shared.platform.fiber_sp.get(), host_sp);
}

#[cfg(unix)]
unsafe fn switch_to_fiber<R, Y, Ret>(shared: &Shared<R, Y, Ret>, target_sp: *mut u8) {
    fluxion_fiber_switch(shared.platform.host_sp.get(), target_sp);
}

#[cfg(unix)]
extern "C" {
    fn fluxion_fiber_start();
}

/// Writes the fake saved-register frame a brand-new stack needs so that the
/// first `fluxion_fiber_switch` into it falls through to `fluxion_fiber_start`
/// with `thunk` threaded through in the registers the trampoline reads.
///
/// `fluxion_fiber_switch`'s `pop` sequence restores, in order,
/// r15, r14, r13, r12, rbx, rbp, then returns — so this lays out exactly
/// that frame, placing `thunk`'s low/high halves in the r12/r13 slots
/// (`src/arch/x86_64.s` and `src/arch/aarch64.s` document the matching
/// layout for each architecture).
#[cfg(all(unix, target_arch = "x86_64"))]
unsafe fn prime_stack(top: *mut u8, thunk: *mut u8) -> *mut u8 {
    const WORDS: usize = 7;
    let aligned_top = (top as usize) & !0xf;
    let base = (aligned_top - WORDS * 8) as *mut usize;
    let addr = thunk as usize;
    base.add(0).write(0); // r15 (unused by the trampoline)
    base.add(1).write(0); // r14 (unused by the trampoline)
    base.add(2).write(addr >> 32); // r13: high half of thunk pointer
    base.add(3).write(addr & 0xffff_ffff); // r12: low half of thunk pointer
    base.add(4).write(0); // rbx (unused by the trampoline)
    base.add(5).write(0); // rbp (unused by the trampoline)
    base.add(6).write(fluxion_fiber_start as usize); // return address
    base.cast()
}

#[cfg(all(unix, target_arch = "aarch64"))]
unsafe fn prime_stack(top: *mut u8, thunk: *mut u8) -> *mut u8 {
    // `src/arch/aarch64.s` pushes, in order, x19/x20, x21/x22, x23/x24,
    // x25/x26, x27/x28, x29/x30, d8/d9, d10/d11, d12/d13, d14/d15, each
    // `stp`. Since the stack grows down, from the saved `sp` upward that's
    // d14/d15 first (words 0-1) ... x29/x30 at words 8-9 ... and x19/x20
    // last, at words 18-19 — the first pair the `ldp` sequence restores.
    const WORDS: usize = 20;
    let aligned_top = (top as usize) & !0xf;
    let base = (aligned_top - WORDS * 8) as *mut usize;
    let addr = thunk as usize;
    for i in 0..WORDS {
        base.add(i).write(0);
    }
    base.add(9).write(fluxion_fiber_start as usize); // x30 (lr) / return addr
    base.add(18).write(addr & 0xffff_ffff); // x19: low half
    base.add(19).write(addr >> 32); // x20: high half
    base.cast()
}

/// A suspended, resumable unit of execution running on its own stack.
pub struct Fiber<Resume, Yield, Return> {
    shared: Box<Shared<Resume, Yield, Return>>,
    started: bool,
    done: bool,
    #[cfg(unix)]
    stack: Option<Stack>,
    #[cfg(unix)]
    fiber_sp: *mut u8,
    #[cfg(windows)]
    win: Option<windows::WinFiber>,
    #[cfg(windows)]
    func: Option<Box<dyn FnOnce(Resume, &Suspend<Resume, Yield, Return>) -> Return + Send>>,
    _marker: PhantomData<(Resume, Yield, Return)>,
}

impl<Resume, Yield, Return> Fiber<Resume, Yield, Return>
where
    Resume: Send + 'static,
    Yield: Send + 'static,
    Return: Send + 'static,
{
    /// Creates a fiber that will run `func` on `stack` the first time it is
    /// resumed. `func` is not called until then.
    #[cfg(unix)]
    pub fn new(
        stack: Stack,
        func: impl FnOnce(Resume, &Suspend<Resume, Yield, Return>) -> Return + Send + 'static,
    ) -> Self {
        let shared = Box::new(Shared::new());
        let shared_ptr = SendPtr(shared.as_ref() as *const Shared<Resume, Yield, Return>);

        let thunk: Box<dyn FnOnce() + Send> = Box::new(move || {
            let shared_ptr = shared_ptr;
            let shared = unsafe { &*shared_ptr.0 };
            let resume0 = unsafe {
                (*shared.resume_slot.get())
                    .take()
                    .expect("fiber started without an initial resume value")
            };
            let suspend = Suspend {
                shared: SendPtr(shared_ptr.0),
            };
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                func(resume0, &suspend)
            }));
            let transfer = match outcome {
                Ok(ret) => Transfer::Return(ret),
                Err(payload) => Transfer::Panicked(payload),
            };
            unsafe {
                *shared.transfer.get() = Some(transfer);
                switch_to_host(shared);
            }
            unreachable!("a finished fiber must not be resumed again");
        });

        let thunk_ptr = Box::into_raw(Box::new(thunk)).cast::<u8>();
        let fiber_sp = unsafe { prime_stack(stack.initial_sp(), thunk_ptr) };

        Fiber {
            shared,
            started: false,
            done: false,
            stack: Some(stack),
            fiber_sp,
            _marker: PhantomData,
        }
    }

    /// Reclaims this fiber's stack so a [`StackPool`] can hand it to a new
    /// fiber instead of mapping a fresh one. Panics unless the fiber has
    /// already finished (returned or panicked) or the stack was already
    /// reclaimed.
    #[cfg(unix)]
    pub fn take_stack(&mut self) -> Stack {
        assert!(self.done, "stack reclaimed from a fiber that hasn't finished");
        self.stack.take().expect("fiber stack already reclaimed")
    }

    #[cfg(windows)]
    pub fn new(
        stack_size: usize,
        func: impl FnOnce(Resume, &Suspend<Resume, Yield, Return>) -> Return + Send + 'static,
    ) -> Self {
        let shared = Box::new(Shared::new());
        let _ = stack_size; // CreateFiberEx reserves/commits lazily below.
        Fiber {
            shared,
            started: false,
            done: false,
            win: None,
            func: Some(Box::new(func)),
            _marker: PhantomData,
        }
    }

    /// True once the fiber's body has returned or panicked.
    pub fn done(&self) -> bool {
        self.done
    }

    /// Resumes the fiber, blocking the caller until it either suspends
    /// again or finishes.
    #[cfg(unix)]
    pub fn resume(&mut self, input: Resume) -> RunResult<Yield, Return> {
        assert!(!self.done, "resumed a finished fiber");
        unsafe {
            *self.shared.resume_slot.get() = Some(input);
            self.started = true;
            switch_to_fiber(&self.shared, self.fiber_sp);
            let result = match (*self.shared.transfer.get()).take() {
                Some(Transfer::Yield(y)) => RunResult::Yield(y),
                Some(Transfer::Return(r)) => {
                    self.done = true;
                    RunResult::Return(r)
                }
                Some(Transfer::Panicked(p)) => {
                    self.done = true;
                    RunResult::Panicked(p)
                }
                None => unreachable!("fiber switched back without recording a transfer"),
            };
            if !self.done {
                // The fiber recorded where it left off when it suspended;
                // that's the stack pointer the next `resume` must target.
                self.fiber_sp = *self.shared.platform.fiber_sp.get();
            }
            result
        }
    }

    #[cfg(windows)]
    pub fn resume(&mut self, input: Resume) -> RunResult<Yield, Return> {
        use std::ffi::c_void;
        use windows::{ThreadFiber, WinFiber};

        assert!(!self.done, "resumed a finished fiber");
        unsafe {
            *self.shared.resume_slot.get() = Some(input);
        }

        if self.win.is_none() {
            let host = ThreadFiber::current().expect("ConvertThreadToFiber failed");
            unsafe {
                *self.shared.platform.host_fiber.get() = host.raw();
            }
            let shared_ptr = SendPtr(self.shared.as_ref() as *const Shared<Resume, Yield, Return>);
            let func = self.func.take().expect("fiber already started");
            let thunk: Box<Box<dyn FnOnce() + Send>> = Box::new(Box::new(move || {
                let shared_ptr = shared_ptr;
                let shared = unsafe { &*shared_ptr.0 };
                let resume0 = unsafe {
                    (*shared.resume_slot.get())
                        .take()
                        .expect("fiber started without an initial resume value")
                };
                let suspend = Suspend {
                    shared: SendPtr(shared_ptr.0),
                };
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    func(resume0, &suspend)
                }));
                let transfer = match outcome {
                    Ok(ret) => Transfer::Return(ret),
                    Err(payload) => Transfer::Panicked(payload),
                };
                unsafe {
                    *shared.transfer.get() = Some(transfer);
                }
                let host_fiber = unsafe { *shared.platform.host_fiber.get() };
                unsafe {
                    windows_sys::Win32::System::Threading::SwitchToFiber(host_fiber);
                }
                unreachable!("a finished fiber must not be resumed again");
            }));
            let param = Box::into_raw(thunk).cast::<c_void>();
            let win = WinFiber::new(64 << 10, 8 << 20, Some(fiber_entry), param)
                .expect("CreateFiberEx failed");
            std::mem::forget(host);
            self.win = Some(win);
            self.started = true;
        }

        self.win.as_ref().unwrap().switch_to();

        unsafe {
            match (*self.shared.transfer.get()).take() {
                Some(Transfer::Yield(y)) => RunResult::Yield(y),
                Some(Transfer::Return(r)) => {
                    self.done = true;
                    RunResult::Return(r)
                }
                Some(Transfer::Panicked(p)) => {
                    self.done = true;
                    RunResult::Panicked(p)
                }
                None => unreachable!("fiber switched back without recording a transfer"),
            }
        }
    }
}

#[cfg(windows)]
unsafe extern "system" fn fiber_entry(param: *mut std::ffi::c_void) {
    let thunk: Box<dyn FnOnce() + Send> = *Box::from_raw(param.cast());
    thunk();
}

#[cfg(unix)]
impl<Resume, Yield, Return> Drop for Fiber<Resume, Yield, Return> {
    fn drop(&mut self) {
        if self.started && !self.done {
            tracing::debug!("dropping a suspended fiber; its stack is leaked by design rather than force-resumed");
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn new_stack() -> Stack {
        let pool = Arc::new(StackPool::new(256 << 10, 4 << 10, 2));
        pool.allocate().unwrap()
    }

    #[test]
    fn run_to_completion_without_suspending() {
        let mut fiber: Fiber<i32, (), i32> = Fiber::new(new_stack(), |input, _suspend| input * 2);
        match fiber.resume(21) {
            RunResult::Return(42) => {}
            _ => panic!("expected Return(42)"),
        }
        assert!(fiber.done());
    }

    #[test]
    fn suspend_and_resume_round_trips_values() {
        let mut fiber: Fiber<i32, i32, i32> = Fiber::new(new_stack(), |input, suspend| {
            let a = suspend.suspend(input + 1);
            let b = suspend.suspend(a + 1);
            b + 1
        });

        match fiber.resume(0) {
            RunResult::Yield(1) => {}
            _ => panic!("expected Yield(1)"),
        }
        match fiber.resume(10) {
            RunResult::Yield(11) => {}
            _ => panic!("expected Yield(11)"),
        }
        match fiber.resume(100) {
            RunResult::Return(101) => {}
            _ => panic!("expected Return(101)"),
        }
        assert!(fiber.done());
    }

    #[test]
    fn panic_in_body_is_captured() {
        let mut fiber: Fiber<(), (), ()> = Fiber::new(new_stack(), |_input, _suspend| {
            panic!("boom");
        });
        match fiber.resume(()) {
            RunResult::Panicked(_) => {}
            _ => panic!("expected Panicked"),
        }
        assert!(fiber.done());
    }
}
