//! CR: the stackful, symmetric coroutine primitive.
//!
//! Grounded on the original C++ source's `Coro.hpp`/`Coro.cpp`, which builds
//! coroutines directly on `ucontext_t`/`makecontext`/`swapcontext` rather than
//! through a higher-level stack-switching crate (see DESIGN.md for why
//! `context-rs`, `mioco`'s own dependency, was dropped in favor of calling
//! these through `libc` directly).

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::tls;

const STATE_IDLE: u8 = 0;
const STATE_IN_PROGRESS: u8 = 1;
const STATE_FINISHED: u8 = 2;

/// Minimum coroutine stack size, mirroring the original's reliance on
/// `SIGSTKSZ` as a floor.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// The return type of a coroutine's task: a pointer to the coroutine that
/// should run next. Returning null is a programmer error (§4.1 "Trampoline").
pub type Successor = *const Coroutine;

type Task = Box<dyn FnOnce() -> Successor>;

struct Stack {
    buf: Vec<u8>,
}

impl Stack {
    fn new(size: usize) -> Self {
        let size = size.max(MIN_STACK_SIZE);
        Stack {
            buf: vec![0u8; size],
        }
    }

    fn top_and_len(&mut self) -> (*mut libc::c_void, usize) {
        let len = self.buf.len();
        (self.buf.as_mut_ptr() as *mut libc::c_void, len)
    }
}

/// A stackful, independently schedulable execution context.
///
/// At most one OS thread observes `InProgress` for a given `Coroutine` at
/// any instant (enforced by the CAS in [`Coroutine::switch_to`]); `Finished`
/// is set exactly once and never cleared. A coroutine created from a thread
/// (the "main coroutine") must be destroyed on that same thread; a
/// non-main coroutine may only be destroyed when not `InProgress`.
pub struct Coroutine {
    state: AtomicU8,
    from_thread: bool,
    ctx: UnsafeCell<libc::ucontext_t>,
    _stack: Option<Stack>,
    /// Written by whichever `switch_to` call resumes this coroutine, just
    /// before the context swap; read back by this coroutine's own epilogue
    /// once it resumes, to learn who switched into it.
    resumed_by: Cell<*const Coroutine>,
    /// `(task, self)` consumed exactly once by the trampoline. `None` for
    /// the main coroutine, and for any coroutine after it has started.
    entry: UnsafeCell<Option<Task>>,
}

unsafe impl Send for Coroutine {}
unsafe impl Sync for Coroutine {}

thread_local! {
    /// Scratch slot used to hand a freshly-constructed coroutine's pointer
    /// to its own trampoline across the `makecontext`/`swapcontext` boundary,
    /// since `makecontext`'s varargs are limited to `int`-sized arguments.
    static BOOTSTRAP: Cell<*const Coroutine> = Cell::new(std::ptr::null());
}

impl Coroutine {
    /// Capture the calling thread's execution context as a "main coroutine".
    ///
    /// # Panics
    /// Panics (`CoroToCoro`, per §4.1) if called from inside an existing
    /// coroutine — a thread may have at most one main coroutine.
    pub fn main() -> Self {
        if tls::in_coroutine() {
            panic!("Coroutine::main() called from inside an existing coroutine");
        }
        let mut ctx: libc::ucontext_t = unsafe { std::mem::zeroed() };
        let rc = unsafe { getcontext(&mut ctx) };
        assert_eq!(rc, 0, "getcontext failed");
        let co = Coroutine {
            state: AtomicU8::new(STATE_IN_PROGRESS),
            from_thread: true,
            ctx: UnsafeCell::new(ctx),
            _stack: None,
            resumed_by: Cell::new(std::ptr::null()),
            entry: UnsafeCell::new(None),
        };
        unsafe { tls::set_current_coroutine(&co as *const Coroutine as *mut Coroutine) };
        co
    }

    /// Allocate a new coroutine with its own stack, that will run `task` once
    /// switched into. `task` must return the coroutine to transfer control to
    /// once it completes.
    pub fn new<F>(task: F, stack_size: usize) -> Self
    where
        F: FnOnce() -> Successor + 'static,
    {
        let mut stack = Stack::new(stack_size);
        let mut ctx: libc::ucontext_t = unsafe { std::mem::zeroed() };
        unsafe {
            let rc = getcontext(&mut ctx);
            assert_eq!(rc, 0, "getcontext failed");
        }
        let (sp, len) = stack.top_and_len();
        ctx.uc_stack.ss_sp = sp;
        ctx.uc_stack.ss_size = len;
        ctx.uc_stack.ss_flags = 0;
        ctx.uc_link = std::ptr::null_mut();
        unsafe {
            makecontext(&mut ctx, trampoline, 0);
        }

        Coroutine {
            state: AtomicU8::new(STATE_IDLE),
            from_thread: false,
            ctx: UnsafeCell::new(ctx),
            _stack: Some(stack),
            resumed_by: Cell::new(std::ptr::null()),
            entry: UnsafeCell::new(Some(Box::new(task))),
        }
    }

    /// `true` once this coroutine's task has returned.
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) & STATE_FINISHED != 0
    }

    fn is_in_progress(&self) -> bool {
        self.state.load(Ordering::Acquire) & STATE_IN_PROGRESS != 0
    }

    /// Attempt to CAS this coroutine from "all clear" into `InProgress`.
    /// Fails (returns `false`) if the coroutine is already running or has
    /// already finished.
    fn try_acquire(&self) -> bool {
        self.state
            .compare_exchange(STATE_IDLE, STATE_IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn clear_in_progress(&self) {
        self.state.fetch_and(!STATE_IN_PROGRESS, Ordering::AcqRel);
    }

    fn mark_finished(&self) {
        self.state.fetch_or(STATE_FINISHED, Ordering::AcqRel);
    }

    /// Symmetrically transfer control from the calling coroutine to
    /// `target`. Returns `false` without switching if `target` is already
    /// running or finished. `switch_to(self)` is a no-op returning `true`.
    ///
    /// On success, returns the coroutine that, much later, resumed the
    /// caller (available once this call returns — i.e. the *next* time the
    /// calling coroutine runs).
    pub fn switch_to(&self, target: &Coroutine) -> Option<*const Coroutine> {
        if std::ptr::eq(self, target) {
            return Some(self as *const Coroutine);
        }

        if !target.try_acquire() {
            return None;
        }

        target.resumed_by.set(self as *const Coroutine);

        unsafe {
            swapcontext(self.ctx.get(), target.ctx.get() as *const _);
        }

        // Resumed: someone called switch_to(.., to=self) and its swapcontext
        // landed back here. `on_resumed` performs the shared epilogue.
        Some(on_resumed(self))
    }
}

/// Shared epilogue run both by a freshly-started coroutine's trampoline and
/// by a resumed `switch_to` call: publish `self` as the thread's current
/// coroutine and clear the `InProgress` bit of whoever switched into us.
fn on_resumed(co: &Coroutine) -> *const Coroutine {
    let prev = co.resumed_by.get();
    unsafe { tls::set_current_coroutine(co as *const Coroutine as *mut Coroutine) };
    if !prev.is_null() {
        unsafe { (*prev).clear_in_progress() };
    }
    prev
}

extern "C" fn trampoline() {
    let self_ptr = BOOTSTRAP.with(|b| b.get());
    debug_assert!(!self_ptr.is_null(), "trampoline entered without a bootstrapped coroutine");
    let co: &Coroutine = unsafe { &*self_ptr };

    on_resumed(co);

    let task = unsafe { (*co.entry.get()).take() }.expect("coroutine entered twice");
    let successor = task();

    co.mark_finished();

    if successor.is_null() {
        panic!("coroutine task returned a null successor — this is a programmer error");
    }
    let successor: &Coroutine = unsafe { &*successor };
    // This switch_to must never return: nothing may resume a Finished
    // coroutine again.
    co.switch_to(successor);
    unreachable!("a Finished coroutine was resumed");
}

/// Must be called (on the thread that will run the new coroutine for the
/// first time) immediately before the very first `switch_to` into `co`, so
/// the trampoline can recover `co`'s address.
pub(crate) fn arm_bootstrap(co: &Coroutine) {
    BOOTSTRAP.with(|b| b.set(co as *const Coroutine));
}

extern "C" {
    fn getcontext(ucp: *mut libc::ucontext_t) -> libc::c_int;
    fn makecontext(ucp: *mut libc::ucontext_t, func: extern "C" fn(), argc: libc::c_int, ...);
    fn swapcontext(oucp: *mut libc::ucontext_t, ucp: *const libc::ucontext_t) -> libc::c_int;
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        if self.from_thread {
            debug_assert!(
                tls::current_coroutine() == Some(self as *const Coroutine as *mut Coroutine),
                "main coroutine must be destroyed from the thread that created it, while current"
            );
        } else {
            debug_assert!(
                !self.is_in_progress(),
                "a non-main coroutine may only be destroyed when not in progress"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn main_coroutine_is_current() {
        let main = Coroutine::main();
        assert!(tls::in_coroutine());
        assert!(!main.is_done());
    }

    #[test]
    fn switch_to_self_is_noop() {
        let main = Coroutine::main();
        let r = main.switch_to(&main);
        assert_eq!(r, Some(&main as *const Coroutine));
    }

    #[test]
    fn coroutine_runs_and_finishes() {
        let main = Coroutine::main();
        let ran = Rc::new(RefCell::new(false));
        let ran2 = ran.clone();

        // Leak the target coroutine and main's address for the trampoline
        // closure; this mirrors how `service.rs` keeps coroutines boxed for
        // their whole lifetime.
        let main_ptr: *const Coroutine = &main;
        let co = Box::new(Coroutine::new(
            move || {
                *ran2.borrow_mut() = true;
                main_ptr
            },
            MIN_STACK_SIZE,
        ));
        let co_ptr: *const Coroutine = &*co;
        arm_bootstrap(&co);
        main.switch_to(unsafe { &*co_ptr });

        assert!(*ran.borrow());
        assert!(co.is_done());
    }
}
