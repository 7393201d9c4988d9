//! CR-TLS: the only process-wide global state this crate exposes.
//!
//! A thin wrapper over `std::thread_local!`, used exactly to hold the
//! per-thread "current coroutine" and "current service worker" pointers, the
//! way `mioco::thread::TL_CURRENT_COROUTINE` does.

use std::cell::Cell;
use std::ptr;

use crate::coroutine::Coroutine;
use crate::service::WorkerContext;

thread_local! {
    static CURRENT_COROUTINE: Cell<*mut Coroutine> = Cell::new(ptr::null_mut());
    static CURRENT_WORKER: Cell<*const WorkerContext> = Cell::new(ptr::null());
}

/// Record `coro` as the coroutine currently running on this thread.
///
/// # Safety
/// `coro` must remain valid (the coroutine must not be destroyed) for as
/// long as it is recorded as current. The trampoline and `switch_to` are the
/// only callers.
pub(crate) unsafe fn set_current_coroutine(coro: *mut Coroutine) {
    CURRENT_COROUTINE.with(|c| c.set(coro));
}

/// The coroutine currently running on this thread, or `None` if this thread
/// is not inside any coroutine (main or otherwise).
pub(crate) fn current_coroutine() -> Option<*mut Coroutine> {
    let ptr = CURRENT_COROUTINE.with(|c| c.get());
    if ptr.is_null() {
        None
    } else {
        Some(ptr)
    }
}

/// Record `worker` as the service worker context owning this thread.
///
/// # Safety
/// `worker` must outlive the period during which it is recorded; `Service`
/// guarantees this by keeping `WorkerContext` alive for the lifetime of
/// `run`.
pub(crate) unsafe fn set_current_worker(worker: *const WorkerContext) {
    CURRENT_WORKER.with(|c| c.set(worker));
}

/// The worker context for the service running on this thread, if any.
pub(crate) fn current_worker() -> Option<*const WorkerContext> {
    let ptr = CURRENT_WORKER.with(|c| c.get());
    if ptr.is_null() {
        None
    } else {
        Some(ptr)
    }
}

/// Returns `true` when executing inside a service coroutine.
pub fn in_coroutine() -> bool {
    current_coroutine().is_some()
}
