//! Shared suspend/resume plumbing used by every DS sync primitive (§4.7) and
//! by [`crate::timer`]'s `Timer::wait`.
//!
//! Every primitive in `sync.rs` follows the same shape `execute_io` does
//! (§4.6): install a deferred task that publishes the waiter only once this
//! coroutine's `InProgress` bit is guaranteed clear, then transfer to the
//! thread's main coroutine. Publishing any earlier would let a concurrent
//! `unlock`/`push`/`set` resume a coroutine that has not actually suspended
//! yet, losing the wakeup. Resumption itself always goes through the
//! service's ready queue (`post_coro`) rather than a direct `switch_to`: a
//! sync primitive has no notion of "the thread that will run next", unlike
//! the reactor, which resumes on the thread that observed the event.

use crate::coroutine::Coroutine;
use crate::service;
use crate::tls;

/// Suspend the calling coroutine. `register` runs once, on this thread's
/// main coroutine, immediately after control has transferred away from the
/// caller — the only point at which it is safe to publish the caller as a
/// waiter to other threads.
pub(crate) fn suspend(register: Box<dyn FnOnce()>) {
    let worker_ptr =
        tls::current_worker().expect("blocked on a sync primitive outside a service worker");
    let worker = unsafe { &*worker_ptr };
    worker.defer(register);

    let co_ptr =
        tls::current_coroutine().expect("blocked on a sync primitive outside a coroutine");
    let main: &Coroutine = unsafe { &*worker.main };
    let current: &Coroutine = unsafe { &*co_ptr };
    current.switch_to(main);
}

/// Post `co` onto the ready queue of the service running on this thread.
/// Callable from within a deferred registration closure (which runs with the
/// thread's main coroutine current) or from plain coroutine code.
pub(crate) fn resume(co: *const Coroutine) {
    if let Some(inner) = service::current_inner() {
        inner.post_coro(co);
    }
}
