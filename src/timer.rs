//! `Timer`: a DS sync primitive built on the time-task queue (§4.7).
//!
//! Grounded on the original C++ `Timer.hpp`/`Timer.cpp`, with the public
//! surface named after `mioco::timer::Timer`'s `read`/`set_timeout` pair,
//! generalized to the spec's `expires_after`/`wait`/`cancel`/`close`
//! contract. `expires_after` arms a [`crate::timer_queue::CancellableTask`];
//! `wait` suspends on a waiter list exactly like [`crate::sync::Event`]'s,
//! and is resumed either by the task firing (normal completion) or by
//! `cancel` (which flips the task's consumed flag and resumes every current
//! waiter with `OperationAborted`, matching `Timer.cpp`'s `Cancel`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::blocking;
use crate::coroutine::Coroutine;
use crate::error::{Error, ErrorKind, Result};
use crate::lf::ForwardList;
use crate::service::{self, Inner};
use crate::tls;
use crate::timer_queue::{get_queue, CancellableTask, TimeTaskQueue};

struct Waiter {
    coro: *const Coroutine,
    was_cancelled: AtomicBool,
}

#[derive(Clone, Copy)]
struct WaiterPtr(*const Waiter);
unsafe impl Send for WaiterPtr {}

struct State {
    queue: TimeTaskQueue,
    waiters: ForwardList<WaiterPtr>,
    fired: AtomicBool,
    closed: AtomicBool,
    pending: Mutex<Option<Arc<CancellableTask>>>,
    // The service `fire` must post back into: captured from the coroutine
    // that calls `expires_after`, since `fire` itself runs on the dedicated
    // timer-queue thread (`timer_queue::run_loop`), which has no worker TLS
    // of its own for `blocking::resume`'s `current_inner()` to find.
    inner: Mutex<Option<Arc<Inner>>>,
}

fn fire(state: &Arc<State>) {
    state.fired.store(true, Ordering::Release);
    let inner = state
        .inner
        .lock()
        .unwrap()
        .clone()
        .expect("fire() runs only after expires_after() has recorded the service handle");
    let mut view = state.waiters.release();
    while let Some(w) = view.pop() {
        inner.post_coro(unsafe { (*w.0).coro });
    }
}

/// A one-shot countdown, rearmable once it has fired (§4.7).
pub struct Timer {
    state: Arc<State>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// A fresh timer starts with no deadline armed (`fired` is true) so that
    /// `wait()` without a prior `expires_after` returns immediately instead
    /// of blocking on an event that was never scheduled.
    pub fn new() -> Self {
        Timer {
            state: Arc::new(State {
                queue: get_queue(),
                waiters: ForwardList::new(),
                fired: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                pending: Mutex::new(None),
                inner: Mutex::new(None),
            }),
        }
    }

    /// Arm the timer to fire after `dur`. Fails `TimerNotExpired` if a prior
    /// deadline is still pending (§4.7).
    pub fn expires_after(&self, dur: Duration) -> Result<()> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::WasClosed));
        }
        let mut pending = self.state.pending.lock().unwrap();
        if let Some(p) = pending.as_ref() {
            if !p.is_consumed() {
                return Err(Error::new(ErrorKind::TimerNotExpired));
            }
        }
        self.state.fired.store(false, Ordering::Release);
        *self.state.inner.lock().unwrap() = Some(
            service::current_inner()
                .expect("Timer::expires_after called outside a running service"),
        );
        let state = self.state.clone();
        let task = self.state.queue.add_after(dur, move || fire(&state));
        *pending = Some(task);
        Ok(())
    }

    /// Block until the current deadline fires or the timer is cancelled.
    pub fn wait(&self) -> Result<()> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::WasClosed));
        }
        if self.state.fired.load(Ordering::Acquire) {
            return Ok(());
        }

        let co_ptr = tls::current_coroutine().expect("Timer::wait called outside a coroutine");
        let waiter = Waiter {
            coro: co_ptr,
            was_cancelled: AtomicBool::new(false),
        };
        let waiter_ptr = WaiterPtr(&waiter as *const Waiter);
        let state = self.state.clone();

        blocking::suspend(Box::new(move || {
            state.waiters.push(waiter_ptr);
            // Recheck: the deadline may have fired (or the timer been
            // cancelled) between our fast check and this push becoming
            // visible. If so, drain whatever is queued now and resume it,
            // rather than leaving a waiter stuck on an event that already
            // happened.
            if state.fired.load(Ordering::Acquire) {
                let mut view = state.waiters.release();
                while let Some(w) = view.pop() {
                    blocking::resume(unsafe { (*w.0).coro });
                }
            }
        }));

        if waiter.was_cancelled.load(Ordering::Acquire) {
            Err(Error::new(ErrorKind::OperationAborted))
        } else {
            Ok(())
        }
    }

    /// Cancel the current deadline if it has not yet fired, resuming every
    /// current waiter with `OperationAborted`. Returns whether this call
    /// actually cancelled the deadline (it may have already fired).
    pub fn cancel(&self) -> bool {
        let pending = self.state.pending.lock().unwrap();
        let won = pending.as_ref().map(|p| p.cancel()).unwrap_or(false);
        drop(pending);
        if won {
            let mut view = self.state.waiters.release();
            while let Some(w) = view.pop() {
                unsafe {
                    (*w.0).was_cancelled.store(true, Ordering::Release);
                    blocking::resume((*w.0).coro);
                }
            }
        }
        won
    }

    /// Permanently close the timer: cancels any pending deadline and fails
    /// every future `expires_after`/`wait` with `WasClosed`.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.cancel();
    }
}

unsafe impl Send for Timer {}
unsafe impl Sync for Timer {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Config, Service};
    use std::sync::mpsc;
    use std::thread;

    /// Run `body` inside a coroutine on a freshly started one-thread service,
    /// since `expires_after` now needs a running service to post the fired
    /// timer's waiters back through.
    fn in_service<F>(body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let svc = Service::new(Config::default()).expect("create service");
        let runner = svc.clone();
        let handle = thread::spawn(move || runner.run());
        let (done_tx, done_rx) = mpsc::channel::<()>();
        svc.add_coro(move || {
            body();
            let _ = done_tx.send(());
        });
        done_rx.recv_timeout(Duration::from_secs(5)).expect("coroutine finished");
        svc.stop();
        handle.join().expect("worker thread panicked").expect("service run");
    }

    #[test]
    fn fresh_timer_wait_does_not_block() {
        in_service(|| {
            let t = Timer::new();
            assert!(t.wait().is_ok());
        });
    }

    #[test]
    fn expires_after_twice_without_firing_is_rejected() {
        in_service(|| {
            let t = Timer::new();
            t.expires_after(Duration::from_secs(5)).unwrap();
            let err = t.expires_after(Duration::from_secs(5)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::TimerNotExpired);
            assert!(t.cancel());
        });
    }

    #[test]
    fn close_rejects_further_arming() {
        in_service(|| {
            let t = Timer::new();
            t.close();
            let err = t.expires_after(Duration::from_millis(1)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WasClosed);
        });
    }

    #[test]
    fn expires_after_wait_resumes_through_the_service() {
        in_service(|| {
            let t = Timer::new();
            t.expires_after(Duration::from_millis(20)).unwrap();
            assert!(t.wait().is_ok());
        });
    }
}
