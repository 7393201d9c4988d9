//! DS: the descriptor layer — `BasicDescriptor`, the shared DS-Data it binds
//! to the reactor, and `execute_io`, the suspend-on-`EAGAIN` loop every
//! blocking-looking socket call is built from (§4.6).
//!
//! Grounded on the original C++ `BasicDescriptor.hpp`/`BasicDescriptorLinux.cpp`:
//! a kernel fd plus three waiter queues (read/write/read-oob), a shared/
//! exclusive lock guarding the fd's transition to invalid, and the two-phase
//! "arm, push, recheck" protocol that closes the edge-triggered lost-wakeup
//! race described in spec §4.6 "Why the elaborate dance". Where the original
//! keeps the descriptor alive under `close()` by deferring `DescriptorStruct`
//! destruction through the service's epoch deleter (because the reactor
//! holds a raw pointer to it), this reimplementation gets the same safety
//! more directly: `DsData` is held by `Arc`, and the service's fd registry
//! (`service::Inner`) stores only a `Weak<DsData>`, so a reactor event for a
//! descriptor that has already been dropped is simply a no-op lookup miss.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use nix::errno::Errno;

use crate::coroutine::Coroutine;
use crate::error::{Error, ErrorKind, Result};
use crate::lf::forward_list::ForwardList;
use crate::reactor::Interest;
use crate::service::{self, Inner};
use crate::tls;

fn interest_idx(interest: Interest) -> usize {
    match interest {
        Interest::Read => 0,
        Interest::Write => 1,
        Interest::ReadOob => 2,
    }
}

/// A waiter record. Lives on the suspended coroutine's own stack (it is a
/// local of [`execute_io`]) for as long as it is linked into a `DsData`
/// queue — never boxed, never moved (§3 "Waiter record", §9 "Stack-allocated
/// waiter records").
struct Waiter {
    coro: *const Coroutine,
    was_cancelled: AtomicBool,
}

/// Raw pointers aren't `Send` by default; a waiter only ever crosses threads
/// paired with the synchronization the ready queue / reactor already provide
/// (the pointee outlives every use because the owning coroutine stays
/// suspended until it is unlinked), so the wrapper asserts it explicitly.
#[derive(Clone, Copy)]
struct WaiterPtr(*const Waiter);
unsafe impl Send for WaiterPtr {}

/// DS-Data: the state shared between a `BasicDescriptor` and the reactor.
///
/// `fd < 0` iff the descriptor is closed (§3 "Descriptor state"). The three
/// `armed` flags mirror the original's per-class `std::atomic_flag`: `true`
/// means "no readiness event observed since this class was last armed",
/// `false` means "the reactor fired and nobody has reacted to it yet".
pub(crate) struct DsData {
    fd: RwLock<RawFd>,
    queues: [ForwardList<WaiterPtr>; 3],
    armed: [AtomicBool; 3],
}

impl DsData {
    fn new() -> Arc<Self> {
        Arc::new(DsData {
            fd: RwLock::new(-1),
            queues: [ForwardList::new(), ForwardList::new(), ForwardList::new()],
            armed: [AtomicBool::new(false), AtomicBool::new(false), AtomicBool::new(false)],
        })
    }

    fn is_open(&self) -> bool {
        *self.fd.read().unwrap() >= 0
    }

    /// Invalidate the fd (if open) and drain every waiter queue, marking each
    /// waiter cancelled. Returns the old fd and the drained waiters so the
    /// caller can close the fd and post the waiters (§4.6 `close`/`cancel`).
    fn take_fd_and_drain(&self) -> Option<(RawFd, Vec<WaiterPtr>)> {
        let mut guard = self.fd.write().unwrap();
        if *guard < 0 {
            return None;
        }
        let old = *guard;
        *guard = -1;
        drop(guard);
        Some((old, self.drain_queues()))
    }

    fn drain_queues(&self) -> Vec<WaiterPtr> {
        let mut out = Vec::new();
        for q in &self.queues {
            let mut view = q.release();
            while let Some(w) = view.pop() {
                unsafe { (*w.0).was_cancelled.store(true, Ordering::Release) };
                out.push(w);
            }
        }
        out
    }
}

fn direct_resume(waiter: WaiterPtr) {
    let main_ptr = tls::current_coroutine()
        .expect("descriptor resume must run on the worker's main coroutine");
    let main: &Coroutine = unsafe { &*main_ptr };
    let target: &Coroutine = unsafe { &*(*waiter.0).coro };
    main.switch_to(target);
}

/// Either resume `waiter` immediately (the reactor already fired for this
/// (fd, class) since it was armed) or register it on the queue and, if this
/// is the first waiter, rearm the sub-epoll (§4.6 step 5).
fn resume_or_register(
    data: &Arc<DsData>,
    idx: usize,
    fd: RawFd,
    interest: Interest,
    inner: &Arc<Inner>,
    waiter: WaiterPtr,
) {
    // Clear the "armed" flag for this class and check whether it had already
    // been cleared by a concurrent reactor firing between `task()` returning
    // EAGAIN and this closure running.
    let was_armed = data.armed[idx].swap(true, Ordering::AcqRel);
    if !was_armed {
        direct_resume(waiter);
        return;
    }

    let was_empty;
    {
        let guard = data.fd.read().unwrap();
        if *guard < 0 {
            drop(guard);
            unsafe { (*waiter.0).was_cancelled.store(true, Ordering::Release) };
            direct_resume(waiter);
            return;
        }
        was_empty = data.queues[idx].push(waiter);
    }
    if was_empty {
        let _ = inner.reactor().rearm(fd, interest);
    }

    // Recheck: did the kernel deliver the event between the push and the
    // rearm? If so, drain the queue ourselves rather than leaving the
    // waiter(s) registered for an edge that already fired.
    let still_armed = data.armed[idx].swap(true, Ordering::AcqRel);
    if !still_armed {
        let mut view = data.queues[idx].release();
        let first = match view.pop() {
            Some(w) => w,
            None => return,
        };
        while let Some(w) = view.pop() {
            inner.post_coro(unsafe { (*w.0).coro });
        }
        direct_resume(first);
    }
}

/// The suspend-on-`EAGAIN` loop (§4.6 `execute_io`). `task` attempts the
/// underlying syscall and must return `Err` carrying the raw errno on
/// failure; `EINTR` is retried in place, `EAGAIN`/`EWOULDBLOCK` suspends the
/// calling coroutine until `interest` is ready on `fd`, anything else (or
/// `Ok`) is returned unchanged.
pub(crate) fn execute_io<T, F>(
    data: &Arc<DsData>,
    interest: Interest,
    inner: &Arc<Inner>,
    mut task: F,
) -> Result<T>
where
    F: FnMut(RawFd) -> io::Result<T>,
{
    let idx = interest_idx(interest);
    loop {
        if inner.is_stopping() {
            return Err(Error::new(ErrorKind::SrvStop));
        }

        let fd = {
            let guard = data.fd.read().unwrap();
            if *guard < 0 {
                return Err(Error::new(ErrorKind::NotOpen));
            }
            *guard
        };

        // Arm before attempting the syscall: a firing observed by the
        // reactor from this point on must not be lost.
        data.armed[idx].store(true, Ordering::Release);

        let would_block = loop {
            match task(fd) {
                Ok(v) => return Ok(v),
                Err(e) => match e.raw_os_error().map(Errno::from_i32) {
                    Some(Errno::EINTR) => continue,
                    Some(Errno::EAGAIN) | Some(Errno::EWOULDBLOCK) => break true,
                    _ => return Err(Error::from_io(e)),
                },
            }
        };
        debug_assert!(would_block);

        let co_ptr = tls::current_coroutine().expect("execute_io called outside a coroutine");
        let worker_ptr =
            tls::current_worker().expect("execute_io called outside a service worker");
        let worker = unsafe { &*worker_ptr };

        let waiter = Waiter {
            coro: co_ptr as *const Coroutine,
            was_cancelled: AtomicBool::new(false),
        };
        let waiter_ptr = WaiterPtr(&waiter as *const Waiter);

        let data2 = data.clone();
        let inner2 = inner.clone();
        worker.defer(Box::new(move || {
            resume_or_register(&data2, idx, fd, interest, &inner2, waiter_ptr);
        }));

        let main: &Coroutine = unsafe { &*worker.main };
        let current: &Coroutine = unsafe { &*co_ptr };
        current.switch_to(main);

        if waiter.was_cancelled.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::OperationAborted));
        }
        // Retry the syscall: either it is genuinely ready now, or another
        // waiter raced us to it and we'll suspend again.
    }
}

/// Route a reactor-delivered readiness event to the descriptor it belongs
/// to. Called from the worker dispatch loop (§4.5 step 4, §4.6 "Reactor
/// callback side") while the thread's main coroutine is current.
pub(crate) fn on_reactor_event(inner: &Arc<Inner>, ev: crate::reactor::ReadyEvent) {
    let data = match inner.lookup_descriptor(ev.fd) {
        Some(d) => d,
        None => return,
    };
    let idx = interest_idx(ev.interest);
    data.armed[idx].store(false, Ordering::Release);

    let mut view = data.queues[idx].release();
    let first = match view.pop() {
        Some(w) => w,
        None => return,
    };
    while let Some(w) = view.pop() {
        inner.post_coro(unsafe { (*w.0).coro });
    }
    direct_resume(first);
}

/// Close `data`'s fd (if open), cancelling every waiter with
/// `OperationAborted`. Shared by `BasicDescriptor::close` and the service's
/// shutdown sweep (§4.5 "Shutdown").
pub(crate) fn close_ds(data: &Arc<DsData>, inner: &Inner) -> Result<()> {
    match data.take_fd_and_drain() {
        None => Ok(()),
        Some((fd, waiters)) => {
            inner.reactor().unregister(fd);
            inner.unregister_descriptor(fd);
            let rc = unsafe { libc::close(fd) };
            for w in waiters {
                inner.post_coro(unsafe { (*w.0).coro });
            }
            if rc != 0 {
                return Err(Error::from_io(io::Error::last_os_error()));
            }
            Ok(())
        }
    }
}

/// Cancel every outstanding waiter on `data` without closing the fd (§4.6
/// `cancel`).
pub(crate) fn cancel_ds(data: &Arc<DsData>, inner: &Inner) {
    if !data.is_open() {
        return;
    }
    for w in data.drain_queues() {
        inner.post_coro(unsafe { (*w.0).coro });
    }
}

/// The abstract base of every socket-like type: owns DS-Data and the
/// service handle needed to register it with the reactor (§4.6).
pub struct BasicDescriptor {
    data: Arc<DsData>,
    inner: Arc<Inner>,
}

impl BasicDescriptor {
    /// Must be called from inside a running service coroutine (or at least
    /// from a thread with a current service handle) — descriptors are
    /// inherently bound to the service that will poll them.
    pub(crate) fn new() -> Result<Self> {
        let inner = service::current_inner().ok_or_else(|| Error::new(ErrorKind::NotInsideSrvCoro))?;
        Ok(BasicDescriptor {
            data: DsData::new(),
            inner,
        })
    }

    /// Create a new kernel fd via `create`, make it non-blocking, and
    /// register it with the reactor. Fails `AlreadyOpen` / `SrvStop` per
    /// §4.6; on registration failure the fd is closed before the error is
    /// returned (supplemented from `InitAndRegisterNewDescriptor`'s cleanup
    /// path in the original C++ source).
    pub fn open<F>(&self, create: F) -> Result<()>
    where
        F: FnOnce() -> io::Result<RawFd>,
    {
        if self.inner.is_stopping() {
            return Err(Error::new(ErrorKind::SrvStop));
        }

        let mut guard = self.data.fd.write().unwrap();
        if *guard >= 0 {
            return Err(Error::new(ErrorKind::AlreadyOpen));
        }

        let fd = create().map_err(Error::from_io)?;

        if let Err(e) = set_nonblocking(fd) {
            unsafe { libc::close(fd) };
            return Err(Error::from_io(e));
        }

        if let Err(e) = self.inner.reactor().register(fd) {
            unsafe { libc::close(fd) };
            return Err(Error::from_io(e));
        }

        *guard = fd;
        drop(guard);
        self.inner
            .register_descriptor(fd, Arc::downgrade(&self.data));
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        close_ds(&self.data, &self.inner)
    }

    pub fn cancel(&self) {
        cancel_ds(&self.data, &self.inner)
    }

    pub fn is_open(&self) -> bool {
        self.data.is_open()
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        let fd = *self.data.fd.read().unwrap();
        if fd < 0 {
            None
        } else {
            Some(fd)
        }
    }

    /// The central primitive: run `task(fd)`, suspending the calling
    /// coroutine (without blocking the OS thread) whenever it reports
    /// `EAGAIN`/`EWOULDBLOCK`, until `interest` is ready or the descriptor is
    /// closed/cancelled.
    pub fn execute_io<T, F>(&self, interest: Interest, task: F) -> Result<T>
    where
        F: FnMut(RawFd) -> io::Result<T>,
    {
        execute_io(&self.data, interest, &self.inner, task)
    }
}

impl Drop for BasicDescriptor {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
