//! SV: the service — thread pool, ready queue, reactor ownership, and the
//! descriptor registry (§4.5).
//!
//! Grounded on `mioco`'s `Mioco`/`Handler`/`HandlerShared` thread-loop shape
//! (`examples/Pursuit92-mioco/src/lib.rs`, `src/thread.rs`), generalized away
//! from a `mio::EventLoop` delegate to the owned [`crate::reactor::Reactor`].

use std::cell::Cell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::coroutine::{self, Coroutine, Successor, MIN_STACK_SIZE};
use crate::descriptor::DsData;
use crate::error::{Error, ErrorKind, Result};
use crate::lf;
use crate::reactor::{self, Reactor};
use crate::tls;

pub(crate) enum ReadyItem {
    Coro(*const Coroutine),
    Sentinel,
}

unsafe impl Send for ReadyItem {}

/// Runtime configuration, generalized from `mioco::Config`.
#[derive(Clone)]
pub struct Config {
    /// Number of worker OS threads. Defaults to `num_cpus::get()`.
    pub threads: usize,
    /// Default stack size for coroutines spawned via `go`/`add_coro`.
    pub stack_size: usize,
    /// Every Nth descriptor unregistration flags the registry for a sweep.
    pub descriptor_sweep_interval: u32,
    /// Upper bound on how long a worker blocks in the reactor between ready
    /// queue checks; `None` blocks indefinitely.
    pub poll_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            threads: num_cpus::get().max(1),
            stack_size: MIN_STACK_SIZE,
            descriptor_sweep_interval: 64,
            poll_timeout: Some(Duration::from_millis(500)),
        }
    }
}

pub(crate) struct Inner {
    config: Config,
    ready: lf::Queue<'static, ReadyItem>,
    ready_len: AtomicUsize,
    reactor: Reactor,
    wake_read_fd: libc::c_int,
    wake_write_fd: libc::c_int,
    wake_pending: AtomicBool,
    coro_count: AtomicUsize,
    worker_count: AtomicUsize,
    stopping: AtomicBool,
    run_generation: AtomicUsize,
    descriptors: Mutex<HashMap<RawFd, Weak<DsData>>>,
    unregister_count: AtomicU32,
    needs_sweep: AtomicBool,
}

impl Inner {
    pub(crate) fn post_coro(&self, co: *const Coroutine) {
        self.post(ReadyItem::Coro(co));
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn wake_pub(&self) {
        self.wake();
    }

    fn post(&self, item: ReadyItem) {
        self.ready.push(item);
        if self.ready_len.fetch_add(1, Ordering::AcqRel) == 0 {
            self.wake();
        }
    }

    fn pop_ready(&self) -> Option<ReadyItem> {
        let item = self.ready.pop();
        if item.is_some() {
            self.ready_len.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    fn wake(&self) {
        if !self.wake_pending.swap(true, Ordering::AcqRel) {
            let byte: u8 = 1;
            unsafe {
                libc::write(self.wake_write_fd, &byte as *const u8 as *const libc::c_void, 1);
            }
        }
    }

    fn drain_wakeup_pipe(&self) {
        self.wake_pending.store(false, Ordering::Release);
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.wake_read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 || (n as usize) < buf.len() {
                break;
            }
        }
    }

    /// Register a descriptor's weak self-handle, keyed by its fd, so reactor
    /// events and shutdown can find it without the descriptor knowing about
    /// the registry (§4.5 "Descriptor registry").
    pub(crate) fn register_descriptor(&self, fd: RawFd, handle: Weak<DsData>) {
        self.descriptors.lock().unwrap().insert(fd, handle);
    }

    pub(crate) fn unregister_descriptor(&self, fd: RawFd) {
        self.descriptors.lock().unwrap().remove(&fd);
        let n = self.unregister_count.fetch_add(1, Ordering::AcqRel) + 1;
        if n % self.config.descriptor_sweep_interval == 0 {
            self.needs_sweep.store(true, Ordering::Release);
        }
    }

    pub(crate) fn lookup_descriptor(&self, fd: RawFd) -> Option<Arc<DsData>> {
        self.descriptors.lock().unwrap().get(&fd).and_then(|w| w.upgrade())
    }

    fn sweep_descriptors_if_needed(&self) {
        if self.needs_sweep.swap(false, Ordering::AcqRel) {
            let mut map = self.descriptors.lock().unwrap();
            map.retain(|_, v| v.upgrade().is_some());
        }
    }

    fn close_all_descriptors(&self) {
        let map = self.descriptors.lock().unwrap();
        let handles: Vec<_> = map.values().filter_map(|v| v.upgrade()).collect();
        drop(map);
        for h in handles {
            let _ = crate::descriptor::close_ds(&h, self);
        }
    }
}

/// Per-thread bookkeeping, reachable through `tls::current_worker()` from
/// anywhere running on a worker's stack (§4.2 CR-TLS).
pub struct WorkerContext {
    pub(crate) inner: Arc<Inner>,
    pub(crate) main: *const Coroutine,
    pub(crate) cleanup: *const Coroutine,
    deferred: Cell<Option<Box<dyn FnOnce()>>>,
}

impl WorkerContext {
    /// Install a closure to run on this thread's main coroutine right after
    /// the currently-running coroutine next transfers back to it (§4.6
    /// step 4-5, §4.5 "yield").
    pub(crate) fn defer(&self, task: Box<dyn FnOnce()>) {
        self.deferred.set(Some(task));
    }
}

/// The public handle to a runtime instance. Cheaply cloned; every clone
/// refers to the same pool of worker threads.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    pub fn new(config: Config) -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(Error::from_io(std::io::Error::last_os_error()));
        }
        let reactor = Reactor::new(fds[0]).map_err(Error::from_io)?;
        let threads_n = config.threads.max(1);

        let inner = Arc::new(Inner {
            config,
            ready: lf::Queue::new(threads_n),
            ready_len: AtomicUsize::new(0),
            reactor,
            wake_read_fd: fds[0],
            wake_write_fd: fds[1],
            wake_pending: AtomicBool::new(false),
            coro_count: AtomicUsize::new(0),
            worker_count: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            run_generation: AtomicUsize::new(0),
            descriptors: Mutex::new(HashMap::new()),
            unregister_count: AtomicU32::new(0),
            needs_sweep: AtomicBool::new(false),
        });
        Ok(Service { inner })
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    /// Schedule `f` to run as a freestanding coroutine once the pool is
    /// running. Safe to call before `run`, or from inside any coroutine
    /// already running on this service.
    pub fn add_coro<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_coro(f, self.inner.config.stack_size);
    }

    fn spawn_coro<F>(&self, f: F, stack_size: usize)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.coro_count.fetch_add(1, Ordering::AcqRel);
        let task = move || -> Successor {
            f();
            let worker = tls::current_worker().expect("coroutine running without a worker context");
            unsafe { (*worker).cleanup }
        };
        let co = Box::new(Coroutine::new(task, stack_size));
        let co_ptr: *const Coroutine = Box::into_raw(co);
        self.inner.post(ReadyItem::Coro(co_ptr));
    }

    /// Start `threads` worker OS threads and block until `stop()` drains
    /// them all. Returns once every worker has exited.
    pub fn run(&self) -> Result<()> {
        self.inner.stopping.store(false, Ordering::Release);
        let n = self.inner.config.threads;
        let mut handles = Vec::with_capacity(n);
        for idx in 0..n {
            let inner = self.inner.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("rt-coro-worker-{}", idx))
                    .spawn(move || worker_main(inner))
                    .map_err(Error::from_io)?,
            );
        }
        for h in handles {
            let _ = h.join();
        }
        Ok(())
    }

    /// Request shutdown: closes every live descriptor (cancelling every
    /// waiter with `OperationAborted`) and waits for coroutines and workers
    /// to drain.
    pub fn stop(&self) {
        self.inner.stopping.store(true, Ordering::Release);
        self.inner.close_all_descriptors();
        self.inner.post(ReadyItem::Sentinel);
        while self.inner.worker_count.load(Ordering::Acquire) > 0 {
            std::thread::yield_now();
        }
    }

    /// Start a fresh run after a previous one fully stopped.
    pub fn restart(&self) -> Result<()> {
        if self.inner.worker_count.load(Ordering::Acquire) != 0 {
            return Err(Error::new(ErrorKind::InvalidState));
        }
        self.inner.stopping.store(false, Ordering::Release);
        self.inner.run_generation.fetch_add(1, Ordering::AcqRel);
        self.run()
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }
}

/// Spawn a new coroutine on the service owning the currently running
/// coroutine. Panics if called outside a coroutine.
pub fn go<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let worker = tls::current_worker().expect("go() called outside a service worker");
    let worker: &WorkerContext = unsafe { &*worker };
    let svc = Service {
        inner: worker.inner.clone(),
    };
    svc.spawn_coro(f, svc.inner.config.stack_size);
}

/// Yield the calling coroutine back to its thread's main coroutine, to be
/// re-posted onto the ready queue (§4.5 "Yield").
pub fn yield_coro() {
    let worker_ptr = tls::current_worker().expect("yield_coro() called outside a service worker");
    let worker: &WorkerContext = unsafe { &*worker_ptr };
    let co_ptr = tls::current_coroutine().expect("yield_coro() called outside a coroutine");
    let inner = worker.inner.clone();
    worker.defer(Box::new(move || {
        inner.post(ReadyItem::Coro(co_ptr as *const Coroutine));
    }));
    let main: &Coroutine = unsafe { &*worker.main };
    let current: &Coroutine = unsafe { &*co_ptr };
    current.switch_to(main);
}

/// Post `f` to run as a coroutine on the service that owns the current
/// thread's worker context (callable from inside a coroutine or from plain
/// runtime-owned code, e.g. the reactor callback path).
pub(crate) fn post_on(inner: &Arc<Inner>, f: Box<dyn FnOnce() + Send>) {
    let stack_size = inner.config.stack_size;
    inner.coro_count.fetch_add(1, Ordering::AcqRel);
    let task = move || -> Successor {
        f();
        let worker = tls::current_worker().expect("coroutine running without a worker context");
        unsafe { (*worker).cleanup }
    };
    let co = Box::new(Coroutine::new(task, stack_size));
    let co_ptr: *const Coroutine = Box::into_raw(co);
    inner.post(ReadyItem::Coro(co_ptr));
}

pub(crate) fn current_inner() -> Option<Arc<Inner>> {
    tls::current_worker().map(|p| unsafe { (*p).inner.clone() })
}

fn run_cleanup(main_ptr: *const Coroutine, inner: Arc<Inner>) -> Successor {
    let me_ptr = tls::current_coroutine().expect("cleanup coroutine missing TLS entry");
    let me: &Coroutine = unsafe { &*me_ptr };
    let main: &Coroutine = unsafe { &*main_ptr };

    let mut prev = me.switch_to(main);
    loop {
        if let Some(p) = prev {
            if !p.is_null() && !std::ptr::eq(p, main_ptr) {
                let pco: &Coroutine = unsafe { &*p };
                if pco.is_done() {
                    unsafe { drop(Box::from_raw(p as *mut Coroutine)) };
                    inner.coro_count.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
        if inner.coro_count.load(Ordering::Acquire) == 0 {
            inner.post(ReadyItem::Sentinel);
            break;
        }
        prev = me.switch_to(main);
    }
    main_ptr
}

fn worker_main(inner: Arc<Inner>) {
    inner.worker_count.fetch_add(1, Ordering::AcqRel);
    debug!("worker thread starting");

    let main = Coroutine::main();
    let main_ptr: *const Coroutine = &main;

    let cleanup_inner = inner.clone();
    let cleanup_co = Box::new(Coroutine::new(
        move || run_cleanup(main_ptr, cleanup_inner),
        MIN_STACK_SIZE,
    ));
    let cleanup_ptr: *const Coroutine = &*cleanup_co;

    let worker_ctx = Box::new(WorkerContext {
        inner: inner.clone(),
        main: main_ptr,
        cleanup: cleanup_ptr,
        deferred: Cell::new(None),
    });
    let worker_ptr: *const WorkerContext = &*worker_ctx;
    unsafe { tls::set_current_worker(worker_ptr) };

    coroutine::arm_bootstrap(&cleanup_co);
    main.switch_to(&cleanup_co);
    run_deferred(&worker_ctx);

    let mut events = Vec::new();
    loop {
        if inner.stopping.load(Ordering::Acquire) && inner.coro_count.load(Ordering::Acquire) == 0 {
            break;
        }

        let timeout_ms = inner
            .config
            .poll_timeout
            .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
            .unwrap_or(-1);
        match inner.reactor.wait(timeout_ms, &mut events) {
            Ok(woke) => {
                if woke {
                    inner.drain_wakeup_pipe();
                }
            }
            Err(e) => warn!("reactor wait failed: {}", e),
        }
        inner.sweep_descriptors_if_needed();

        for ev in events.drain(..) {
            crate::descriptor::on_reactor_event(&inner, ev);
        }

        while let Some(item) = inner.pop_ready() {
            match item {
                ReadyItem::Sentinel => {
                    trace!("sentinel observed");
                }
                ReadyItem::Coro(ptr) => {
                    let co: &Coroutine = unsafe { &*ptr };
                    coroutine::arm_bootstrap(co);
                    main.switch_to(co);
                    run_deferred(&worker_ctx);
                }
            }
        }
    }

    unsafe { tls::set_current_worker(std::ptr::null()) };
    inner.worker_count.fetch_sub(1, Ordering::AcqRel);
    debug!("worker thread exiting");
}

fn run_deferred(worker: &WorkerContext) {
    if let Some(task) = worker.deferred.take() {
        task();
    }
}
