//! DS sync primitives: `Mutex`, `SharedMutex`, `Semaphore`, `Event` (§4.7).
//!
//! Grounded on the original C++ `Sync.hpp`/`Sync.cpp`: each primitive keeps a
//! small atomic state word plus a waiter queue, and every blocking operation
//! follows the same "fast path CAS, slow path register-then-recheck" shape
//! `descriptor::execute_io` uses (§4.6), factored out into
//! [`crate::blocking::suspend`]/[`crate::blocking::resume`]. `Timer` lives in
//! its own module ([`crate::timer`]) since it is built on the time-task queue
//! rather than a waiter queue alone, but shares the same suspend/resume
//! plumbing.

use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;

use crossbeam_utils::Backoff;

use crate::blocking;
use crate::coroutine::Coroutine;
use crate::lf;
use crate::tls;

pub use crate::timer::Timer;

/// A waiter identified only by its coroutine pointer; resumed through the
/// service's ready queue (`blocking::resume`), never by a direct transfer,
/// since a sync primitive has no notion of "the thread about to run next".
#[derive(Clone, Copy)]
struct CoroPtr(*const Coroutine);
unsafe impl Send for CoroPtr {}

fn current_coro() -> *const Coroutine {
    tls::current_coroutine().expect("sync primitive used outside a coroutine")
}

fn pop_spin(q: &lf::Queue<'static, CoroPtr>) -> CoroPtr {
    let backoff = Backoff::new();
    loop {
        if let Some(w) = q.pop() {
            return w;
        }
        // The corresponding push is already committed in program order (it
        // always happens before the counter update that sent us here); this
        // is a visibility window, not a real absence, so a short spin always
        // resolves it.
        backoff.snooze();
    }
}

/// An exclusive lock for coroutines. Never blocks the OS thread: a coroutine
/// that cannot acquire immediately suspends and is resumed by whichever
/// `unlock()` hands it the lock.
///
/// State is `N`: `0` free, `N >= 1` held with `N - 1` waiters queued (§4.7).
pub struct Mutex {
    state: AtomicUsize,
    waiters: lf::Queue<'static, CoroPtr>,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Self {
        Mutex {
            state: AtomicUsize::new(0),
            waiters: lf::Queue::new(1),
        }
    }

    /// Non-blocking fast path: `CAS 0 -> 1`.
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Acquire the lock, suspending the calling coroutine if it is held.
    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }

        let co = current_coro();
        let mx = self as *const Mutex;
        blocking::suspend(Box::new(move || {
            let mx: &Mutex = unsafe { &*mx };
            // Push self, then increment from N; if the increment observed 0,
            // the mutex went free between our failed CAS and this closure
            // running and we are the only queued waiter, so claim it and
            // repost ourselves instead of waiting for a future `unlock`.
            mx.waiters.push(CoroPtr(co));
            let prev = mx.state.fetch_add(1, Ordering::AcqRel);
            if prev == 0 {
                if let Some(w) = mx.waiters.pop() {
                    blocking::resume(w.0);
                }
            }
        }));
    }

    /// Release the lock, handing it to the next waiter (if any).
    pub fn unlock(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "Mutex::unlock called while not held");
        if prev > 1 {
            let w = pop_spin(&self.waiters);
            blocking::resume(w.0);
        }
    }
}

unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

/// A counting semaphore. `push` releases a unit, `pop` consumes one,
/// suspending if none is available (§4.7).
///
/// Internally the count can go negative: a negative value `-k` means `k`
/// coroutines are queued waiting for a unit. This is the standard
/// signed-counter encoding for a blocking semaphore and keeps `pop`/`push`
/// each a single atomic read-modify-write on the fast path; the value
/// observable to callers (`available()`) is always clamped to `>= 0`.
pub struct Semaphore {
    count: AtomicIsize,
    waiters: lf::Queue<'static, CoroPtr>,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Semaphore {
            count: AtomicIsize::new(initial as isize),
            waiters: lf::Queue::new(1),
        }
    }

    /// Units currently available without blocking.
    pub fn available(&self) -> usize {
        self.count.load(Ordering::Acquire).max(0) as usize
    }

    /// Consume one unit, suspending the caller until one is available.
    pub fn pop(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        if prev > 0 {
            return;
        }
        let co = current_coro();
        let sem = self as *const Semaphore;
        blocking::suspend(Box::new(move || {
            let sem: &Semaphore = unsafe { &*sem };
            sem.waiters.push(CoroPtr(co));
        }));
    }

    /// Release one unit, waking a queued waiter if one exists.
    pub fn push(&self) {
        let prev = self.count.fetch_add(1, Ordering::AcqRel);
        if prev < 0 {
            let w = pop_spin(&self.waiters);
            blocking::resume(w.0);
        }
    }
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

/// A one-shot (until reset) signal. State is "signalled" or a non-negative
/// waiter count (§4.7): `set` wakes every coroutine waiting at that moment,
/// `reset` arms it again, `wait` fast-returns while signalled.
pub struct Event {
    signalled: AtomicBool,
    waiters: lf::ForwardList<CoroPtr>,
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Event {
            signalled: AtomicBool::new(false),
            waiters: lf::ForwardList::new(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.signalled.load(Ordering::Acquire)
    }

    /// Signal the event, resuming every coroutine currently waiting.
    pub fn set(&self) {
        self.signalled.store(true, Ordering::Release);
        let mut view = self.waiters.release();
        while let Some(w) = view.pop() {
            blocking::resume(w.0);
        }
    }

    /// Clear the signal. Coroutines already resumed by a prior `set` are
    /// unaffected; future `wait`s block again until the next `set`.
    pub fn reset(&self) {
        self.signalled.store(false, Ordering::Release);
    }

    /// Block until the event is signalled. Returns immediately if it
    /// already is.
    pub fn wait(&self) {
        if self.signalled.load(Ordering::Acquire) {
            return;
        }
        let co = current_coro();
        let ev = self as *const Event;
        blocking::suspend(Box::new(move || {
            let ev: &Event = unsafe { &*ev };
            ev.waiters.push(CoroPtr(co));
            // Recheck: `set` may have run (and drained the list) between our
            // fast check and this push becoming visible. If so, drain
            // whatever is queued now (which includes us) and resume it
            // directly rather than leaving anyone stuck waiting on a signal
            // that already fired.
            if ev.signalled.load(Ordering::Acquire) {
                let mut view = ev.waiters.release();
                while let Some(w) = view.pop() {
                    blocking::resume(w.0);
                }
            }
        }));
    }
}

unsafe impl Send for Event {}
unsafe impl Sync for Event {}

/// A reader/writer lock for coroutines, writer-preferring (§4.7): once a
/// writer is held or waiting, new readers queue behind it rather than
/// starving it.
///
/// The original packs exclusive-held/exclusive-waiters/shared-holders counts
/// into one atomic word for lock-free transitions (see DESIGN.md Open
/// Question 4); this keeps the counts as plain atomics guarded by a small
/// `std::sync::Mutex` held only across the bookkeeping decision, not across
/// the duration of the lock itself.
pub struct SharedMutex {
    exclusive_held: AtomicBool,
    exclusive_waiters: AtomicUsize,
    shared_holders: AtomicUsize,
    write_queue: lf::Queue<'static, CoroPtr>,
    read_queue: lf::Queue<'static, CoroPtr>,
    guard: StdMutex<()>,
}

impl Default for SharedMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedMutex {
    pub fn new() -> Self {
        SharedMutex {
            exclusive_held: AtomicBool::new(false),
            exclusive_waiters: AtomicUsize::new(0),
            shared_holders: AtomicUsize::new(0),
            write_queue: lf::Queue::new(1),
            read_queue: lf::Queue::new(1),
            guard: StdMutex::new(()),
        }
    }

    pub fn try_lock(&self) -> bool {
        let _g = self.guard.lock().unwrap();
        if !self.exclusive_held.load(Ordering::Acquire)
            && self.shared_holders.load(Ordering::Acquire) == 0
        {
            self.exclusive_held.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn try_lock_shared(&self) -> bool {
        let _g = self.guard.lock().unwrap();
        if self.exclusive_held.load(Ordering::Acquire)
            || self.exclusive_waiters.load(Ordering::Acquire) > 0
        {
            false
        } else {
            self.shared_holders.fetch_add(1, Ordering::AcqRel);
            true
        }
    }

    /// Acquire the lock for exclusive (write) access.
    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }
        {
            let _g = self.guard.lock().unwrap();
            self.exclusive_waiters.fetch_add(1, Ordering::AcqRel);
        }
        let co = current_coro();
        let sm = self as *const SharedMutex;
        blocking::suspend(Box::new(move || {
            let sm: &SharedMutex = unsafe { &*sm };
            let g = sm.guard.lock().unwrap();
            if !sm.exclusive_held.load(Ordering::Acquire)
                && sm.shared_holders.load(Ordering::Acquire) == 0
            {
                sm.exclusive_waiters.fetch_sub(1, Ordering::AcqRel);
                sm.exclusive_held.store(true, Ordering::Release);
                drop(g);
                blocking::resume(co);
            } else {
                sm.write_queue.push(CoroPtr(co));
            }
        }));
    }

    /// Acquire the lock for shared (read) access.
    pub fn lock_shared(&self) {
        if self.try_lock_shared() {
            return;
        }
        let co = current_coro();
        let sm = self as *const SharedMutex;
        blocking::suspend(Box::new(move || {
            let sm: &SharedMutex = unsafe { &*sm };
            let g = sm.guard.lock().unwrap();
            if !sm.exclusive_held.load(Ordering::Acquire)
                && sm.exclusive_waiters.load(Ordering::Acquire) == 0
            {
                sm.shared_holders.fetch_add(1, Ordering::AcqRel);
                drop(g);
                blocking::resume(co);
            } else {
                sm.read_queue.push(CoroPtr(co));
            }
        }));
    }

    /// Release an exclusive hold: hand off to the next writer if one is
    /// queued (writer preference), otherwise release every queued reader.
    pub fn unlock(&self) {
        let mut g = self.guard.lock().unwrap();
        self.exclusive_held.store(false, Ordering::Release);

        if self.exclusive_waiters.load(Ordering::Acquire) > 0 {
            if let Some(w) = self.write_queue.pop() {
                self.exclusive_waiters.fetch_sub(1, Ordering::AcqRel);
                self.exclusive_held.store(true, Ordering::Release);
                drop(g);
                blocking::resume(w.0);
                return;
            }
            // The waiter hasn't published yet; fall through and hand the
            // lock to readers this round, writer gets it on the next
            // unlock that observes the push.
        }

        let mut readers = Vec::new();
        loop {
            match self.read_queue.pop() {
                Some(w) => {
                    self.shared_holders.fetch_add(1, Ordering::AcqRel);
                    readers.push(w);
                }
                None => break,
            }
        }
        drop(g);
        for w in readers {
            blocking::resume(w.0);
        }
    }

    /// Release a shared hold; if this was the last reader and a writer is
    /// waiting, hand off to it.
    pub fn unlock_shared(&self) {
        let g = self.guard.lock().unwrap();
        let prev = self.shared_holders.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "SharedMutex::unlock_shared called with no shared holders");
        if prev == 1 && self.exclusive_waiters.load(Ordering::Acquire) > 0 {
            if let Some(w) = self.write_queue.pop() {
                self.exclusive_waiters.fetch_sub(1, Ordering::AcqRel);
                self.exclusive_held.store(true, Ordering::Release);
                drop(g);
                blocking::resume(w.0);
            }
        }
    }
}

unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_try_lock_is_exclusive() {
        let m = Mutex::new();
        assert!(m.try_lock());
        assert!(!m.try_lock());
        m.unlock();
        assert!(m.try_lock());
    }

    #[test]
    fn semaphore_available_tracks_pushes() {
        let s = Semaphore::new(2);
        assert_eq!(s.available(), 2);
        s.push();
        assert_eq!(s.available(), 3);
    }

    #[test]
    fn event_set_then_wait_is_immediate() {
        let e = Event::new();
        assert!(!e.is_set());
        e.set();
        assert!(e.is_set());
        e.wait(); // must not block: already signalled
        e.reset();
        assert!(!e.is_set());
    }

    #[test]
    fn shared_mutex_allows_concurrent_readers() {
        let sm = SharedMutex::new();
        assert!(sm.try_lock_shared());
        assert!(sm.try_lock_shared());
        assert!(!sm.try_lock());
        sm.unlock_shared();
        sm.unlock_shared();
        assert!(sm.try_lock());
    }
}
