//! TQ: the process-wide time task queue.
//!
//! A single dedicated thread fires cancellable callbacks at wall-clock
//! deadlines (§4.4). Obtained through [`get_queue`], a weak-reference
//! factory: when the last handle drops, the worker thread exits. Kept
//! explicit rather than hidden behind thread-local state, per spec §9
//! DESIGN NOTES "Global singletons".

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// A callback that will run at most once: whichever of `cancel()` or the
/// queue's own firing wins the race to flip the internal flag actually runs
/// the callback (or, for `cancel`, simply suppresses it).
pub struct CancellableTask {
    consumed: AtomicBool,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CancellableTask {
    fn new<F: FnOnce() + Send + 'static>(f: F) -> Arc<Self> {
        Arc::new(CancellableTask {
            consumed: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(f))),
        })
    }

    /// Attempt to cancel. Returns `true` if this call won the race (i.e. the
    /// callback will never run).
    pub fn cancel(&self) -> bool {
        if self.consumed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.callback.lock().unwrap() = None;
        true
    }

    fn fire(&self) {
        if self.consumed.swap(true, Ordering::AcqRel) {
            return;
        }
        let cb = self.callback.lock().unwrap().take();
        if let Some(cb) = cb {
            cb();
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }
}

struct Entry {
    deadline: Instant,
    seq: u64,
    task: Arc<CancellableTask>,
}

struct Inner {
    ingestion: Mutex<Vec<Entry>>,
    cv: Condvar,
}

/// A shared handle to the singleton timer thread. The thread runs for as
/// long as at least one `TimeTaskQueue` handle is alive.
pub struct TimeTaskQueue {
    inner: Arc<Inner>,
    _thread: Option<thread::JoinHandle<()>>,
}

static SEQ: AtomicU64 = AtomicU64::new(0);

impl TimeTaskQueue {
    fn spawn() -> Arc<Inner> {
        let inner = Arc::new(Inner {
            ingestion: Mutex::new(Vec::new()),
            cv: Condvar::new(),
        });
        let worker_inner = inner.clone();
        thread::Builder::new()
            .name("rt-coro-timer".into())
            .spawn(move || run_loop(worker_inner))
            .expect("spawn timer thread");
        inner
    }

    /// Schedule `task` to fire at `deadline`. Wakes the worker thread only
    /// if the ingestion list was empty before this push, matching §4.4's
    /// "notifies a condition variable only when the ingestion list was
    /// previously empty".
    pub fn add_at<F: FnOnce() + Send + 'static>(&self, deadline: Instant, f: F) -> Arc<CancellableTask> {
        let task = CancellableTask::new(f);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        let mut ingestion = self.inner.ingestion.lock().unwrap();
        let was_empty = ingestion.is_empty();
        ingestion.push(Entry {
            deadline,
            seq,
            task: task.clone(),
        });
        drop(ingestion);
        if was_empty {
            self.inner.cv.notify_one();
        }
        task
    }

    pub fn add_after<F: FnOnce() + Send + 'static>(&self, delay: Duration, f: F) -> Arc<CancellableTask> {
        self.add_at(Instant::now() + delay, f)
    }
}

fn run_loop(inner: Arc<Inner>) {
    let mut scheduled: BTreeMap<(Instant, u64), Arc<CancellableTask>> = BTreeMap::new();
    loop {
        if Arc::strong_count(&inner) == 1 && scheduled.is_empty() {
            // No external handle remains and nothing is pending: exit.
            let ingestion = inner.ingestion.lock().unwrap();
            if ingestion.is_empty() && Arc::strong_count(&inner) == 1 {
                return;
            }
        }

        {
            let mut ingestion = inner.ingestion.lock().unwrap();
            for entry in ingestion.drain(..) {
                if !entry.task.is_consumed() {
                    scheduled.insert((entry.deadline, entry.seq), entry.task);
                }
            }
        }

        scheduled.retain(|_, task| !task.is_consumed());

        let now = Instant::now();
        let mut fired = Vec::new();
        while let Some((&(deadline, seq), _)) = scheduled.iter().next() {
            if deadline > now {
                break;
            }
            let task = scheduled.remove(&(deadline, seq)).unwrap();
            fired.push(task);
        }
        for task in fired {
            task.fire();
        }

        let wait_for = match scheduled.keys().next() {
            Some((deadline, _)) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::from_millis(200),
        };

        let ingestion = inner.ingestion.lock().unwrap();
        if !ingestion.is_empty() {
            continue;
        }
        let _ = inner.cv.wait_timeout(ingestion, wait_for).unwrap();
    }
}

static GLOBAL: Mutex<Option<Weak<Inner>>> = Mutex::new(None);

/// Obtain a shared handle to the process-wide timer queue, spawning its
/// worker thread on first use.
pub fn get_queue() -> TimeTaskQueue {
    let mut global = GLOBAL.lock().unwrap();
    if let Some(weak) = global.as_ref() {
        if let Some(inner) = weak.upgrade() {
            return TimeTaskQueue {
                inner,
                _thread: None,
            };
        }
    }
    let inner = TimeTaskQueue::spawn();
    *global = Some(Arc::downgrade(&inner));
    TimeTaskQueue {
        inner,
        _thread: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use std::time::Duration;

    #[test]
    fn fires_after_deadline() {
        let q = get_queue();
        let fired = Arc::new(StdAtomicBool::new(false));
        let fired2 = fired.clone();
        q.add_after(Duration::from_millis(20), move || {
            fired2.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(200));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_before_fire_suppresses_callback() {
        let q = get_queue();
        let fired = Arc::new(StdAtomicBool::new(false));
        let fired2 = fired.clone();
        let task = q.add_after(Duration::from_millis(200), move || {
            fired2.store(true, Ordering::SeqCst);
        });
        assert!(task.cancel());
        thread::sleep(Duration::from_millis(400));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
