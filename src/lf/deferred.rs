//! Epoch-based deferred deleter.
//!
//! Grounded on `LockFree.hpp`'s `DeferredDeleter`/`EpochKeeper`: N
//! round-robin slots, each either free (0) or holding a snapshot of the
//! global epoch; a pointer enqueued at epoch `E` may be freed only once
//! every occupied slot holds a value `> E`.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::Backoff;

use super::forward_list::ForwardList;

type Reclaim = Box<dyn FnOnce() + Send>;

struct PendingDelete {
    epoch: u64,
    reclaim: Reclaim,
}

/// Owns the epoch counter, the per-thread slot table, and the pending-delete
/// list.
pub struct DeferredDeleter {
    current_epoch: AtomicU64,
    slots: Vec<AtomicU64>,
    pending: ForwardList<PendingDelete>,
    /// `clear_if_need` calls `clear` only once every `clear_every` calls.
    clear_every: u32,
    calls_since_clear: AtomicU64,
}

/// RAII token returned by [`DeferredDeleter::acquire`]. Releases its slot on
/// drop even on an early return or panic unwind.
pub struct EpochGuard<'a> {
    deleter: &'a DeferredDeleter,
    slot: usize,
    released: bool,
}

impl<'a> EpochGuard<'a> {
    pub fn release(&mut self) {
        if !self.released {
            self.deleter.slots[self.slot].store(0, Ordering::Release);
            self.released = true;
        }
    }
}

impl<'a> Drop for EpochGuard<'a> {
    fn drop(&mut self) {
        self.release();
    }
}

impl DeferredDeleter {
    pub fn new(threads_num: usize) -> Self {
        let threads_num = threads_num.max(1);
        let mut slots = Vec::with_capacity(threads_num);
        for _ in 0..threads_num {
            slots.push(AtomicU64::new(0));
        }
        DeferredDeleter {
            current_epoch: AtomicU64::new(1),
            slots,
            pending: ForwardList::new(),
            clear_every: 1,
            calls_since_clear: AtomicU64::new(0),
        }
    }

    pub fn with_clear_interval(threads_num: usize, clear_every: u32) -> Self {
        let mut d = Self::new(threads_num);
        d.clear_every = clear_every.max(1);
        d
    }

    /// Acquire a free slot and stamp it with the current epoch. Spins
    /// (round-robin over the slot table) until one is available.
    pub fn acquire(&self) -> EpochGuard<'_> {
        let backoff = Backoff::new();
        loop {
            for (idx, slot) in self.slots.iter().enumerate() {
                if slot
                    .compare_exchange(
                        0,
                        self.current_epoch.load(Ordering::Acquire),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return EpochGuard {
                        deleter: self,
                        slot: idx,
                        released: false,
                    };
                }
            }
            backoff.snooze();
        }
    }

    /// Either reclaim `ptr` inline (no slot is occupied) or enqueue it for
    /// later reclamation once every occupied slot has moved past the
    /// enqueue epoch.
    pub fn delete<T: Send + 'static>(&self, ptr: *mut T) {
        if ptr.is_null() {
            return;
        }
        let any_occupied = self.slots.iter().any(|s| s.load(Ordering::Acquire) != 0);
        if !any_occupied {
            unsafe { drop(Box::from_raw(ptr)) };
            return;
        }
        let epoch = self.current_epoch.fetch_add(1, Ordering::AcqRel);
        self.pending.push(PendingDelete {
            epoch,
            reclaim: Box::new(move || unsafe { drop(Box::from_raw(ptr)) }),
        });
    }

    /// Free every pending item whose enqueue epoch is below the minimum
    /// currently-occupied slot value.
    pub fn clear(&self) {
        let mut min_epoch = u64::MAX;
        for slot in &self.slots {
            let v = slot.load(Ordering::Acquire);
            if v != 0 && v < min_epoch {
                min_epoch = v;
            }
        }

        let mut view = self.pending.release();
        let mut survivors = Vec::new();
        while let Some(item) = view.pop() {
            if item.epoch < min_epoch {
                (item.reclaim)();
            } else {
                survivors.push(item);
            }
        }
        for item in survivors {
            self.pending.push(item);
        }
    }

    /// Call `clear` only once every `clear_every` invocations.
    pub fn clear_if_need(&self) {
        let n = self.calls_since_clear.fetch_add(1, Ordering::AcqRel) + 1;
        if n % u64::from(self.clear_every) == 0 {
            self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn delete_without_acquired_epochs_is_inline() {
        let deleter = DeferredDeleter::new(2);
        let alive = Arc::new(AtomicUsize::new(0));
        alive.fetch_add(1, Ordering::SeqCst);
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }
        let ptr = Box::into_raw(Box::new(Tracked(alive.clone())));
        deleter.delete(ptr);
        assert_eq!(alive.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn delete_with_held_epoch_defers_until_cleared() {
        let deleter = DeferredDeleter::new(2);
        let alive = Arc::new(AtomicUsize::new(1));
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }
        let guard = deleter.acquire();
        let ptr = Box::into_raw(Box::new(Tracked(alive.clone())));
        deleter.delete(ptr);
        assert_eq!(alive.load(Ordering::SeqCst), 1, "must not free while epoch held");
        drop(guard);
        deleter.clear();
        assert_eq!(alive.load(Ordering::SeqCst), 0);
    }
}
