//! Michael-Scott lock-free FIFO queue.
//!
//! Grounded on `LockFree.hpp`'s `Queue<T>`: a permanently-present dummy tail
//! node decouples producers from consumers. Producer: CAS the value into the
//! current tail dummy, then CAS a new dummy into its `next`, then advance
//! `tail`. Consumer: advance `head`, extract the value, defer-delete the old
//! head.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::Backoff;

use super::deferred::DeferredDeleter;

struct Node<T> {
    value: AtomicPtr<T>,
    next: AtomicPtr<Node<T>>,
}

/// A lock-free FIFO queue, built over the same epoch-deferred reclamation as
/// [`super::stack::Stack`].
pub struct Queue<'a, T> {
    head: AtomicPtr<Node<T>>,
    tail: AtomicPtr<Node<T>>,
    deleter: DeleterRef<'a>,
}

enum DeleterRef<'a> {
    Owned(DeferredDeleter),
    Borrowed(&'a DeferredDeleter),
}

impl<'a> DeleterRef<'a> {
    fn get(&self) -> &DeferredDeleter {
        match self {
            DeleterRef::Owned(d) => d,
            DeleterRef::Borrowed(d) => d,
        }
    }
}

impl<'a, T> Queue<'a, T> {
    pub fn new(threads_num: usize) -> Self {
        let dummy = Box::into_raw(Box::new(Node {
            value: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        Queue {
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
            deleter: DeleterRef::Owned(DeferredDeleter::new(threads_num)),
        }
    }

    pub fn with_deleter(deleter: &'a DeferredDeleter) -> Self {
        let dummy = Box::into_raw(Box::new(Node {
            value: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        Queue {
            head: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
            deleter: DeleterRef::Borrowed(deleter),
        }
    }

    /// Push `value` onto the tail of the queue.
    pub fn push(&self, value: T) {
        let deleter = self.deleter.get();
        let guard = deleter.acquire();
        let value_ptr = Box::into_raw(Box::new(value));
        let backoff = Backoff::new();

        let mut new_dummy: Option<*mut Node<T>> = None;
        loop {
            let old_tail = self.tail.load(Ordering::Acquire);
            let null_val: *mut T = ptr::null_mut();
            let expected_val = null_val;
            let stored = unsafe { (*old_tail).value.compare_exchange(
                expected_val,
                value_ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) };

            if new_dummy.is_none() {
                new_dummy = Some(Box::into_raw(Box::new(Node {
                    value: AtomicPtr::new(ptr::null_mut()),
                    next: AtomicPtr::new(ptr::null_mut()),
                })));
            }
            let dummy = new_dummy.unwrap();

            let null_node: *mut Node<T> = ptr::null_mut();
            let linked = unsafe { (*old_tail).next.compare_exchange(
                null_node,
                dummy,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) };

            let next_of_tail = match linked {
                Ok(_) => {
                    new_dummy = None;
                    dummy
                }
                Err(actual) => actual,
            };

            let _ = self.tail.compare_exchange(
                old_tail,
                next_of_tail,
                Ordering::AcqRel,
                Ordering::Acquire,
            );

            if stored.is_ok() {
                break;
            }
            backoff.spin();
        }

        if let Some(leftover) = new_dummy {
            unsafe { drop(Box::from_raw(leftover)) };
        }
        drop(guard);
        deleter.clear_if_need();
    }

    /// Pop the value at the head of the queue, if any.
    pub fn pop(&self) -> Option<T> {
        let deleter = self.deleter.get();
        let guard = deleter.acquire();
        let backoff = Backoff::new();

        let result = loop {
            let old_head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if old_head == tail {
                break None;
            }
            let new_head = unsafe { (*old_head).next.load(Ordering::Acquire) };
            if new_head.is_null() {
                backoff.spin();
                continue;
            }
            match self.head.compare_exchange_weak(
                old_head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let value_ptr = unsafe { (*old_head).value.load(Ordering::Acquire) };
                    drop(guard);
                    deleter.delete(old_head);
                    let value = unsafe { Box::from_raw(value_ptr) };
                    break Some(*value);
                }
                Err(_) => {
                    backoff.spin();
                    continue;
                }
            }
        };
        deleter.clear_if_need();
        result
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head == tail
    }
}

impl<'a, T> Drop for Queue<'a, T> {
    fn drop(&mut self) {
        let mut head = self.head.load(Ordering::Acquire);
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            let value_ptr = node.value.load(Ordering::Relaxed);
            if !value_ptr.is_null() {
                unsafe { drop(Box::from_raw(value_ptr)) };
            }
            head = node.next.load(Ordering::Relaxed);
        }
    }
}

unsafe impl<'a, T: Send> Send for Queue<'a, T> {}
unsafe impl<'a, T: Send> Sync for Queue<'a, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_single_producer_single_consumer() {
        let q = Queue::new(2);
        for i in 0..10 {
            q.push(i);
        }
        let mut out = Vec::new();
        while let Some(v) = q.pop() {
            out.push(v);
        }
        assert_eq!(out, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_producers_consumers_no_duplicate_no_loss() {
        let q = Arc::new(Queue::new(8));
        let mut producers = Vec::new();
        for t in 0..4 {
            let q = q.clone();
            producers.push(thread::spawn(move || {
                for i in 0..250 {
                    q.push(t * 250 + i);
                }
            }));
        }
        for h in producers {
            h.join().unwrap();
        }

        let seen: Arc<std::sync::Mutex<HashSet<i32>>> = Arc::new(std::sync::Mutex::new(HashSet::new()));
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            let seen = seen.clone();
            consumers.push(thread::spawn(move || {
                while let Some(v) = q.pop() {
                    assert!(seen.lock().unwrap().insert(v));
                }
            }));
        }
        for h in consumers {
            h.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 1000);
        assert!(q.is_empty());
    }
}
