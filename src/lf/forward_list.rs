//! Intrusive, lock-free, head-only singly-linked list.
//!
//! Grounded on `LockFree.hpp`'s `ForwardList<T>`/`ForwardList::Unsafe`:
//! concurrent `push` (value or whole sub-list), atomic batch `release`
//! (exchange head with null, yielding a single-threaded view), and
//! `try_push` (push only if currently empty).

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::Backoff;

struct Node<T> {
    value: T,
    next: AtomicPtr<Node<T>>,
}

/// A lock-free forward list. Concurrent `push` is wait-free-ish (bounded CAS
/// retries); `release` is the only way to consume elements, yielding an
/// owning [`Unsafe`] view that a single thread may then `pop`/`remove_if`
/// over without further synchronization.
pub struct ForwardList<T> {
    head: AtomicPtr<Node<T>>,
}

impl<T> Default for ForwardList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ForwardList<T> {
    pub fn new() -> Self {
        ForwardList {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push `value` onto the head of the list.
    ///
    /// Returns `true` if the list was empty immediately before this push.
    pub fn push(&self, value: T) -> bool {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        self.push_node(node)
    }

    fn push_node(&self, node: *mut Node<T>) -> bool {
        let backoff = Backoff::new();
        let mut old_head = self.head.load(Ordering::Acquire);
        loop {
            unsafe { (*node).next.store(old_head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(old_head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return old_head.is_null(),
                Err(actual) => {
                    old_head = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Push `value` only if the list is currently empty. Returns `true` if
    /// the push happened.
    pub fn try_push(&self, value: T) -> bool {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        let null = ptr::null_mut();
        match self
            .head
            .compare_exchange(null, node, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                // Safe: node was never published.
                unsafe { drop(Box::from_raw(node)) };
                false
            }
        }
    }

    /// Atomically exchange the head with null, yielding a single-threaded
    /// view over whatever had been pushed.
    pub fn release(&self) -> Unsafe<T> {
        let head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        Unsafe { head }
    }

    /// Append a whole previously-released sub-list back onto this list.
    /// Returns `true` if this list was empty immediately before the push.
    pub fn push_list(&self, mut list: Unsafe<T>) -> bool {
        let new_top = list.head;
        list.head = ptr::null_mut();
        if new_top.is_null() {
            return self.head.load(Ordering::Acquire).is_null();
        }

        let mut bottom = new_top;
        unsafe {
            while let Some(next) = ptr_ref(&(*bottom).next) {
                bottom = next;
            }
        }

        let backoff = Backoff::new();
        let mut expected_top = self.head.load(Ordering::Acquire);
        loop {
            unsafe { (*bottom).next.store(expected_top, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(expected_top, new_top, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return expected_top.is_null(),
                Err(actual) => {
                    expected_top = actual;
                    backoff.spin();
                }
            }
        }
    }
}

fn ptr_ref<T>(p: &AtomicPtr<Node<T>>) -> Option<*mut Node<T>> {
    let v = p.load(Ordering::Acquire);
    if v.is_null() {
        None
    } else {
        Some(v)
    }
}

impl<T> Drop for ForwardList<T> {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// An owning, single-threaded view over a released [`ForwardList`]. Movable,
/// not cloneable: exactly one consumer operates on a given view.
pub struct Unsafe<T> {
    head: *mut Node<T>,
}

impl<T> Unsafe<T> {
    pub fn empty() -> Self {
        Unsafe { head: ptr::null_mut() }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Remove and return the front value, if any.
    pub fn pop(&mut self) -> Option<T> {
        if self.head.is_null() {
            return None;
        }
        let node = unsafe { Box::from_raw(self.head) };
        self.head = node.next.load(Ordering::Relaxed);
        Some(node.value)
    }

    /// Remove every element for which `pred` returns `true`, preserving
    /// relative order of survivors.
    pub fn remove_if<F: Fn(&T) -> bool>(&mut self, pred: F) {
        while !self.head.is_null() && pred(unsafe { &(*self.head).value }) {
            let node = unsafe { Box::from_raw(self.head) };
            self.head = node.next.load(Ordering::Relaxed);
        }
        if self.head.is_null() {
            return;
        }
        let mut ptr = self.head;
        loop {
            let next_ptr = unsafe { (*ptr).next.load(Ordering::Relaxed) };
            if next_ptr.is_null() {
                break;
            }
            if pred(unsafe { &(*next_ptr).value }) {
                let next_next = unsafe { (*next_ptr).next.load(Ordering::Relaxed) };
                unsafe { (*ptr).next.store(next_next, Ordering::Relaxed) };
                unsafe { drop(Box::from_raw(next_ptr)) };
            } else {
                ptr = next_ptr;
            }
        }
    }
}

impl<T> Drop for Unsafe<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

unsafe impl<T: Send> Send for ForwardList<T> {}
unsafe impl<T: Send> Sync for ForwardList<T> {}
unsafe impl<T: Send> Send for Unsafe<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_then_release_preserves_multiset() {
        let list = Arc::new(ForwardList::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let list = list.clone();
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    list.push(t * 100 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut view = list.release();
        let mut seen = HashSet::new();
        while let Some(v) = view.pop() {
            seen.insert(v);
        }
        assert_eq!(seen.len(), 400);
    }

    #[test]
    fn try_push_only_when_empty() {
        let list = ForwardList::new();
        assert!(list.try_push(1));
        assert!(!list.try_push(2));
        let mut view = list.release();
        assert_eq!(view.pop(), Some(1));
        assert_eq!(view.pop(), None);
    }

    #[test]
    fn remove_if_filters_in_order() {
        let list = ForwardList::new();
        for i in 0..5 {
            list.push(i);
        }
        let mut view = list.release();
        view.remove_if(|v| v % 2 == 0);
        let mut remaining = Vec::new();
        while let Some(v) = view.pop() {
            remaining.push(v);
        }
        assert_eq!(remaining, vec![3, 1]);
    }
}
