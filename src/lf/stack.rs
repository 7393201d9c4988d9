//! Treiber stack with epoch-deferred reclamation.
//!
//! Grounded on `LockFree.hpp`'s `Stack<T>`: push CASes a new head; pop
//! acquires an epoch, CAS-removes the head, releases the epoch, then
//! defer-deletes the old head node so no other thread mid-`pop` can suffer
//! an ABA/use-after-free on it.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crossbeam_utils::Backoff;

use super::deferred::DeferredDeleter;

struct Node<T> {
    value: Option<T>,
    next: AtomicPtr<Node<T>>,
}

/// A lock-free LIFO stack. Can either own a private [`DeferredDeleter`]
/// (construct with [`Stack::new`]) or share one supplied by the caller
/// (construct with [`Stack::with_deleter`]) — the latter is how `Service`
/// wires every lock-free structure in one run through a single epoch
/// counter.
pub struct Stack<'a, T> {
    head: AtomicPtr<Node<T>>,
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

impl<'a, T> Stack<'a, T> {
    pub fn new(threads_num: usize) -> Self {
        Stack {
            head: AtomicPtr::new(ptr::null_mut()),
            deleter: DeleterRef::Owned(DeferredDeleter::new(threads_num)),
        }
    }

    pub fn with_deleter(deleter: &'a DeferredDeleter) -> Self {
        Stack {
            head: AtomicPtr::new(ptr::null_mut()),
            deleter: DeleterRef::Borrowed(deleter),
        }
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

    /// Push `value`. Returns `true` if the stack was empty before the push.
    pub fn push(&self, value: T) -> bool {
        let node = Box::into_raw(Box::new(Node {
            value: Some(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        self.push_node(node)
    }

    /// Push `value` only if the stack is currently empty.
    pub fn try_push(&self, value: T) -> bool {
        let node = Box::into_raw(Box::new(Node {
            value: Some(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        let null = ptr::null_mut();
        match self
            .head
            .compare_exchange(null, node, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                unsafe { drop(Box::from_raw(node)) };
                false
            }
        }
    }

    /// Pop the top value, if any. `became_empty` is set to `true` iff this
    /// pop left the stack empty (used by `SharedMutex` as an optimization).
    pub fn pop(&self, became_empty: Option<&mut bool>) -> Option<T> {
        let deleter = self.deleter.get();
        let guard = deleter.acquire();

        let mut old_head = self.head.load(Ordering::Acquire);
        let mut new_head;
        loop {
            if old_head.is_null() {
                drop(guard);
                if let Some(flag) = became_empty {
                    *flag = true;
                }
                deleter.clear_if_need();
                return None;
            }
            new_head = unsafe { (*old_head).next.load(Ordering::Acquire) };
            match self.head.compare_exchange_weak(
                old_head,
                new_head,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => old_head = actual,
            }
        }
        drop(guard);

        if let Some(flag) = became_empty {
            *flag = new_head.is_null();
        }

        let value = unsafe { (*old_head).value.take() };
        deleter.delete(old_head);
        deleter.clear_if_need();
        value
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<'a, T> Drop for Stack<'a, T> {
    fn drop(&mut self) {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next.load(Ordering::Relaxed);
        }
    }
}

unsafe impl<'a, T: Send> Send for Stack<'a, T> {}
unsafe impl<'a, T: Send> Sync for Stack<'a, T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_push_pop_no_duplicate_no_loss() {
        let stack = Arc::new(Stack::new(8));
        let mut handles = Vec::new();
        for t in 0..4 {
            let stack = stack.clone();
            handles.push(thread::spawn(move || {
                for i in 0..250 {
                    stack.push(t * 250 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let stack2 = stack.clone();
        let mut popped_handles = Vec::new();
        let seen: Arc<std::sync::Mutex<HashSet<i32>>> = Arc::new(std::sync::Mutex::new(HashSet::new()));
        for _ in 0..4 {
            let stack2 = stack2.clone();
            let seen = seen.clone();
            popped_handles.push(thread::spawn(move || {
                while let Some(v) = stack2.pop(None) {
                    let mut s = seen.lock().unwrap();
                    assert!(s.insert(v), "value popped twice: {}", v);
                }
            }));
        }
        for h in popped_handles {
            h.join().unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 1000);
        assert!(stack.is_empty());
    }
}
