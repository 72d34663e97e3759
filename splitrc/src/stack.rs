//! Treiber stack with split reference-counted nodes.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::counted::{AtomicCountedPtr, CountedPtr};
use crate::split_ref::{hold_if_not_null, unhold, unhold_transient, SplitCounted};

struct Node<T> {
    value: MaybeUninit<T>,
    next: AtomicCountedPtr<Node<T>>,
    count: AtomicU64,
}

impl<T> SplitCounted for Node<T> {
    #[inline]
    fn count(&self) -> &AtomicU64 {
        &self.count
    }
}

// A popped node's payload has always been moved out already; destruction is
// deallocation only.
fn free_node<T>(ptr: *mut Node<T>) {
    drop(unsafe { Box::from_raw(ptr) });
}

/// An unbounded lock-free LIFO stack.
///
/// `try_pop` returns `None` only when the head was truly null at some point
/// during the attempt; contention causes bounded retries, never errors.
pub struct Stack<T> {
    head: CachePadded<AtomicCountedPtr<Node<T>>>,
}

unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T> Stack<T> {
    #[inline]
    pub fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicCountedPtr::null()),
        }
    }

    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value: MaybeUninit::new(value),
            next: AtomicCountedPtr::null(),
            // one persistent unit: linked into the stack
            count: AtomicU64::new(1),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // The covered head keeps its accumulated holds: the full counted
            // value travels through the link and resurfaces when this node is
            // popped off it. No hold is needed for the new node; it is
            // exclusively ours until the CAS links it.
            unsafe { &(*node).next }.store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                CountedPtr::new(node),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            if !hold_if_not_null(&self.head, &mut head, Ordering::Acquire) {
                return None;
            }
            let node = head.ptr;
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            // No payload is published by this CAS itself; pushes publish with
            // release, and the RMW chain on the head slot carries that
            // release sequence to the holder's acquire.
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => {
                    let value = unsafe { (*node).value.as_ptr().read() };
                    unsafe { unhold(head, true, free_node) };
                    return Some(value);
                }
                Err(current) => {
                    unsafe { unhold_transient(node, free_node) };
                    head = current;
                }
            }
        }
    }
}

impl<T> Default for Stack<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Stack<T> {
    fn drop(&mut self) {
        unsafe {
            let mut curr = self.head.load(Ordering::Relaxed).ptr;
            while let Some(node) = curr.as_mut() {
                curr = node.next.load(Ordering::Relaxed).ptr;
                node.value.as_mut_ptr().drop_in_place();
                drop(Box::from_raw(node));
            }
        }
    }
}
