//! Michael–Scott queue with split reference-counted nodes.
//!
//! The queue always contains a sentinel node whose payload slot is vacant;
//! enqueued values live in the nodes after it. Each enqueued node is born
//! with three persistent units: the predecessor's chain link, the tail slot
//! (which points at every node exactly once on its way through), and the
//! head slot (every node becomes the sentinel exactly once). The head unit
//! must be granted at birth: a dequeuer that took it lazily could lose the
//! node to a faster dequeuer that undocks the not-yet-granted unit, freeing
//! the node under the slower thread. The initial sentinel has no chain link
//! and starts at two.
//!
//! The chain unit is released only when the *owner* of the link dies, not
//! when the successor is dequeued. A dequeuer that holds the old head
//! therefore keeps the new sentinel pinned while it moves the payload out,
//! even if faster threads dequeue past it meanwhile.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::counted::{AtomicCountedPtr, CountedPtr};
use crate::split_ref::{hold, unhold, unhold_transient, SplitCounted};

struct Node<T> {
    value: MaybeUninit<T>,
    next: AtomicCountedPtr<Node<T>>,
    count: AtomicU64,
}

impl<T> Node<T> {
    fn boxed(value: MaybeUninit<T>, count: u64) -> *mut Self {
        Box::into_raw(Box::new(Self {
            value,
            next: AtomicCountedPtr::null(),
            count: AtomicU64::new(count),
        }))
    }
}

impl<T> SplitCounted for Node<T> {
    #[inline]
    fn count(&self) -> &AtomicU64 {
        &self.count
    }
}

/// Frees a node and releases the chain unit it owned on its successor,
/// iteratively, so a chain of ready-to-die nodes cannot overflow the call
/// stack. Payloads were moved out when the nodes were dequeued past.
unsafe fn free_node<T>(mut node: *mut Node<T>) {
    loop {
        let next = (*node).next.load(Ordering::Relaxed).ptr;
        drop(Box::from_raw(node));
        let Some(succ) = next.as_ref() else { return };
        if succ.count.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        succ.count.load(Ordering::Acquire);
        node = next;
    }
}

fn destroy<T>(ptr: *mut Node<T>) {
    unsafe { free_node(ptr) }
}

/// An unbounded lock-free FIFO queue.
pub struct Queue<T> {
    head: CachePadded<AtomicCountedPtr<Node<T>>>,
    tail: CachePadded<AtomicCountedPtr<Node<T>>>,
}

unsafe impl<T: Send> Send for Queue<T> {}
unsafe impl<T: Send> Sync for Queue<T> {}

impl<T> Queue<T> {
    pub fn new() -> Self {
        // head slot + tail slot; no predecessor chain link
        let sentinel = Node::<T>::boxed(MaybeUninit::uninit(), 2);
        Self {
            head: CachePadded::new(AtomicCountedPtr::new(CountedPtr::new(sentinel))),
            tail: CachePadded::new(AtomicCountedPtr::new(CountedPtr::new(sentinel))),
        }
    }

    pub fn enqueue(&self, value: T) {
        // chain link + tail visit + head residence
        let node = Node::boxed(MaybeUninit::new(value), 3);
        let mut tail = self.tail.load(Ordering::Relaxed);
        loop {
            hold(&self.tail, &mut tail, Ordering::Acquire);
            let p = tail.ptr;
            let mut next = unsafe { (*p).next.load(Ordering::Relaxed) };
            if next.is_null() {
                // linearization point; release publishes the payload to the
                // dequeuer that follows this link
                match unsafe { &(*p).next }.compare_exchange(
                    CountedPtr::null(),
                    CountedPtr::new(node),
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // best-effort tail swing; a loser's swing is completed
                        // by whichever thread observes the lag next
                        match self.tail.compare_exchange(
                            tail,
                            CountedPtr::new(node),
                            Ordering::Release,
                            Ordering::Relaxed,
                        ) {
                            Ok(_) => unsafe { unhold(tail, true, destroy) },
                            Err(_) => unsafe { unhold_transient(p, destroy) },
                        }
                        return;
                    }
                    Err(current) => next = current,
                }
            }
            // lagging tail: help it forward before retrying
            match self.tail.compare_exchange(
                tail,
                CountedPtr::new(next.ptr),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => unsafe { unhold(tail, true, destroy) },
                Err(_) => unsafe { unhold_transient(p, destroy) },
            }
            tail = self.tail.load(Ordering::Relaxed);
        }
    }

    pub fn try_dequeue(&self) -> Option<T> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            hold(&self.head, &mut head, Ordering::Acquire);
            let p = head.ptr;
            // acquire pairs with the enqueuer's release link CAS: the
            // successor's payload is visible below
            let next = unsafe { (*p).next.load(Ordering::Acquire) };
            if next.is_null() {
                unsafe { unhold_transient(p, destroy) };
                return None;
            }
            match self.head.compare_exchange(
                head,
                CountedPtr::new(next.ptr),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    unsafe {
                        // the old head's chain link pins the new sentinel
                        // until the unhold below, so the read cannot race
                        // with faster dequeuers freeing it
                        let value = (*next.ptr).value.as_ptr().read();
                        unhold(head, true, destroy);
                        return Some(value);
                    }
                }
                Err(current) => {
                    unsafe { unhold_transient(p, destroy) };
                    head = current;
                }
            }
        }
    }
}

impl<T> Default for Queue<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        unsafe {
            let sentinel = self.head.load(Ordering::Relaxed).ptr;
            let mut curr = (*sentinel).next.load(Ordering::Relaxed).ptr;
            drop(Box::from_raw(sentinel));
            while let Some(node) = curr.as_mut() {
                curr = node.next.load(Ordering::Relaxed).ptr;
                node.value.as_mut_ptr().drop_in_place();
                drop(Box::from_raw(node));
            }
        }
    }
}
