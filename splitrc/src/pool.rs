//! Fixed-capacity lock-free object pool.
//!
//! Free slots form a Treiber free-list threaded through the slots themselves.
//! The list head is a counted pointer whose counter half serves as a version
//! tag, bumped on every successful pop. A slot returned and re-taken between
//! a thread's read and its CAS therefore never matches: the tag differs even
//! when the pointer repeats. No per-slot counts or holds are needed because
//! the backing array outlives every outstanding allocation.

use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crossbeam_utils::CachePadded;
use scopeguard::defer;

use crate::counted::{AtomicCountedPtr, CountedPtr};

// Storage first so a slot pointer and a payload pointer are interchangeable.
#[repr(C)]
struct Slot<T> {
    storage: MaybeUninit<T>,
    next: AtomicCountedPtr<Slot<T>>,
}

/// A pre-allocated pool of `capacity` uninitialized `T` slots.
///
/// [`try_allocate`](Pool::try_allocate) hands out raw storage; the caller
/// initializes it and later returns it through
/// [`deallocate`](Pool::deallocate) or [`destroy`](Pool::destroy). The pool
/// never blocks and never grows.
pub struct Pool<T> {
    head: CachePadded<AtomicCountedPtr<Slot<T>>>,
    slots: *mut Slot<T>,
    capacity: usize,
}

unsafe impl<T: Send> Send for Pool<T> {}
unsafe impl<T: Send> Sync for Pool<T> {}

impl<T> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        let mut pool = Self {
            head: CachePadded::new(AtomicCountedPtr::null()),
            slots: std::ptr::null_mut(),
            capacity: 0,
        };
        pool.install(capacity);
        pool
    }

    /// Total number of slots, allocated or free.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pops a free slot, or `None` when the pool is exhausted.
    ///
    /// The returned storage is uninitialized.
    pub fn try_allocate(&self) -> Option<NonNull<T>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let slot = NonNull::new(head.ptr)?;
            let next = unsafe { slot.as_ref().next.load(Ordering::Relaxed) };
            // tag bump: a repeat of this pointer can never match this snapshot
            let replacement =
                CountedPtr::with_count(next.ptr, head.count.wrapping_add(1));
            match self.head.compare_exchange_weak(
                head,
                replacement,
                Ordering::Relaxed,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(slot.cast()),
                Err(current) => head = current,
            }
        }
    }

    /// Returns a slot to the free list.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`try_allocate`](Pool::try_allocate) on this
    /// pool, must not be returned twice, and its payload must already be
    /// dropped or moved out.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>) {
        let slot = ptr.cast::<Slot<T>>();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            slot.as_ref()
                .next
                .store(CountedPtr::new(head.ptr), Ordering::Relaxed);
            // the tag is preserved; only pops version it
            let new = CountedPtr::with_count(slot.as_ptr(), head.count);
            match self
                .head
                .compare_exchange_weak(head, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Drops the value in place, then returns its slot to the free list.
    ///
    /// # Safety
    ///
    /// Same contract as [`deallocate`](Pool::deallocate), except the payload
    /// must be initialized.
    pub unsafe fn destroy(&self, ptr: NonNull<T>) {
        ptr.as_ptr().drop_in_place();
        self.deallocate(ptr);
    }

    /// Discards the current backing storage and installs a fresh free list of
    /// `capacity` slots.
    ///
    /// Exclusive access guarantees no allocation is outstanding and no other
    /// thread is mid-operation, so the old storage can be freed immediately.
    pub fn reset(&mut self, capacity: usize) {
        self.reset_with(capacity, || {});
    }

    /// Like [`reset`](Pool::reset), with a teardown hook that runs while the
    /// old storage is still valid. Outstanding allocations must be settled in
    /// the hook at the latest; the old storage is released afterwards, even
    /// if the hook panics.
    pub fn reset_with<F: FnOnce()>(&mut self, capacity: usize, teardown: F) {
        let old_slots = std::mem::replace(&mut self.slots, std::ptr::null_mut());
        let old_capacity = std::mem::replace(&mut self.capacity, 0);
        self.head.store(CountedPtr::null(), Ordering::Relaxed);
        defer! {
            unsafe { release_storage(old_slots, old_capacity) };
        }
        teardown();
        self.install(capacity);
    }

    fn install(&mut self, capacity: usize) {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                storage: MaybeUninit::<T>::uninit(),
                next: AtomicCountedPtr::null(),
            });
        }
        let slots = Box::into_raw(slots.into_boxed_slice()) as *mut Slot<T>;

        // thread the free list in index order; slot 0 pops first
        for i in 0..capacity {
            let succ = if i + 1 < capacity {
                unsafe { slots.add(i + 1) }
            } else {
                std::ptr::null_mut()
            };
            unsafe { &(*slots.add(i)).next }
                .store(CountedPtr::new(succ), Ordering::Relaxed);
        }
        let head = if capacity == 0 {
            std::ptr::null_mut()
        } else {
            slots
        };
        self.head.store(CountedPtr::new(head), Ordering::Release);
        self.slots = slots;
        self.capacity = capacity;
    }
}

unsafe fn release_storage<T>(slots: *mut Slot<T>, capacity: usize) {
    if !slots.is_null() {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
            slots, capacity,
        )));
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        unsafe { release_storage(self.slots, self.capacity) };
    }
}
