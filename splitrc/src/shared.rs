//! Reference-counted shared pointers with a lock-free atomic slot.
//!
//! [`Shared`] is the owning handle: one persistent unit per handle, payload
//! dropped with the control block when the last unit goes. [`AtomicShared`]
//! is a slot that several threads load, store, swap and CAS concurrently;
//! it stores one persistent unit and accumulates holds in the slot's counter
//! half exactly like the container slots do. Every observer converts its
//! transient hold into a persistent unit immediately, so handles returned
//! from the slot are indistinguishable from ones made with [`Shared::new`].

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::counted::{AtomicCountedPtr, CountedPtr};
use crate::split_ref::{hold_if_not_null, TRANSIENT_UNIT};

struct Inner<T> {
    value: T,
    count: AtomicU64,
}

/// An owning, possibly null, reference-counted pointer.
pub struct Shared<T> {
    inner: *mut Inner<T>,
}

unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    #[inline]
    pub fn null() -> Self {
        Self {
            inner: std::ptr::null_mut(),
        }
    }

    pub fn new(value: T) -> Self {
        Self {
            inner: Box::into_raw(Box::new(Inner {
                value,
                count: AtomicU64::new(1),
            })),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.inner.is_null()
    }

    #[inline]
    pub fn as_ref(&self) -> Option<&T> {
        unsafe { self.inner.as_ref().map(|inner| &inner.value) }
    }

    #[inline]
    fn as_ptr(&self) -> *mut Inner<T> {
        self.inner
    }

    /// Adopts one already-owned persistent unit on `inner` (none for null).
    #[inline]
    unsafe fn from_raw(inner: *mut Inner<T>) -> Self {
        Self { inner }
    }

    /// Relinquishes the handle's unit to the caller without releasing it.
    #[inline]
    fn into_raw(self) -> *mut Inner<T> {
        let inner = self.inner;
        mem::forget(self);
        inner
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        if let Some(inner) = unsafe { self.inner.as_ref() } {
            inner.count.fetch_add(1, Ordering::Relaxed);
        }
        Self { inner: self.inner }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let Some(inner) = (unsafe { self.inner.as_ref() }) else {
            return;
        };
        if inner.count.fetch_sub(1, Ordering::Release) == 1 {
            inner.count.load(Ordering::Acquire);
            drop(unsafe { Box::from_raw(self.inner) });
        }
    }
}

impl<T> Default for Shared<T> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

/// A shared slot of [`Shared`] handles, updated lock-free.
pub struct AtomicShared<T> {
    link: AtomicCountedPtr<Inner<T>>,
}

unsafe impl<T: Send + Sync> Send for AtomicShared<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicShared<T> {}

impl<T> AtomicShared<T> {
    #[inline]
    pub fn null() -> Self {
        Self {
            link: AtomicCountedPtr::null(),
        }
    }

    /// Moves `shared`'s unit into the slot.
    #[inline]
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            link: AtomicCountedPtr::new(CountedPtr::new(shared.into_raw())),
        }
    }

    /// Returns a handle to the current pointee.
    ///
    /// Internally holds the slot, then immediately converts the transient
    /// unit into the handle's persistent one; the unit left in the slot's
    /// counter is settled by whichever thread later swings the slot.
    pub fn load(&self) -> Shared<T> {
        let mut snap = self.link.load(Ordering::Relaxed);
        if hold_if_not_null(&self.link, &mut snap, Ordering::Acquire) {
            unsafe {
                (*snap.ptr)
                    .count
                    .fetch_add(1u64.wrapping_sub(TRANSIENT_UNIT), Ordering::Relaxed);
            }
        }
        unsafe { Shared::from_raw(snap.ptr) }
    }

    pub fn store(&self, shared: Shared<T>) {
        drop(self.swap(shared));
    }

    /// Replaces the pointee, returning the previous one.
    pub fn swap(&self, shared: Shared<T>) -> Shared<T> {
        let old = self
            .link
            .swap(CountedPtr::new(shared.into_raw()), Ordering::AcqRel);
        if let Some(inner) = unsafe { old.ptr.as_ref() } {
            // credit the holds accumulated during the old residency; the
            // slot's stored unit transfers to the returned handle, so the
            // count stays positive throughout
            inner.count.fetch_add(old.count, Ordering::Relaxed);
        }
        unsafe { Shared::from_raw(old.ptr) }
    }

    /// Single-attempt CAS. May fail spuriously even when `expected` matches.
    ///
    /// On success the slot owns `desired`'s unit and `Ok(())` is returned;
    /// the previously stored unit is released (the caller's `expected`
    /// handle still pins the old pointee). On pointer mismatch, `expected`
    /// is replaced in place with the observed pointee and `desired` comes
    /// back in the `Err`.
    pub fn compare_exchange_weak(
        &self,
        expected: &mut Shared<T>,
        desired: Shared<T>,
    ) -> Result<(), Shared<T>> {
        // strong snapshot: a persistent unit on the observed pointee
        let mut snap = self.link.load(Ordering::Relaxed);
        if hold_if_not_null(&self.link, &mut snap, Ordering::Acquire) {
            unsafe {
                (*snap.ptr)
                    .count
                    .fetch_add(1u64.wrapping_sub(TRANSIENT_UNIT), Ordering::Relaxed);
            }
        }
        if snap.ptr != expected.as_ptr() {
            *expected = unsafe { Shared::from_raw(snap.ptr) };
            return Err(desired);
        }
        match self.link.compare_exchange(
            snap,
            CountedPtr::new(desired.as_ptr()),
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                if let Some(inner) = unsafe { snap.ptr.as_ref() } {
                    // settle the accumulated holds and release both the
                    // slot's stored unit and our snapshot unit; `expected`
                    // still pins the pointee, so this never reaches zero
                    inner
                        .count
                        .fetch_add(snap.count.wrapping_sub(2), Ordering::AcqRel);
                }
                desired.into_raw();
                Ok(())
            }
            Err(_) => {
                // someone raced us on the same pointee; return the snapshot
                drop(unsafe { Shared::from_raw(snap.ptr) });
                Err(desired)
            }
        }
    }

    /// Like [`compare_exchange_weak`](AtomicShared::compare_exchange_weak)
    /// but retries spurious failures; fails only when the pointee actually
    /// differs from `expected`.
    pub fn compare_exchange(
        &self,
        expected: &mut Shared<T>,
        mut desired: Shared<T>,
    ) -> Result<(), Shared<T>> {
        let orig = expected.as_ptr();
        loop {
            match self.compare_exchange_weak(expected, desired) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    if expected.as_ptr() != orig {
                        return Err(back);
                    }
                    desired = back;
                }
            }
        }
    }
}

impl<T> Default for AtomicShared<T> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

impl<T> Drop for AtomicShared<T> {
    fn drop(&mut self) {
        let cp = self.link.load(Ordering::Relaxed);
        if let Some(inner) = unsafe { cp.ptr.as_ref() } {
            // exclusive access: any residual units in the slot counter were
            // settled by their holders already
            inner.count.fetch_add(cp.count, Ordering::Relaxed);
            drop(unsafe { Shared::from_raw(cp.ptr) });
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crossbeam_utils::thread::scope;

    use super::{AtomicShared, Shared};

    // Each test owns its counter; the harness runs tests in parallel.
    struct Counted {
        live: &'static AtomicUsize,
        v: usize,
    }

    impl Counted {
        fn new(live: &'static AtomicUsize, v: usize) -> Self {
            live.fetch_add(1, Ordering::Relaxed);
            Counted { live, v }
        }
    }

    impl Drop for Counted {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn handle_lifecycle() {
        let a = Shared::new(7);
        let b = a.clone();
        assert_eq!(a.as_ref(), Some(&7));
        drop(a);
        assert_eq!(b.as_ref(), Some(&7));
        drop(b);

        let n = Shared::<u64>::null();
        assert!(n.is_null());
        assert_eq!(n.as_ref(), None);
        assert!(n.clone().is_null());
    }

    #[test]
    fn slot_load_store_swap() {
        let slot = AtomicShared::new(Shared::new(1));
        assert_eq!(slot.load().as_ref(), Some(&1));

        let old = slot.swap(Shared::new(2));
        assert_eq!(old.as_ref(), Some(&1));
        assert_eq!(slot.load().as_ref(), Some(&2));

        slot.store(Shared::null());
        assert!(slot.load().is_null());
    }

    #[test]
    fn compare_exchange_semantics() {
        let slot = AtomicShared::new(Shared::new(1));
        let mut expected = slot.load();

        // matching expectation succeeds and installs desired
        assert!(slot.compare_exchange(&mut expected, Shared::new(2)).is_ok());
        assert_eq!(slot.load().as_ref(), Some(&2));

        // stale expectation fails and reports the live pointee
        let desired = Shared::new(3);
        let back = slot
            .compare_exchange(&mut expected, desired)
            .unwrap_err();
        assert_eq!(back.as_ref(), Some(&3));
        assert_eq!(expected.as_ref(), Some(&2));

        // retry with the refreshed expectation
        assert!(slot.compare_exchange(&mut expected, back).is_ok());
        assert_eq!(slot.load().as_ref(), Some(&3));
    }

    #[test]
    fn no_leaks_through_slot() {
        static LIVE: AtomicUsize = AtomicUsize::new(0);
        {
            let slot = AtomicShared::new(Shared::new(Counted::new(&LIVE, 0)));
            let held = slot.load();
            drop(slot.swap(Shared::new(Counted::new(&LIVE, 1))));
            assert_eq!(held.as_ref().unwrap().v, 0);
            drop(held);
            assert_eq!(LIVE.load(Ordering::Relaxed), 1);
        }
        assert_eq!(LIVE.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn swap_stress() {
        const THREADS: usize = 8;
        const OPS_PER_THREAD: usize = 20_000;
        static LIVE: AtomicUsize = AtomicUsize::new(0);

        let slot = AtomicShared::new(Shared::new(Counted::new(&LIVE, 0)));
        scope(|s| {
            for t in 0..THREADS {
                let slot = &slot;
                s.spawn(move |_| {
                    for i in 0..OPS_PER_THREAD {
                        match i % 3 {
                            0 => drop(slot.swap(Shared::new(Counted::new(&LIVE, t)))),
                            1 => drop(slot.load()),
                            _ => {
                                let mut expected = slot.load();
                                let _ = slot.compare_exchange_weak(
                                    &mut expected,
                                    Shared::new(Counted::new(&LIVE, i)),
                                );
                            }
                        }
                    }
                });
            }
        })
        .unwrap();
        // every handle settled: exactly the stored pointee remains
        assert!(!slot.load().is_null());
        drop(slot);
        assert_eq!(LIVE.load(Ordering::Relaxed), 0);
    }
}
