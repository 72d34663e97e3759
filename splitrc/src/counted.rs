use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::Ordering;

use portable_atomic::AtomicU128;
use static_assertions::const_assert_eq;

// The pointer and the counter must travel as one atomic unit, which needs a
// double-width CAS on 64-bit targets.
const_assert_eq!(mem::size_of::<usize>(), 8);
const_assert_eq!(mem::size_of::<CountedPtr<u8>>(), 16);

/// A (pointer, counter) pair that is loaded, stored and compared as a single
/// atomic unit.
///
/// While a pointer resides in a shared slot, the counter half accumulates one
/// [`TRANSIENT_UNIT`](crate::split_ref::TRANSIENT_UNIT) per hold granted
/// against that residency. The accumulated value is settled into the node's
/// combined count by whichever thread swings the slot away (see
/// [`unhold`](crate::split_ref::unhold)).
pub struct CountedPtr<N> {
    pub ptr: *mut N,
    pub count: u64,
}

impl<N> CountedPtr<N> {
    #[inline]
    pub fn null() -> Self {
        Self {
            ptr: ptr::null_mut(),
            count: 0,
        }
    }

    #[inline]
    pub fn new(ptr: *mut N) -> Self {
        Self { ptr, count: 0 }
    }

    #[inline]
    pub fn with_count(ptr: *mut N, count: u64) -> Self {
        Self { ptr, count }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    #[inline]
    fn pack(self) -> u128 {
        ((self.ptr as usize as u128) << 64) | self.count as u128
    }

    #[inline]
    fn unpack(raw: u128) -> Self {
        Self {
            ptr: (raw >> 64) as usize as *mut N,
            count: raw as u64,
        }
    }
}

impl<N> Clone for CountedPtr<N> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<N> Copy for CountedPtr<N> {}

impl<N> PartialEq for CountedPtr<N> {
    #[inline]
    fn eq(&self, rhs: &Self) -> bool {
        self.ptr == rhs.ptr && self.count == rhs.count
    }
}

impl<N> Eq for CountedPtr<N> {}

impl<N> Default for CountedPtr<N> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

impl<N> fmt::Debug for CountedPtr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountedPtr")
            .field("ptr", &self.ptr)
            .field("count", &self.count)
            .finish()
    }
}

/// A shared slot holding a [`CountedPtr`], atomically swappable as a whole.
pub struct AtomicCountedPtr<N> {
    data: AtomicU128,
    _marker: PhantomData<*mut N>,
}

// The slot itself is a plain atomic word; the safety of dereferencing what it
// points to is on its users.
unsafe impl<N> Send for AtomicCountedPtr<N> {}
unsafe impl<N> Sync for AtomicCountedPtr<N> {}

impl<N> AtomicCountedPtr<N> {
    #[inline]
    pub fn null() -> Self {
        Self::new(CountedPtr::null())
    }

    #[inline]
    pub fn new(cp: CountedPtr<N>) -> Self {
        Self {
            data: AtomicU128::new(cp.pack()),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn load(&self, order: Ordering) -> CountedPtr<N> {
        CountedPtr::unpack(self.data.load(order))
    }

    #[inline]
    pub fn store(&self, cp: CountedPtr<N>, order: Ordering) {
        self.data.store(cp.pack(), order)
    }

    #[inline]
    pub fn swap(&self, cp: CountedPtr<N>, order: Ordering) -> CountedPtr<N> {
        CountedPtr::unpack(self.data.swap(cp.pack(), order))
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: CountedPtr<N>,
        new: CountedPtr<N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedPtr<N>, CountedPtr<N>> {
        self.data
            .compare_exchange(current.pack(), new.pack(), success, failure)
            .map(CountedPtr::unpack)
            .map_err(CountedPtr::unpack)
    }

    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: CountedPtr<N>,
        new: CountedPtr<N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedPtr<N>, CountedPtr<N>> {
        self.data
            .compare_exchange_weak(current.pack(), new.pack(), success, failure)
            .map(CountedPtr::unpack)
            .map_err(CountedPtr::unpack)
    }
}

impl<N> Default for AtomicCountedPtr<N> {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}
