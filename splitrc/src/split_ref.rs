//! The split reference-count protocol.
//!
//! Every node managed by this protocol embeds a single `AtomicU64` combining
//! two logically distinct quantities that must move together:
//!
//! - the *transient* count (high 32 bits): threads that currently hold a live
//!   copy of a pointer to this node, acquired via [`hold`] and not yet
//!   released via [`unhold`] / [`unhold_transient`];
//! - the *persistent* count (low 32 bits): references arising from the data
//!   structure's own links (or external owners).
//!
//! Both halves are unsigned and wrap; the node is destroyed exactly once, by
//! the thread whose decrement drives the combined word to zero.
//!
//! Holds are not recorded in the node directly. [`hold`] bumps the counter
//! half of the *shared slot* the pointer was read from; the thread that later
//! swings the slot away transfers the accumulated units into the node with
//! [`unhold`], at which point the releases performed by the other holders
//! balance out. Because destruction is deferred until no thread can still be
//! comparing against a stale copy of the pointer, a pointer value is never
//! recycled into a new node while an old comparison against it could succeed;
//! ABA is ruled out at the root rather than detected after the fact.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::counted::{AtomicCountedPtr, CountedPtr};

/// One transient reference, in combined-count units.
pub const TRANSIENT_UNIT: u64 = 1 << 32;

/// Node types managed by the protocol expose their combined count field.
///
/// Implementations are monomorphized through the free functions below; there
/// is no dynamic dispatch on the hot path.
pub trait SplitCounted {
    fn count(&self) -> &AtomicU64;
}

/// Acquires a hold on whatever pointer currently resides in `slot`.
///
/// CAS-loops to publish a slot value identical in pointer but with the
/// counter half bumped by one [`TRANSIENT_UNIT`]. On return, `snapshot`
/// carries the committed slot value (including the caller's own unit) and the
/// pointed-to node is guaranteed alive until the caller releases it.
///
/// `success` is the ordering of the winning CAS; pass `Acquire` when the
/// caller will act on data it reads through the held pointer. Failed
/// attempts reload relaxed.
pub fn hold<N>(slot: &AtomicCountedPtr<N>, snapshot: &mut CountedPtr<N>, success: Ordering) {
    loop {
        let bumped = CountedPtr::with_count(
            snapshot.ptr,
            snapshot.count.wrapping_add(TRANSIENT_UNIT),
        );
        match slot.compare_exchange_weak(*snapshot, bumped, success, Ordering::Relaxed) {
            Ok(_) => {
                snapshot.count = bumped.count;
                return;
            }
            Err(current) => *snapshot = current,
        }
    }
}

/// Like [`hold`], but fails fast with `false` (no unit acquired) if the
/// observed pointer is null. Used by consumers that need to detect an empty
/// structure.
pub fn hold_if_not_null<N>(
    slot: &AtomicCountedPtr<N>,
    snapshot: &mut CountedPtr<N>,
    success: Ordering,
) -> bool {
    loop {
        if snapshot.is_null() {
            return false;
        }
        let bumped = CountedPtr::with_count(
            snapshot.ptr,
            snapshot.count.wrapping_add(TRANSIENT_UNIT),
        );
        match slot.compare_exchange_weak(*snapshot, bumped, success, Ordering::Relaxed) {
            Ok(_) => {
                snapshot.count = bumped.count;
                return true;
            }
            Err(current) => *snapshot = current,
        }
    }
}

/// Releases one transient unit on `ptr` without any structural change.
///
/// Used on the failure paths of CAS loops: the thread held the node, the
/// attempted unlink lost, the hold is returned. If this decrement zeroes the
/// combined count, this thread destroys the node.
///
/// # Safety
///
/// `ptr` must have been acquired through a [`hold`] whose unit has not yet
/// been released, and `destroy` must be the node's single destruction path.
pub unsafe fn unhold_transient<N, F>(ptr: *mut N, destroy: F)
where
    N: SplitCounted,
    F: FnOnce(*mut N),
{
    let count = (*ptr).count();
    if count.fetch_sub(TRANSIENT_UNIT, Ordering::Release) == TRANSIENT_UNIT {
        count.load(Ordering::Acquire);
        destroy(ptr);
    }
}

/// Settles a finished slot residency into the node's combined count.
///
/// Called by the thread whose CAS swung `snapshot` out of its shared slot.
/// Transfers the transient units accumulated in `snapshot.count`, minus the
/// caller's own unit, minus one persistent unit when `undock` is true
/// (the caller also structurally removed the node). If the resulting count is
/// zero, this thread (necessarily the last referent) performs an acquire
/// re-load and destroys the node; the release ordering on the decrement makes
/// every prior holder's writes visible to the destructor.
///
/// # Safety
///
/// `snapshot` must be the exact value displaced from the slot by the caller's
/// successful CAS, acquired through a [`hold`] whose unit has not yet been
/// released; `undock` may be true only if that CAS removed the structure's
/// link to the node.
pub unsafe fn unhold<N, F>(snapshot: CountedPtr<N>, undock: bool, destroy: F)
where
    N: SplitCounted,
    F: FnOnce(*mut N),
{
    let delta = snapshot
        .count
        .wrapping_sub(TRANSIENT_UNIT)
        .wrapping_sub(undock as u64);
    let count = (*snapshot.ptr).count();
    let prev = count.fetch_add(delta, Ordering::Release);
    if prev.wrapping_add(delta) == 0 {
        count.load(Ordering::Acquire);
        destroy(snapshot.ptr);
    }
}

#[cfg(test)]
mod test {
    use std::cell::Cell;

    use super::*;

    struct Node {
        count: AtomicU64,
    }

    impl Node {
        fn with_count(count: u64) -> Box<Self> {
            Box::new(Self {
                count: AtomicU64::new(count),
            })
        }
    }

    impl SplitCounted for Node {
        fn count(&self) -> &AtomicU64 {
            &self.count
        }
    }

    #[test]
    fn hold_bumps_slot_counter() {
        let node = Node::with_count(1);
        let raw = Box::into_raw(node);
        let slot = AtomicCountedPtr::new(CountedPtr::new(raw));

        let mut snap = slot.load(Ordering::Relaxed);
        hold(&slot, &mut snap, Ordering::Relaxed);
        assert_eq!(snap.ptr, raw);
        assert_eq!(snap.count, TRANSIENT_UNIT);
        assert_eq!(slot.load(Ordering::Relaxed), snap);

        hold(&slot, &mut snap, Ordering::Relaxed);
        assert_eq!(snap.count, 2 * TRANSIENT_UNIT);

        drop(unsafe { Box::from_raw(raw) });
    }

    #[test]
    fn hold_if_not_null_fails_fast() {
        let slot = AtomicCountedPtr::<Node>::null();
        let mut snap = slot.load(Ordering::Relaxed);
        assert!(!hold_if_not_null(&slot, &mut snap, Ordering::Relaxed));
        assert!(snap.is_null());
        assert_eq!(slot.load(Ordering::Relaxed).count, 0);
    }

    #[test]
    fn unhold_transient_destroys_last() {
        let destroyed = Cell::new(0);
        let del = |p: *mut Node| {
            destroyed.set(destroyed.get() + 1);
            drop(unsafe { Box::from_raw(p) });
        };

        // one outstanding transient unit plus one persistent: survives
        let survivor = Box::into_raw(Node::with_count(TRANSIENT_UNIT + 1));
        unsafe { unhold_transient(survivor, del) };
        assert_eq!(destroyed.get(), 0);
        assert_eq!(
            unsafe { &*survivor }.count.load(Ordering::Relaxed),
            1
        );
        drop(unsafe { Box::from_raw(survivor) });

        // sole remaining transient unit: destroyed exactly once
        let last = Box::into_raw(Node::with_count(TRANSIENT_UNIT));
        unsafe { unhold_transient(last, del) };
        assert_eq!(destroyed.get(), 1);
    }

    #[test]
    fn unhold_settles_and_destroys() {
        let destroyed = Cell::new(0);
        let del = |p: *mut Node| {
            destroyed.set(destroyed.get() + 1);
            drop(unsafe { Box::from_raw(p) });
        };

        // linked node (persistent 1), held twice; the second holder already
        // released its unit early, leaving a transient debt of one unit.
        let raw = Box::into_raw(Node::with_count(1u64.wrapping_sub(TRANSIENT_UNIT)));
        let snap = CountedPtr::with_count(raw, 2 * TRANSIENT_UNIT);
        unsafe { unhold(snap, true, del) };
        assert_eq!(destroyed.get(), 1);

        // undock without outstanding extra holds, structure still linked
        // elsewhere (persistent 2): survives with persistent 1.
        let raw = Box::into_raw(Node::with_count(2));
        let snap = CountedPtr::with_count(raw, TRANSIENT_UNIT);
        unsafe { unhold(snap, true, del) };
        assert_eq!(destroyed.get(), 1);
        assert_eq!(unsafe { &*raw }.count.load(Ordering::Relaxed), 1);
        drop(unsafe { Box::from_raw(raw) });
    }
}
