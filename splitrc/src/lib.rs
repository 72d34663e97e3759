//! Lock-free data structures built on a split reference-count protocol.
//!
//! Safe memory reclamation without epochs, hazard pointers or deferred
//! retirement: each node carries a single 64-bit word combining a transient
//! hold count and a persistent link count, and is freed by whichever thread
//! drives the word to zero. See [`split_ref`] for the protocol itself.
//!
//! On top of it: a Treiber [`Stack`], a Michael–Scott [`Queue`], a
//! fixed-capacity [`Pool`], and [`Shared`]/[`AtomicShared`] pointer handles.

pub mod counted;
pub mod pool;
pub mod queue;
pub mod shared;
pub mod split_ref;
pub mod stack;

pub use counted::{AtomicCountedPtr, CountedPtr};
pub use pool::Pool;
pub use queue::Queue;
pub use shared::{AtomicShared, Shared};
pub use split_ref::{
    hold, hold_if_not_null, unhold, unhold_transient, SplitCounted, TRANSIENT_UNIT,
};
pub use stack::Stack;
