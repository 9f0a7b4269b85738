#![forbid(unsafe_code)]

//! Change-tracking primitives the observation scheduler is built on.
//!
//! - [`Observable`]: A shared, version-tracked value wrapper with change
//!   notification via subscriber callbacks.
//! - [`Subscription`]: RAII guard that automatically unsubscribes on drop.
//! - [`run_tracked`]: Runs a block, records which observables it reads, and
//!   signals once when any of them changes.
//!
//! # Architecture
//!
//! `Observable<T>` uses `Rc<RefCell<..>>` for single-threaded shared ownership.
//! Subscribers are stored as `Weak` function pointers and cleaned up lazily
//! during notification. Tracked reads go through a thread-local frame stack,
//! so the whole module is confined to the thread that owns the values.
//!
//! # Invariants
//!
//! 1. Version increments exactly once per mutation that changes the value.
//! 2. Subscribers are notified in registration order.
//! 3. Setting a value equal to the current value is a no-op (no version bump,
//!    no notifications).
//! 4. Dropping a [`Subscription`] or [`Registration`] removes the callback
//!    before the next notification cycle.
//! 5. A [`Registration`] fires at most once.

pub mod observable;
pub mod tracking;

pub use observable::{Observable, Subscription};
pub use tracking::{Registration, is_tracking, run_tracked, untracked};
