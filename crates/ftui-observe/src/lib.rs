#![forbid(unsafe_code)]

//! Observe: re-arming change observation with debounce for FrankenTUI.
//!
//! # Role in FrankenTUI
//! `ftui-observe` lets view and model code react when the values a
//! computation reads change, without wiring subscriptions by hand. A
//! tracking closure declares *what* to watch simply by reading
//! [`Observable`]s; a handler runs on the event loop after each change, or
//! once per burst when debounced.
//!
//! # Primary responsibilities
//! - **reactive**: `Observable<T>` values and one-shot dependency tracking
//!   (`run_tracked`).
//! - **context**: the single-threaded `EventLoop` that posted continuations
//!   and debounce timers resume on.
//! - **scheduler**: `observe(..).debounce(..).initial(..).on_change(..)`,
//!   the subscribe, debounce, re-arm state machine.
//! - **store**: `ObservationSet`, an identity-keyed owner for armed
//!   observations.
//! - **field**: `observe_field`, the single-field convenience.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use ftui_observe::{EventLoop, Observable, ObservationSet, observe};
//!
//! let lp = EventLoop::new();
//! let query = Observable::new(String::new());
//! let mut observations = ObservationSet::new();
//!
//! let q = query.clone();
//! observe(&lp.handle(), move || { let _ = q.get(); })
//!     .debounce(Duration::from_millis(200))
//!     .on_change(|| println!("query settled"))
//!     .store(&mut observations);
//!
//! query.set("ftui".into());
//! lp.run_for(Duration::from_millis(300)); // prints once
//! ```
//!
//! # Threading
//! Observables and observations are `!Send` and live on the loop thread.
//! Other threads reach them through [`Poster`].

pub mod context;
pub mod field;
pub mod reactive;
pub mod scheduler;
pub mod store;

pub use context::{
    EventLoop, LoopConfig, LoopHandle, PostError, Poster, SchedulingContext, Task, TimerHandle,
};
pub use field::observe_field;
pub use reactive::{Observable, Registration, Subscription, is_tracking, run_tracked, untracked};
pub use scheduler::{Observation, ObservationId, ObservationStats, ObserveConfig, observe};
pub use store::ObservationSet;
