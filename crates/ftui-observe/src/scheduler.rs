#![forbid(unsafe_code)]

//! Re-arming observation with optional debounce.
//!
//! An observation runs a tracking function under [`run_tracked`], waits for
//! the one-shot change signal, hands the signal to its
//! [`SchedulingContext`], applies the debounce policy, and tracks again.
//!
//! # Lifecycle
//!
//! ```text
//! observe(ctx, track)          ObserveConfig   (value, cloneable)
//!   .debounce(200ms)
//!   .initial(true)
//!   .on_change(handler)  ───▶  Observation     (armed, identity-bearing)
//!
//!  Subscribed ──change──▶ post ──▶ [cancelled?] ──▶ debounce ──▶ Subscribed
//!       │                                                   │
//!       └────────────── cancel() / drop ──▶ Cancelled ◀─────┘
//! ```
//!
//! Configuration methods exist only on [`ObserveConfig`], and
//! [`ObserveConfig::on_change`] consumes it, so an armed observation cannot
//! be reconfigured.
//!
//! # Debounce
//!
//! Every change cancels the pending timer first. Without a delay the handler
//! runs in the continuation that processes the change. With a delay `d`, a
//! fresh timer for the full `d` starts on every change (trailing edge, full
//! reset), so a burst with gaps shorter than `d` fires once, `d` after its
//! last change.
//!
//! # Invariants
//!
//! 1. A live observation holds exactly one tracking registration.
//! 2. At most one debounce timer is pending; none without a delay.
//! 3. `cancelled` never reverts; cancelling releases the handler, the timer,
//!    and the registration.
//! 4. Every resumption point (posted continuation, timer) checks
//!    `cancelled` before acting.
//! 5. Re-tracking happens on every change, whether or not a timer is pending.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, debug_span, trace};

use crate::context::{SchedulingContext, TimerHandle};
use crate::reactive::{Registration, run_tracked};
use crate::store::ObservationSet;

static NEXT_OBSERVATION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an armed [`Observation`].
///
/// Two observations built from identical configuration still have distinct
/// ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservationId(u64);

impl ObservationId {
    fn next() -> Self {
        Self(NEXT_OBSERVATION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, for logs.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obs#{}", self.0)
    }
}

/// Counters describing what an observation has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservationStats {
    /// Change signals processed on the scheduling context.
    pub changes: u64,
    /// Handler invocations, including the initial one.
    pub fires: u64,
    /// Debounce timers cancelled by a newer change.
    pub superseded: u64,
}

/// Configuration phase of an observation.
///
/// Built by [`observe`]; armed by [`on_change`](Self::on_change).
#[derive(Clone)]
pub struct ObserveConfig {
    context: Rc<dyn SchedulingContext>,
    track: Rc<dyn Fn()>,
    delay: Option<Duration>,
    initial: bool,
}

impl fmt::Debug for ObserveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserveConfig")
            .field("delay", &self.delay)
            .field("initial", &self.initial)
            .finish_non_exhaustive()
    }
}

/// Start configuring an observation of whatever `track` reads.
///
/// `track` runs once at arming and again after every change; every
/// [`Observable`](crate::reactive::Observable) it reads with `get`/`with`
/// is watched.
pub fn observe<C>(context: &C, track: impl Fn() + 'static) -> ObserveConfig
where
    C: SchedulingContext + Clone + 'static,
{
    ObserveConfig {
        context: Rc::new(context.clone()),
        track: Rc::new(track),
        delay: None,
        initial: false,
    }
}

impl ObserveConfig {
    /// Coalesce changes for `delay` before firing. `None` fires on every
    /// change.
    #[must_use]
    pub fn debounce(mut self, delay: impl Into<Option<Duration>>) -> Self {
        self.delay = delay.into();
        self
    }

    /// Also fire once immediately when armed.
    #[must_use]
    pub fn initial(mut self, initial: bool) -> Self {
        self.initial = initial;
        self
    }

    /// Configured debounce delay.
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        self.delay
    }

    /// Whether the handler fires at arming.
    #[must_use]
    pub fn fires_initially(&self) -> bool {
        self.initial
    }

    /// Arm the observation: track once, fire immediately if `initial`, and
    /// call `handler` after every subsequent change.
    pub fn on_change(self, handler: impl FnMut() + 'static) -> Observation {
        let state = Rc::new(ObserverState {
            id: ObservationId::next(),
            context: self.context,
            track: self.track,
            handler: RefCell::new(Some(Box::new(handler))),
            delay: self.delay,
            cancelled: Cell::new(false),
            pending: RefCell::new(None),
            registration: RefCell::new(None),
            stats: Cell::new(ObservationStats::default()),
        });
        debug!(
            observation = state.id.get(),
            delay_ms = self.delay.map(|d| d.as_millis() as u64),
            initial = self.initial,
            "observation armed"
        );
        state.subscribe();
        if self.initial {
            state.fire();
        }
        Observation { state }
    }
}

struct ObserverState {
    id: ObservationId,
    context: Rc<dyn SchedulingContext>,
    track: Rc<dyn Fn()>,
    handler: RefCell<Option<Box<dyn FnMut()>>>,
    delay: Option<Duration>,
    cancelled: Cell<bool>,
    pending: RefCell<Option<TimerHandle>>,
    registration: RefCell<Option<Registration>>,
    stats: Cell<ObservationStats>,
}

impl ObserverState {
    fn bump(&self, f: impl FnOnce(&mut ObservationStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    /// Enter `Subscribed`: run `track` under a fresh one-shot registration.
    fn subscribe(self: &Rc<Self>) {
        if self.cancelled.get() {
            return;
        }
        let weak = Rc::downgrade(self);
        let registration = run_tracked(|| (self.track)(), move || Self::signal(&weak));
        if self.cancelled.get() {
            return;
        }
        if registration.dependency_count() == 0 {
            debug!(observation = self.id.get(), "tracking read no observables");
        }
        let previous = self.registration.borrow_mut().replace(registration);
        drop(previous);
    }

    /// Raw change signal from the tracking facility. Only posts; all state
    /// changes happen in the continuation.
    fn signal(weak: &Weak<Self>) {
        let Some(state) = weak.upgrade() else {
            return;
        };
        if state.cancelled.get() {
            return;
        }
        trace!(observation = state.id.get(), "change signalled");
        let weak = Rc::downgrade(&state);
        state.context.post(Box::new(move || {
            if let Some(state) = weak.upgrade() {
                state.on_signal();
            }
        }));
    }

    /// Posted continuation: debounce, then re-track.
    fn on_signal(self: &Rc<Self>) {
        if self.cancelled.get() {
            trace!(observation = self.id.get(), "stale change after cancel");
            return;
        }
        self.bump(|s| s.changes += 1);
        self.apply_debounce();
        self.subscribe();
    }

    fn apply_debounce(self: &Rc<Self>) {
        let superseded = self.pending.borrow_mut().take();
        if let Some(timer) = superseded {
            self.bump(|s| s.superseded += 1);
            timer.cancel();
        }

        let Some(delay) = self.delay else {
            self.fire();
            return;
        };

        trace!(
            observation = self.id.get(),
            delay_ms = delay.as_millis() as u64,
            "debounce restarted"
        );
        let weak = Rc::downgrade(self);
        let timer = self.context.start_timer(
            delay,
            Box::new(move || {
                let Some(state) = weak.upgrade() else {
                    return;
                };
                let elapsed = state.pending.borrow_mut().take();
                drop(elapsed);
                if state.cancelled.get() {
                    trace!(observation = state.id.get(), "stale timer after cancel");
                    return;
                }
                state.fire();
            }),
        );
        *self.pending.borrow_mut() = Some(timer);
    }

    /// Invoke the handler unless cancelled. The handler is taken out for the
    /// call so it may cancel its own observation.
    fn fire(&self) {
        if self.cancelled.get() {
            return;
        }
        let Some(mut handler) = self.handler.borrow_mut().take() else {
            return;
        };
        self.bump(|s| s.fires += 1);
        trace!(observation = self.id.get(), "handler fired");
        {
            let _span = debug_span!("observation_fire", observation = self.id.get()).entered();
            handler();
        }
        if !self.cancelled.get() {
            *self.handler.borrow_mut() = Some(handler);
        }
    }

    fn cancel(&self) {
        if self.cancelled.replace(true) {
            return;
        }
        let timer = self.pending.borrow_mut().take();
        let registration = self.registration.borrow_mut().take();
        let handler = self.handler.borrow_mut().take();
        drop(timer);
        drop(registration);
        drop(handler);
        debug!(observation = self.id.get(), "observation cancelled");
    }
}

/// An armed observation.
///
/// Dropping it cancels it, including any pending debounce timer. Keep it
/// alive in a field or an [`ObservationSet`].
pub struct Observation {
    state: Rc<ObserverState>,
}

impl Observation {
    /// Identity of this observation.
    #[must_use]
    pub fn id(&self) -> ObservationId {
        self.state.id
    }

    /// Stop observing. Idempotent; safe to call from inside the handler.
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.get()
    }

    /// Whether a debounced fire is waiting for its timer.
    #[must_use]
    pub fn has_pending_fire(&self) -> bool {
        self.state.pending.borrow().is_some()
    }

    /// Debounce delay this observation was armed with.
    #[must_use]
    pub fn delay(&self) -> Option<Duration> {
        self.state.delay
    }

    /// Counters for changes, fires, and superseded timers.
    #[must_use]
    pub fn stats(&self) -> ObservationStats {
        self.state.stats.get()
    }

    /// Move this observation into `set`, keeping it alive until removed.
    pub fn store(self, set: &mut ObservationSet) -> ObservationId {
        set.insert(self)
    }
}

impl fmt::Debug for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observation")
            .field("id", &self.state.id)
            .field("delay", &self.state.delay)
            .field("cancelled", &self.is_cancelled())
            .field("pending_fire", &self.has_pending_fire())
            .field("stats", &self.stats())
            .finish()
    }
}

impl PartialEq for Observation {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for Observation {}

impl std::hash::Hash for Observation {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.state.id.hash(state);
    }
}

impl Drop for Observation {
    fn drop(&mut self) {
        if !self.state.cancelled.get() {
            debug!(observation = self.state.id.get(), "observation dropped");
        }
        self.state.cancel();
    }
}
