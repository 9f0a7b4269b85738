#![forbid(unsafe_code)]

//! Scheduling context: posted continuations and cancellable timers.
//!
//! Observations never run their handlers from inside a change notification.
//! They post a continuation to a [`SchedulingContext`] and, when debouncing,
//! start a timer on it. [`EventLoop`] is the single-threaded implementation
//! used by applications and tests.
//!
//! # Driving the loop
//!
//! | Method | Time source | Use |
//! |--------|-------------|-----|
//! | [`run_until_idle`](EventLoop::run_until_idle) | unchanged | drain posted work |
//! | [`run_until`](EventLoop::run_until) | explicit `Instant` | deterministic tests |
//! | [`advance`](EventLoop::advance) | `now() + d` | deterministic tests |
//! | [`run_due`](EventLoop::run_due) | `Instant::now()` | real event loops |
//! | [`park`](EventLoop::park) / [`run_for`](EventLoop::run_for) | `Instant::now()` | blocking loops |
//!
//! # Invariants
//!
//! 1. Posted tasks run in submission order.
//! 2. Timers run in deadline order; equal deadlines run in start order.
//! 3. A cancelled timer never runs.
//! 4. No loop borrow is held while a task runs, so tasks may post, start,
//!    and cancel freely.
//! 5. `now()` never moves backwards.
//! 6. Wall-clock driving moves `now()` up to `Instant::now()` before any
//!    posted work runs.
//! 7. A timer whose deadline is past the range of `Instant` never runs.
//!
//! # Threads
//!
//! Everything here except [`Poster`] is `!Send`. Other threads hand work to
//! the loop through a [`Poster`], whose tasks are queued on an `mpsc` channel
//! and moved onto the local queue at the start of every turn.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::{trace, warn};

/// A continuation that runs on the loop thread.
pub type Task = Box<dyn FnOnce()>;

/// A continuation submitted from another thread.
pub type RemoteTask = Box<dyn FnOnce() + Send>;

/// The designated context observations resume on.
pub trait SchedulingContext {
    /// Queue `task` to run on this context after the current work, in
    /// submission order.
    fn post(&self, task: Task);

    /// Run `task` on this context once `delay` has elapsed, unless the
    /// returned handle is cancelled or dropped first.
    fn start_timer(&self, delay: Duration, task: Task) -> TimerHandle;

    /// The context's current notion of time.
    fn now(&self) -> Instant;
}

/// Cancellable handle for a started timer.
///
/// Dropping the handle cancels the timer. Cancelling a timer that has
/// already run is a no-op.
pub struct TimerHandle {
    deadline: Option<Instant>,
    canceller: Option<Box<dyn FnOnce()>>,
}

impl TimerHandle {
    /// Build a handle for a context-specific timer. `cancel` must remove the
    /// timer so it never runs; it is called at most once.
    pub fn new(deadline: Instant, cancel: impl FnOnce() + 'static) -> Self {
        Self {
            deadline: Some(deadline),
            canceller: Some(Box::new(cancel)),
        }
    }

    /// Handle for a timer whose deadline is past the representable range of
    /// `Instant`. It never runs, so there is nothing to cancel.
    #[must_use]
    pub fn never() -> Self {
        Self {
            deadline: None,
            canceller: None,
        }
    }

    /// When the timer is due. `None` for a timer that never elapses.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel the timer.
    pub fn cancel(mut self) {
        self.cancel_in_place();
    }

    fn cancel_in_place(&mut self) {
        if let Some(cancel) = self.canceller.take() {
            cancel();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel_in_place();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Error returned by [`Poster::post`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostError {
    /// The event loop has been dropped.
    Closed,
}

impl fmt::Display for PostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "event loop closed"),
        }
    }
}

impl std::error::Error for PostError {}

/// Configuration for [`EventLoop`].
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Maximum tasks executed by one `run_until_idle` call. Work posted past
    /// the budget stays queued for the next turn.
    pub max_tasks_per_turn: usize,
    /// Longest single blocking wait used by [`EventLoop::run_for`].
    pub idle_wait: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_turn: 1024,
            idle_wait: Duration::from_millis(100),
        }
    }
}

impl LoopConfig {
    /// Set the per-turn task budget (clamped to at least 1).
    #[must_use]
    pub fn with_max_tasks_per_turn(mut self, max: usize) -> Self {
        self.max_tasks_per_turn = max.max(1);
        self
    }

    /// Set the idle wait used by blocking drivers.
    #[must_use]
    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait;
        self
    }
}

/// Timer queue key: deadline first, then start order.
type TimerKey = (Instant, u64);

struct LoopState {
    now: Instant,
    queue: VecDeque<Task>,
    timers: BTreeMap<TimerKey, Task>,
    next_timer: u64,
}

impl LoopState {
    /// Pop the earliest timer due by `target`; `None` means no bound.
    fn pop_due_timer(&mut self, target: Option<Instant>) -> Option<(Instant, Task)> {
        let (&(deadline, _), _) = self.timers.first_key_value()?;
        if target.is_some_and(|target| deadline > target) {
            return None;
        }
        self.timers
            .pop_first()
            .map(|((deadline, _), task)| (deadline, task))
    }
}

/// Cloneable [`SchedulingContext`] for an [`EventLoop`].
#[derive(Clone)]
pub struct LoopHandle {
    state: Rc<RefCell<LoopState>>,
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("LoopHandle")
            .field("pending_tasks", &state.queue.len())
            .field("pending_timers", &state.timers.len())
            .finish()
    }
}

impl SchedulingContext for LoopHandle {
    fn post(&self, task: Task) {
        self.state.borrow_mut().queue.push_back(task);
    }

    fn start_timer(&self, delay: Duration, task: Task) -> TimerHandle {
        let key = {
            let mut state = self.state.borrow_mut();
            match state.now.checked_add(delay) {
                Some(deadline) => {
                    let key = (deadline, state.next_timer);
                    state.next_timer += 1;
                    state.timers.insert(key, task);
                    Ok(key)
                }
                None => Err(task),
            }
        };
        let key = match key {
            Ok(key) => key,
            Err(task) => {
                trace!(delay_secs = delay.as_secs(), "timer deadline out of range, never due");
                // Dropped outside the borrow: the task may own loop handles.
                drop(task);
                return TimerHandle::never();
            }
        };
        let weak: Weak<RefCell<LoopState>> = Rc::downgrade(&self.state);
        TimerHandle::new(key.0, move || {
            if let Some(state) = weak.upgrade() {
                let cancelled = state.borrow_mut().timers.remove(&key);
                // Dropped outside the borrow: the task may own loop handles.
                drop(cancelled);
            }
        })
    }

    fn now(&self) -> Instant {
        self.state.borrow().now
    }
}

/// `Send` handle for posting work to an [`EventLoop`] from other threads.
#[derive(Clone)]
pub struct Poster {
    sender: mpsc::Sender<RemoteTask>,
}

impl fmt::Debug for Poster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poster").finish_non_exhaustive()
    }
}

impl Poster {
    /// Queue `task` for the loop thread.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> Result<(), PostError> {
        self.sender
            .send(Box::new(task))
            .map_err(|_| PostError::Closed)
    }
}

/// Single-threaded event loop with a FIFO task queue and a timer queue.
pub struct EventLoop {
    handle: LoopHandle,
    config: LoopConfig,
    remote_tx: mpsc::Sender<RemoteTask>,
    remote_rx: mpsc::Receiver<RemoteTask>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("handle", &self.handle)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Create a loop with default configuration, starting at `Instant::now()`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LoopConfig::default())
    }

    /// Create a loop with the given configuration.
    #[must_use]
    pub fn with_config(config: LoopConfig) -> Self {
        let (remote_tx, remote_rx) = mpsc::channel();
        Self {
            handle: LoopHandle {
                state: Rc::new(RefCell::new(LoopState {
                    now: Instant::now(),
                    queue: VecDeque::new(),
                    timers: BTreeMap::new(),
                    next_timer: 0,
                })),
            },
            config,
            remote_tx,
            remote_rx,
        }
    }

    /// A cloneable scheduling context for this loop.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// A `Send` poster for other threads.
    #[must_use]
    pub fn poster(&self) -> Poster {
        Poster {
            sender: self.remote_tx.clone(),
        }
    }

    /// The loop's current time.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.handle.state.borrow().now
    }

    /// Number of posted tasks waiting to run.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.handle.state.borrow().queue.len()
    }

    /// Number of timers waiting to elapse.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.handle.state.borrow().timers.len()
    }

    /// Deadline of the earliest pending timer.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.handle
            .state
            .borrow()
            .timers
            .first_key_value()
            .map(|(&(deadline, _), _)| deadline)
    }

    /// True when no task is queued and no timer is pending.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let state = self.handle.state.borrow();
        state.queue.is_empty() && state.timers.is_empty()
    }

    /// Run queued tasks, including those they post, without advancing time.
    ///
    /// Returns the number of tasks run. Stops after
    /// [`LoopConfig::max_tasks_per_turn`] tasks.
    pub fn run_until_idle(&self) -> usize {
        self.drain_remote();
        let mut ran = 0;
        while ran < self.config.max_tasks_per_turn {
            let Some(task) = self.handle.state.borrow_mut().queue.pop_front() else {
                return ran;
            };
            task();
            ran += 1;
        }
        if self.pending_tasks() > 0 {
            warn!(
                budget = self.config.max_tasks_per_turn,
                remaining = self.pending_tasks(),
                "event loop task budget exhausted"
            );
        }
        ran
    }

    /// Advance time to `target`, running every timer due by then in deadline
    /// order and draining posted work after each one.
    ///
    /// While a timer runs, `now()` reports its deadline unless time has
    /// already moved past it, so timers started from inside it are measured
    /// from that point.
    pub fn run_until(&self, target: Instant) -> usize {
        let ran = self.run_timers(Some(target));
        self.catch_up(target);
        ran
    }

    /// Run posted work and timers due by `target`, or every pending timer
    /// when `target` is `None`.
    fn run_timers(&self, target: Option<Instant>) -> usize {
        let mut ran = self.run_until_idle();
        loop {
            let due = self.handle.state.borrow_mut().pop_due_timer(target);
            let Some((deadline, task)) = due else {
                break;
            };
            self.catch_up(deadline);
            trace!(pending = self.pending_timers(), "timer elapsed");
            task();
            ran += 1 + self.run_until_idle();
        }
        ran
    }

    /// Move `now()` forward to `to`. Never moves it backwards.
    fn catch_up(&self, to: Instant) {
        let mut state = self.handle.state.borrow_mut();
        state.now = state.now.max(to);
    }

    /// Advance time by `delta`. See [`run_until`](Self::run_until).
    ///
    /// A `delta` past the representable range of `Instant` runs every
    /// pending timer and leaves `now()` at the last deadline reached.
    pub fn advance(&self, delta: Duration) -> usize {
        match self.now().checked_add(delta) {
            Some(target) => self.run_until(target),
            None => self.run_timers(None),
        }
    }

    /// Run everything due by the wall clock.
    ///
    /// `now()` catches up with the wall clock before posted work runs, so
    /// timers started by that work are measured from the present, not from
    /// the previous turn.
    pub fn run_due(&self) -> usize {
        let now = Instant::now();
        self.catch_up(now);
        self.run_until(now)
    }

    /// Block for at most `max_wait`, waking early for the next timer or a
    /// remote task, then run everything due.
    pub fn park(&self, max_wait: Duration) -> usize {
        if self.pending_tasks() == 0 {
            let now = Instant::now();
            let wait = match self.next_deadline() {
                Some(deadline) => max_wait.min(deadline.saturating_duration_since(now)),
                None => max_wait,
            };
            if !wait.is_zero()
                && let Ok(task) = self.remote_rx.recv_timeout(wait)
            {
                self.handle.state.borrow_mut().queue.push_back(task);
            }
        }
        self.run_due()
    }

    /// Drive the loop on the wall clock for `duration`. A duration past the
    /// representable range of `Instant` never returns.
    pub fn run_for(&self, duration: Duration) -> usize {
        let end = Instant::now().checked_add(duration);
        let mut ran = 0;
        loop {
            let wait = match end {
                Some(end) => {
                    let now = Instant::now();
                    if now >= end {
                        break;
                    }
                    self.config.idle_wait.min(end - now)
                }
                None => self.config.idle_wait,
            };
            ran += self.park(wait);
        }
        ran + self.run_due()
    }

    fn drain_remote(&self) {
        let mut state = self.handle.state.borrow_mut();
        while let Ok(task) = self.remote_rx.try_recv() {
            state.queue.push_back(task);
        }
    }
}
