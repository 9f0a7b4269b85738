#![forbid(unsafe_code)]

//! One-shot dependency tracking.
//!
//! [`run_tracked`] executes a block while recording every [`Observable`] the
//! block reads, then calls `on_change` exactly once, the first time any of
//! those observables is mutated. After firing, the registration drops all of
//! its subscriptions: it never fires again, and the caller must call
//! `run_tracked` again to keep observing.
//!
//! # Design
//!
//! A thread-local stack of frames holds the registration currently being
//! recorded. [`Observable::get`] and [`Observable::with`] consult the top
//! frame and subscribe a weak trigger callback the first time they are read
//! in that frame. Nested `run_tracked` calls record into the innermost frame
//! only; [`untracked`] pushes an empty frame so nothing is recorded.
//!
//! # Invariants
//!
//! 1. `on_change` runs at most once per registration.
//! 2. A registration holds at most one subscription per observable.
//! 3. Once fired or dropped, a registration holds no subscriptions.
//! 4. Reads outside any tracked block record nothing.
//!
//! [`Observable`]: super::Observable
//! [`Observable::get`]: super::Observable::get
//! [`Observable::with`]: super::Observable::with

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use super::observable::Subscription;

thread_local! {
    /// Innermost frame last; `None` marks an untracked scope.
    static FRAMES: RefCell<Vec<Option<Rc<RegistrationInner>>>> = const { RefCell::new(Vec::new()) };
}

struct RegistrationInner {
    fired: Cell<bool>,
    on_change: RefCell<Option<Box<dyn FnOnce()>>>,
    /// Dependency key and the subscription that watches it.
    sources: RefCell<Vec<(usize, Subscription)>>,
}

impl RegistrationInner {
    fn fire(&self) {
        if self.fired.replace(true) {
            return;
        }
        let sources = std::mem::take(&mut *self.sources.borrow_mut());
        let on_change = self.on_change.borrow_mut().take();
        drop(sources);
        if let Some(on_change) = on_change {
            on_change();
        }
    }
}

/// Handle to a one-shot tracking registration.
///
/// Dropping the registration unsubscribes it; `on_change` will not run
/// afterwards.
pub struct Registration {
    inner: Rc<RegistrationInner>,
}

impl Registration {
    /// Whether the change callback has already run.
    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.inner.fired.get()
    }

    /// Number of distinct observables recorded and still watched.
    #[must_use]
    pub fn dependency_count(&self) -> usize {
        self.inner.sources.borrow().len()
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("fired", &self.is_fired())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

/// Pops the frame pushed by `run_tracked`/`untracked`, even on unwind.
struct FrameGuard;

impl FrameGuard {
    fn push(frame: Option<Rc<RegistrationInner>>) -> Self {
        FRAMES.with(|frames| frames.borrow_mut().push(frame));
        Self
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

/// Run `block`, recording the observables it reads, and arrange for
/// `on_change` to be called once when any of them changes.
///
/// `on_change` runs synchronously inside the mutating call
/// ([`Observable::set`](super::Observable::set) or `update`), so it should
/// only hand work off rather than mutate observables itself.
pub fn run_tracked(block: impl FnOnce(), on_change: impl FnOnce() + 'static) -> Registration {
    let inner = Rc::new(RegistrationInner {
        fired: Cell::new(false),
        on_change: RefCell::new(Some(Box::new(on_change))),
        sources: RefCell::new(Vec::new()),
    });
    {
        let _frame = FrameGuard::push(Some(Rc::clone(&inner)));
        block();
    }
    Registration { inner }
}

/// Run `block` without recording any reads, even inside a tracked block.
pub fn untracked<R>(block: impl FnOnce() -> R) -> R {
    let _frame = FrameGuard::push(None);
    block()
}

/// Whether a tracked block is currently recording reads on this thread.
#[must_use]
pub fn is_tracking() -> bool {
    FRAMES.with(|frames| matches!(frames.borrow().last(), Some(Some(_))))
}

/// Record a read of the dependency identified by `key`.
///
/// `subscribe` is called at most once per frame and key; it receives the
/// trigger to invoke on change and returns the subscription to hold.
pub(crate) fn record_read(key: usize, subscribe: impl FnOnce(Box<dyn Fn()>) -> Subscription) {
    let Some(frame) = FRAMES.with(|frames| frames.borrow().last().cloned().flatten()) else {
        return;
    };
    if frame.fired.get() || frame.sources.borrow().iter().any(|(k, _)| *k == key) {
        return;
    }
    let weak = Rc::downgrade(&frame);
    let subscription = subscribe(Box::new(move || {
        if let Some(inner) = weak.upgrade() {
            inner.fire();
        }
    }));
    frame.sources.borrow_mut().push((key, subscription));
}
