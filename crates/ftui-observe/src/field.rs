#![forbid(unsafe_code)]

//! Single-field convenience over [`observe`].
//!
//! [`observe_field`] watches whatever `field` reads from `object`. The object
//! is held weakly by both the tracking function and the handler: once the
//! last strong reference is gone, tracking reads nothing and the handler is
//! skipped. The observation does not keep its owner alive.

use std::rc::Rc;
use std::time::Duration;

use crate::context::SchedulingContext;
use crate::scheduler::{Observation, observe};

/// Observe one field of `object`.
///
/// `field` should read an [`Observable`](crate::reactive::Observable) (or
/// several) through `get`/`with`; its return value is discarded. `handler`
/// receives the object on every fire.
///
/// ```ignore
/// let model = Rc::new(Model { query: Observable::new(String::new()) });
/// let obs = observe_field(
///     &lp.handle(),
///     &model,
///     |m| m.query.get(),
///     Some(Duration::from_millis(200)),
///     false,
///     |m| run_search(&m.query.get_untracked()),
/// );
/// ```
pub fn observe_field<C, T, V>(
    context: &C,
    object: &Rc<T>,
    field: impl Fn(&T) -> V + 'static,
    debounce: Option<Duration>,
    initial: bool,
    mut handler: impl FnMut(&T) + 'static,
) -> Observation
where
    C: SchedulingContext + Clone + 'static,
    T: 'static,
{
    let tracked = Rc::downgrade(object);
    let target = Rc::downgrade(object);
    observe(context, move || {
        if let Some(object) = tracked.upgrade() {
            let _ = field(&object);
        }
    })
    .debounce(debounce)
    .initial(initial)
    .on_change(move || {
        if let Some(object) = target.upgrade() {
            handler(&object);
        }
    })
}
