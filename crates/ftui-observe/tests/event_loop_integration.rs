//! End-to-end scenarios: observations driven by a real event loop, with
//! work arriving from other threads.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use ftui_observe::{
    EventLoop, LoopConfig, Observable, ObservationSet, PostError, observe, observe_field,
};
use tracing::{Level, info};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init();
}

thread_local! {
    static RESULTS: Observable<Vec<String>> = Observable::new(Vec::new());
}

#[test]
fn remote_results_trigger_local_observation() {
    init_tracing();
    let lp = EventLoop::new();
    let results = RESULTS.with(Observable::clone);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let tracked = results.clone();
    let seen_clone = Rc::clone(&seen);
    let mut set = ObservationSet::new();
    observe(&lp.handle(), move || {
        let _ = tracked.with(Vec::len);
    })
    .on_change(move || {
        let len = RESULTS.with(|r| r.with_untracked(Vec::len));
        seen_clone.borrow_mut().push(len);
    })
    .store(&mut set);

    let poster = lp.poster();
    let worker = thread::spawn(move || {
        for i in 0..3 {
            let line = format!("result {i}");
            poster
                .post(move || RESULTS.with(|r| r.update(|v| v.push(line))))
                .expect("loop alive");
        }
    });
    worker.join().expect("worker");

    // All three mutations land in one turn, ahead of the continuation the
    // first one posted, so the handler runs once and sees all of them.
    lp.run_until_idle();
    info!(seen = ?seen.borrow(), "remote results delivered");
    assert_eq!(*seen.borrow(), vec![3]);
    assert_eq!(results.get_untracked().len(), 3);

    RESULTS.with(|r| r.update(|v| v.clear()));
    lp.run_until_idle();
    assert_eq!(*seen.borrow(), vec![3, 0]);
}

#[test]
fn poster_reports_closed_loop() {
    let lp = EventLoop::new();
    let poster = lp.poster();
    drop(lp);
    assert_eq!(poster.post(|| {}), Err(PostError::Closed));
    assert_eq!(PostError::Closed.to_string(), "event loop closed");
}

#[test]
fn park_wakes_for_remote_task() {
    init_tracing();
    let lp = EventLoop::new();
    let poster = lp.poster();
    let (tx, rx) = std::sync::mpsc::channel();

    let worker = thread::spawn(move || {
        poster
            .post(move || tx.send(()).expect("receiver"))
            .expect("loop alive");
    });
    worker.join().expect("worker");

    let ran = lp.park(Duration::from_secs(5));
    assert_eq!(ran, 1);
    assert!(rx.try_recv().is_ok());
}

#[test]
fn wall_clock_debounce_fires_once() {
    init_tracing();
    let config = LoopConfig::default().with_idle_wait(Duration::from_millis(5));
    let lp = EventLoop::with_config(config);
    let query = Observable::new(String::new());
    let fires = Rc::new(RefCell::new(Vec::new()));

    let q = query.clone();
    let fires_clone = Rc::clone(&fires);
    let read = query.clone();
    let _obs = observe(&lp.handle(), move || {
        let _ = q.get();
    })
    .debounce(Duration::from_millis(20))
    .on_change(move || fires_clone.borrow_mut().push(read.get_untracked()));

    for text in ["f", "ft", "ftu", "ftui"] {
        query.set(text.into());
        lp.run_until_idle();
    }
    lp.run_for(Duration::from_millis(80));

    assert_eq!(*fires.borrow(), vec!["ftui".to_string()]);
    assert!(lp.is_idle());
}

#[test]
fn debounce_after_idle_period_waits_full_delay() {
    init_tracing();
    let lp = EventLoop::new();
    let x = Observable::new(0);
    let fires = Rc::new(RefCell::new(0u32));

    let tracked = x.clone();
    let fires_clone = Rc::clone(&fires);
    let obs = observe(&lp.handle(), move || {
        let _ = tracked.get();
    })
    .debounce(Duration::from_millis(200))
    .on_change(move || *fires_clone.borrow_mut() += 1);

    // The loop sits idle, as when blocked on input, before the change.
    thread::sleep(Duration::from_millis(300));
    x.set(1);
    lp.run_due();
    assert_eq!(*fires.borrow(), 0);
    assert!(obs.has_pending_fire());

    lp.run_for(Duration::from_millis(400));
    assert_eq!(*fires.borrow(), 1);
    assert!(!obs.has_pending_fire());
}

struct SearchModel {
    query: Observable<String>,
    scope: Observable<u8>,
}

#[test]
fn model_with_several_observations() {
    init_tracing();
    let lp = EventLoop::new();
    let start = lp.now();
    let model = Rc::new(SearchModel {
        query: Observable::new(String::new()),
        scope: Observable::new(0),
    });
    let searches = Rc::new(RefCell::new(Vec::new()));
    let mut set = ObservationSet::new();

    let searches_clone = Rc::clone(&searches);
    observe_field(
        &lp.handle(),
        &model,
        |m| m.query.get(),
        Some(Duration::from_millis(200)),
        true,
        move |m| {
            searches_clone
                .borrow_mut()
                .push((m.query.get_untracked(), m.scope.get_untracked()));
        },
    )
    .store(&mut set);

    let searches_clone = Rc::clone(&searches);
    observe_field(
        &lp.handle(),
        &model,
        |m| m.scope.get(),
        None,
        false,
        move |m| {
            searches_clone
                .borrow_mut()
                .push((m.query.get_untracked(), m.scope.get_untracked()));
        },
    )
    .store(&mut set);
    assert_eq!(set.len(), 2);
    assert_eq!(*searches.borrow(), vec![(String::new(), 0)]);

    for (t, text) in [(0, "r"), (40, "ru"), (80, "rus"), (120, "rust")] {
        lp.run_until(start + Duration::from_millis(t));
        model.query.set(text.into());
    }
    lp.run_until(start + Duration::from_millis(150));
    model.scope.set(2);
    lp.run_until(start + Duration::from_millis(600));

    assert_eq!(
        *searches.borrow(),
        vec![
            (String::new(), 0),
            ("rust".to_string(), 2),
            ("rust".to_string(), 2),
        ]
    );

    set.cancel_all();
    model.query.set("done".into());
    lp.run_until(start + Duration::from_millis(1000));
    assert_eq!(searches.borrow().len(), 3);
    assert!(lp.is_idle());
}
