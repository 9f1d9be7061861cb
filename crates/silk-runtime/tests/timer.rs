//! Timer set: harvest ordering, recurring timers, cancel/refresh/reset,
//! condition timers

use silk_runtime::timer::{TimerCallback, TimerManager};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

fn run_all(cbs: &mut Vec<TimerCallback>) {
    for cb in cbs.drain(..) {
        cb();
    }
}

#[test]
fn expired_timers_harvest_in_deadline_order() {
    let mgr = TimerManager::new();
    let fired: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    for i in 1..=10u64 {
        let f = fired.clone();
        mgr.add_timer(
            i * 100,
            move || {
                f.lock().unwrap().push(i);
            },
            false,
        );
    }

    sleep(Duration::from_millis(550));
    let mut cbs = Vec::new();
    mgr.take_expired(&mut cbs);
    run_all(&mut cbs);
    assert_eq!(*fired.lock().unwrap(), vec![1, 2, 3, 4, 5]);

    sleep(Duration::from_millis(600));
    mgr.take_expired(&mut cbs);
    run_all(&mut cbs);
    assert_eq!(*fired.lock().unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    assert!(!mgr.has_timer());
}

#[test]
fn one_shot_fires_at_most_once() {
    let mgr = TimerManager::new();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    mgr.add_timer(
        50,
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    let mut cbs = Vec::new();
    for _ in 0..3 {
        sleep(Duration::from_millis(80));
        mgr.take_expired(&mut cbs);
        run_all(&mut cbs);
    }
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn recurring_fires_once_per_period() {
    let mgr = TimerManager::new();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let timer = mgr.add_timer(
        100,
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    let mut cbs = Vec::new();
    for _ in 0..4 {
        sleep(Duration::from_millis(120));
        mgr.take_expired(&mut cbs);
        run_all(&mut cbs);
    }
    let fired = count.load(Ordering::SeqCst);
    assert!((3..=5).contains(&fired), "fired {} times", fired);

    assert!(timer.cancel());
    sleep(Duration::from_millis(150));
    mgr.take_expired(&mut cbs);
    run_all(&mut cbs);
    assert_eq!(count.load(Ordering::SeqCst), fired);
    assert!(!mgr.has_timer());
}

#[test]
fn next_timeout_tracks_the_minimum() {
    let mgr = TimerManager::new();
    assert_eq!(mgr.next_timeout_ms(), None);

    mgr.add_timer(5000, || {}, false);
    let t = mgr.next_timeout_ms().unwrap();
    assert!(t > 4000 && t <= 5000);

    let front = mgr.add_timer(100, || {}, false);
    let t = mgr.next_timeout_ms().unwrap();
    assert!(t <= 100);

    front.cancel();
    let t = mgr.next_timeout_ms().unwrap();
    assert!(t > 4000);
}

#[test]
fn refresh_pushes_the_deadline_out() {
    let mgr = TimerManager::new();
    let timer = mgr.add_timer(200, || {}, false);

    sleep(Duration::from_millis(150));
    assert!(timer.refresh());
    let t = mgr.next_timeout_ms().unwrap();
    assert!(t > 150, "deadline not refreshed: {} ms left", t);
}

#[test]
fn reset_changes_the_period() {
    let mgr = TimerManager::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    let timer = mgr.add_timer(
        60_000,
        move || {
            f.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    assert!(timer.reset(100, true));
    sleep(Duration::from_millis(150));
    let mut cbs = Vec::new();
    mgr.take_expired(&mut cbs);
    run_all(&mut cbs);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Dead timers cannot be rescheduled
    assert!(!timer.reset(100, true));
    assert!(!timer.refresh());
    assert!(!timer.cancel());
}

#[test]
fn condition_timer_fires_only_while_sentinel_lives() {
    let mgr = TimerManager::new();
    let count = Arc::new(AtomicUsize::new(0));

    let live = Arc::new(());
    let c = count.clone();
    mgr.add_condition_timer(
        50,
        move || {
            c.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&live),
        false,
    );

    let dead = Arc::new(());
    let weak_dead = Arc::downgrade(&dead);
    let c = count.clone();
    mgr.add_condition_timer(
        50,
        move || {
            c.fetch_add(100, Ordering::SeqCst);
        },
        weak_dead,
        false,
    );
    drop(dead);

    sleep(Duration::from_millis(100));
    let mut cbs = Vec::new();
    mgr.take_expired(&mut cbs);
    run_all(&mut cbs);

    assert_eq!(count.load(Ordering::SeqCst), 1);
    drop(live);
}

#[test]
fn timers_with_equal_deadlines_coexist() {
    let mgr = TimerManager::new();
    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let c = count.clone();
        mgr.add_timer(
            50,
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );
    }

    sleep(Duration::from_millis(100));
    let mut cbs = Vec::new();
    mgr.take_expired(&mut cbs);
    run_all(&mut cbs);
    assert_eq!(count.load(Ordering::SeqCst), 5);
}
