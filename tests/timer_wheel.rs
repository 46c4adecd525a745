use jobsentry::timer::TimerWheel;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn repeating_timer_fires_multiple_times() {
    let mut wheel = TimerWheel::new(2);
    let count = Arc::new(AtomicUsize::new(0));
    let count_for_task = Arc::clone(&count);
    wheel.schedule_repeating(Duration::from_millis(20), move || {
        count_for_task.fetch_add(1, Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(250));
    wheel.shutdown();

    assert!(count.load(Ordering::SeqCst) >= 5, "expected several ticks, got {}", count.load(Ordering::SeqCst));
}

#[test]
fn cancel_stops_future_ticks() {
    let mut wheel = TimerWheel::new(1);
    let count = Arc::new(AtomicUsize::new(0));
    let count_for_task = Arc::clone(&count);
    let id = wheel.schedule_repeating(Duration::from_millis(15), move || {
        count_for_task.fetch_add(1, Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(60));
    assert!(wheel.cancel(id));
    let after_cancel = count.load(Ordering::SeqCst);

    std::thread::sleep(Duration::from_millis(100));
    wheel.shutdown();

    let after_wait = count.load(Ordering::SeqCst);
    assert!(after_wait <= after_cancel + 1, "task kept firing after cancel");
}

#[test]
fn one_shot_task_fires_exactly_once() {
    let mut wheel = TimerWheel::new(1);
    let count = Arc::new(AtomicUsize::new(0));
    let count_for_task = Arc::clone(&count);
    wheel.schedule_once(Duration::from_millis(10), move || {
        count_for_task.fetch_add(1, Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(150));
    wheel.shutdown();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}
