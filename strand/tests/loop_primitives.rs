//! Event loop primitives driven end to end: trigger burst/cooldown
//! cycles and ticker control.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use strand::{EventHandle, EventLoop};

const BURST: usize = 6;
const TOTAL: usize = 10;
const COOLDOWN: Duration = Duration::from_millis(700);

#[test]
fn trigger_burst_cooldown_resume_halt() {
    common::init_tracing();
    let ev = EventLoop::new().unwrap();

    let fire_times: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::sync_channel::<()>(1);

    let trigger_slot: Arc<Mutex<Option<strand::Trigger>>> = Arc::new(Mutex::new(None));
    let times = fire_times.clone();
    let slot = trigger_slot.clone();
    let trigger = ev.trigger(
        COOLDOWN,
        BURST,
        move || {
            let mut times = times.lock().unwrap();
            times.push(Instant::now());
            if times.len() == TOTAL {
                // Reached the configured total: halt for good.
                if let Some(t) = slot.lock().unwrap().as_ref() {
                    t.halt();
                }
                let _ = done_tx.send(());
            }
        },
        true,
    );
    *trigger_slot.lock().unwrap() = Some(trigger.clone());

    done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("trigger never reached the total");

    // Give it a chance to misbehave, then freeze the record.
    std::thread::sleep(2 * COOLDOWN);
    let times = fire_times.lock().unwrap().clone();

    assert_eq!(times.len(), TOTAL, "no fires after halt");
    assert!(!trigger.is_running());

    // The first burst runs back-to-back, then a cooldown-sized gap
    // precedes fire 7.
    let gap = times[BURST].duration_since(times[BURST - 1]);
    assert!(
        gap >= COOLDOWN - Duration::from_millis(50),
        "cooldown gap was only {gap:?}"
    );
    let burst_span = times[BURST - 1].duration_since(times[0]);
    assert!(
        burst_span < COOLDOWN,
        "burst of {BURST} took {burst_span:?}, expected back-to-back fires"
    );

    ev.shutdown(false);
}

#[test]
fn trigger_never_fires_while_halted() {
    common::init_tracing();
    let ev = EventLoop::new().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let trigger = ev.trigger(
        Duration::from_millis(100),
        4,
        move || {
            c.fetch_add(1, Ordering::AcqRel);
        },
        false, // not started
    );

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(count.load(Ordering::Acquire), 0, "fired before begin()");

    assert!(trigger.start());
    std::thread::sleep(Duration::from_millis(50));
    trigger.halt();
    let after_halt = count.load(Ordering::Acquire);
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(count.load(Ordering::Acquire), after_halt, "fired after halt");

    ev.shutdown(false);
}

#[test]
fn ticker_pause_resume() {
    common::init_tracing();
    let ev = EventLoop::new().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let ticker = ev.call_every(Duration::from_millis(20), move || {
        c.fetch_add(1, Ordering::AcqRel);
    });

    std::thread::sleep(Duration::from_millis(150));
    assert!(ticker.stop());
    let paused_at = count.load(Ordering::Acquire);
    assert!(paused_at >= 3, "expected several ticks, got {paused_at}");

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(count.load(Ordering::Acquire), paused_at, "ticked while paused");

    assert!(ticker.start());
    std::thread::sleep(Duration::from_millis(100));
    assert!(
        count.load(Ordering::Acquire) > paused_at,
        "did not resume after start()"
    );

    ev.shutdown(false);
}
