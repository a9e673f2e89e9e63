//! End-to-end scheduler scenarios.
//!
//! The tick interrupt is modeled the way the runtime expects: a
//! deterministic driver calling `Scheduler::tick` directly stands in for
//! the hardware ISR, and the one busy-wait test uses a real thread as the
//! interrupt context. Mainline draining goes through the event queue
//! exactly as firmware would do it.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use pion_core::IrqLock;
use pion_rt::event::{Event, EventHandler, EventQueue, EventSink};
use pion_rt::sched::{Callback, Context, Scheduler};

fn leaked<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

fn rig<const N: usize, const Q: usize>() -> (&'static Scheduler<N>, &'static EventQueue<Q>) {
    let queue = leaked(EventQueue::<Q>::new());
    queue.init();
    let sched = leaked(Scheduler::<N>::new());
    sched.init(queue);
    (sched, queue)
}

// ---------------------------------------------------------------------------
// Callback helpers: plain-function callbacks carry their state through the
// opaque argument word, pointing at leaked test fixtures.
// ---------------------------------------------------------------------------

fn counter() -> &'static AtomicUsize {
    leaked(AtomicUsize::new(0))
}

fn bump(arg: usize) {
    // SAFETY: `arg` always originates from a leaked `&'static AtomicUsize`
    // in `counting`.
    let count = unsafe { &*(arg as *const AtomicUsize) };
    count.fetch_add(1, Ordering::Relaxed);
}

fn counting(count: &'static AtomicUsize) -> Callback {
    Callback::new(bump, std::ptr::from_ref(count) as usize)
}

/// Records the tick at which each firing was observed.
struct FireLog {
    now: &'static (dyn Fn() -> u64 + Sync),
    ticks: Mutex<Vec<u64>>,
}

fn fire_log<const N: usize>(sched: &'static Scheduler<N>) -> &'static FireLog {
    leaked(FireLog {
        now: leaked(move || sched.now_ms()),
        ticks: Mutex::new(Vec::new()),
    })
}

fn record_fire(arg: usize) {
    // SAFETY: `arg` always originates from a leaked `&'static FireLog` in
    // `recording`.
    let log = unsafe { &*(arg as *const FireLog) };
    let now = (log.now)();
    log.ticks.lock().unwrap().push(now);
}

fn recording(log: &'static FireLog) -> Callback {
    Callback::new(record_fire, std::ptr::from_ref(log) as usize)
}

/// A callback that runs a configurable action — e.g. canceling its own
/// handle, which only exists after `schedule` returns.
struct Reentrant {
    fired: AtomicUsize,
    action: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

fn reentrant() -> &'static Reentrant {
    leaked(Reentrant {
        fired: AtomicUsize::new(0),
        action: Mutex::new(None),
    })
}

fn run_reentrant(arg: usize) {
    // SAFETY: `arg` always originates from a leaked `&'static Reentrant`.
    let fixture = unsafe { &*(arg as *const Reentrant) };
    fixture.fired.fetch_add(1, Ordering::Relaxed);
    if let Some(action) = fixture.action.lock().unwrap().as_mut() {
        action();
    }
}

fn reentrant_callback(fixture: &'static Reentrant) -> Callback {
    Callback::new(run_reentrant, std::ptr::from_ref(fixture) as usize)
}

/// An unrelated event producer used to occupy queue capacity.
struct Blocker {
    hits: AtomicUsize,
}

impl EventHandler for Blocker {
    fn handle(&self, _token: usize) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn example_scenario_two_slot_pool() {
    let (sched, queue) = rig::<2, 4>();

    let log = fire_log(sched);
    let _a = sched.schedule(Context::Interrupt, recording(log), "a", 10, true);

    let fired_b = counter();
    let _b = sched.schedule(Context::Deferred, counting(fired_b), "b", 0, false);

    // B fires inline during schedule, without touching the queue.
    assert_eq!(fired_b.load(Ordering::Relaxed), 1);
    assert_eq!(queue.pending(), 0);
    assert_eq!(sched.in_use(), 1);

    for _ in 0..30 {
        sched.tick();
    }
    assert_eq!(*log.ticks.lock().unwrap(), [10, 20, 30]);
    assert_eq!(fired_b.load(Ordering::Relaxed), 1);
}

#[test]
fn repeatable_timers_fire_on_period() {
    let (sched, queue) = rig::<4, 4>();

    let irq_log = fire_log(sched);
    let _i = sched.schedule(Context::Interrupt, recording(irq_log), "irq", 2, true);
    let def_log = fire_log(sched);
    let _d = sched.schedule(Context::Deferred, recording(def_log), "def", 3, true);

    for _ in 1..=12 {
        sched.tick();
        while queue.process_one() {}
    }
    assert_eq!(*irq_log.ticks.lock().unwrap(), [2, 4, 6, 8, 10, 12]);
    assert_eq!(*def_log.ticks.lock().unwrap(), [3, 6, 9, 12]);
}

#[test]
fn firings_never_closer_than_period_under_lazy_drain() {
    let (sched, queue) = rig::<4, 4>();

    let log = fire_log(sched);
    let _t = sched.schedule(Context::Deferred, recording(log), "lazy", 3, true);

    // The mainline drains only every fifth tick; firings may be delayed,
    // never advanced.
    for tick in 1..=30u64 {
        sched.tick();
        if tick % 5 == 0 {
            while queue.process_one() {}
        }
    }
    let ticks = log.ticks.lock().unwrap();
    assert!(!ticks.is_empty());
    for pair in ticks.windows(2) {
        assert!(pair[1] - pair[0] >= 3, "firings too close: {ticks:?}");
    }
}

#[test]
fn cancel_before_first_due_means_zero_invocations() {
    for context in [Context::Interrupt, Context::Deferred] {
        // Exercise every tick boundary up to the period.
        for boundary in 0..5 {
            let (sched, queue) = rig::<4, 4>();
            let fired = counter();
            let handle = sched.schedule(context, counting(fired), "doomed", 5, true);
            for _ in 0..boundary {
                sched.tick();
            }
            sched.cancel(handle);
            for _ in 0..10 {
                sched.tick();
            }
            while queue.process_one() {}
            assert_eq!(fired.load(Ordering::Relaxed), 0, "{context:?} @{boundary}");
            assert_eq!(sched.in_use(), 0);
        }
    }
}

#[test]
fn cancel_wins_over_queued_fire() {
    let (sched, queue) = rig::<4, 4>();
    let fired = counter();
    let handle = sched.schedule(Context::Deferred, counting(fired), "queued", 2, false);

    sched.tick();
    sched.tick();
    assert_eq!(queue.pending(), 1);

    sched.cancel(handle);
    // The slot stays claimed until the stale event is drained; the queue
    // still holds a reference to it.
    assert_eq!(sched.in_use(), 1);

    let drained = {
        let mut count = 0;
        while queue.process_one() {
            count += 1;
        }
        count
    };
    assert_eq!(drained, 1);
    assert_eq!(fired.load(Ordering::Relaxed), 0);
    assert_eq!(sched.in_use(), 0);
}

#[test]
fn zero_period_fires_inline_for_both_contexts() {
    let (sched, queue) = rig::<4, 4>();
    for context in [Context::Interrupt, Context::Deferred] {
        let fired = counter();
        let _handle = sched.schedule(context, counting(fired), "now", 0, false);
        assert_eq!(fired.load(Ordering::Relaxed), 1, "{context:?}");
        assert_eq!(queue.pending(), 0);
    }
    // Both slots were retired on completion.
    assert_eq!(sched.in_use(), 0);
}

#[test]
#[should_panic(expected = "timer pool exhausted (2 slots)")]
fn pool_exhaustion_is_fatal() {
    let (sched, _queue) = rig::<2, 4>();
    let _a = sched.schedule(Context::Interrupt, counting(counter()), "a", 5, true);
    let _b = sched.schedule(Context::Deferred, counting(counter()), "b", 5, true);
    let _c = sched.schedule(Context::Interrupt, counting(counter()), "c", 5, true);
}

#[test]
fn full_queue_postpones_by_one_tick_at_a_time() {
    let (sched, queue) = rig::<4, 1>();

    let blocker = leaked(Blocker {
        hits: AtomicUsize::new(0),
    });
    assert!(queue.try_push(Event::new(blocker, 0, "blocker")));

    let fired = counter();
    let _t = sched.schedule(Context::Deferred, counting(fired), "throttled", 2, true);

    // Tick 1: not due yet.
    sched.tick();

    // Due from tick 2 on, but the queue stays full: the due tick slides by
    // exactly one per tick and nothing is dropped or duplicated.
    for now in 2..=5u64 {
        sched.tick();
        assert_eq!(sched.now_ms(), now);
        let timers = sched.active_timers();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].next_due_tick, now + 1);
        assert_eq!(queue.pending(), 1, "only the blocker may occupy the queue");
    }
    assert_eq!(fired.load(Ordering::Relaxed), 0);
    assert_eq!(queue.rejected(), 4);

    // Drain the blocker; the very next tick enqueues the timer.
    assert!(queue.process_one());
    assert_eq!(blocker.hits.load(Ordering::Relaxed), 1);
    sched.tick();
    assert_eq!(queue.pending(), 1);
    while queue.process_one() {}
    assert_eq!(fired.load(Ordering::Relaxed), 1);
}

#[test]
fn one_shot_retries_until_queue_frees() {
    let (sched, queue) = rig::<4, 1>();
    let blocker = leaked(Blocker {
        hits: AtomicUsize::new(0),
    });
    assert!(queue.try_push(Event::new(blocker, 0, "blocker")));

    let fired = counter();
    let _t = sched.schedule(Context::Deferred, counting(fired), "oneshot", 1, false);

    for _ in 0..5 {
        sched.tick();
    }
    assert_eq!(fired.load(Ordering::Relaxed), 0);

    assert!(queue.process_one());
    sched.tick();
    while queue.process_one() {}
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    assert_eq!(sched.in_use(), 0);
}

#[test]
#[should_panic(expected = "stale timer handle")]
fn canceling_a_completed_one_shot_is_fatal() {
    let (sched, _queue) = rig::<4, 4>();
    let fired = counter();
    let handle = sched.schedule(Context::Interrupt, counting(fired), "done", 1, false);
    sched.tick();
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    assert_eq!(sched.in_use(), 0);
    sched.cancel(handle);
}

#[test]
#[should_panic(expected = "stale timer handle")]
fn old_handle_does_not_reach_a_reused_slot() {
    let (sched, _queue) = rig::<2, 4>();
    let first = sched.schedule(Context::Interrupt, counting(counter()), "first", 5, true);
    sched.cancel(first);
    // The freed slot is claimed again; the old handle must not cancel it.
    let _second = sched.schedule(Context::Interrupt, counting(counter()), "second", 5, true);
    sched.cancel(first);
}

#[test]
fn interrupt_callback_may_cancel_its_own_handle() {
    let (sched, _queue) = rig::<4, 4>();
    let fixture = reentrant();
    let handle = sched.schedule(Context::Interrupt, reentrant_callback(fixture), "self", 2, true);
    *fixture.action.lock().unwrap() = Some(Box::new(move || sched.cancel(handle)));

    for _ in 0..10 {
        sched.tick();
    }
    assert_eq!(fixture.fired.load(Ordering::Relaxed), 1);
    assert_eq!(sched.in_use(), 0);
}

#[test]
fn deferred_callback_may_cancel_its_own_handle() {
    let (sched, queue) = rig::<4, 4>();
    let fixture = reentrant();
    let handle = sched.schedule(Context::Deferred, reentrant_callback(fixture), "self", 2, true);
    *fixture.action.lock().unwrap() = Some(Box::new(move || sched.cancel(handle)));

    for _ in 0..10 {
        sched.tick();
        while queue.process_one() {}
    }
    assert_eq!(fixture.fired.load(Ordering::Relaxed), 1);
    assert_eq!(sched.in_use(), 0);
}

#[test]
fn one_shot_deferred_lifecycle() {
    let (sched, queue) = rig::<4, 4>();
    let fired = counter();
    let _t = sched.schedule(Context::Deferred, counting(fired), "once", 3, false);

    sched.tick();
    sched.tick();
    sched.tick();
    let timers = sched.active_timers();
    assert_eq!(timers.len(), 1);
    assert!(timers[0].pending);
    // One-shots are not rearmed at enqueue time.
    assert_eq!(timers[0].next_due_tick, 3);

    while queue.process_one() {}
    assert_eq!(fired.load(Ordering::Relaxed), 1);
    assert_eq!(sched.in_use(), 0);
}

#[test]
fn wait_advances_with_a_live_tick_source() {
    let (sched, _queue) = rig::<4, 4>();
    let stop = leaked(AtomicBool::new(false));

    let ticker = std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            sched.tick();
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
    });

    sched.wait_ms(20);
    assert!(sched.now_ms() >= 20);

    stop.store(true, Ordering::Relaxed);
    ticker.join().unwrap();
}

#[test]
#[should_panic(expected = "wait_ms called with interrupts masked")]
fn wait_inside_a_critical_section_is_fatal() {
    let (sched, _queue) = rig::<4, 4>();
    let lock = IrqLock::new(());
    let _guard = lock.lock();
    sched.wait_ms(1);
}

#[test]
#[should_panic(expected = "wait_ms before scheduler init")]
fn wait_before_init_is_fatal() {
    let sched = leaked(Scheduler::<4>::new());
    sched.wait_ms(1);
}
