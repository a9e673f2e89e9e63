//! Software-timer scheduler.
//!
//! One periodic hardware interrupt ([`TickSource`], 1 kHz) drives a fixed
//! pool of logical timers. A due timer either runs its callback directly in
//! interrupt context or defers it through the bounded event queue into the
//! cooperative mainline. All pool state — including the tick counter, which
//! doubles as the firmware's monotonic millisecond clock — sits behind a
//! single [`IrqLock`] shared by the tick handler and mainline calls.
//!
//! The pool never allocates. Slots form a fixed arena, handles are
//! epoch-stamped indexes, and a full pool is a fatal error rather than a
//! growth point. When the event queue backs up, a periodic timer postpones
//! its refire by one tick per tick instead of queueing a second event, so a
//! slot never has more than one event in flight.

use heapless::Vec;
use pion_core::sync::{self, IrqLock};

use crate::config::{TICK_HZ, TIMER_POOL_SIZE};
use crate::event::{self, Event, EventHandler, EventSink};

/// A hardware tick source driving a scheduler at a fixed cadence.
///
/// The only contract: once started, call `handler` exactly once per physical
/// tick, from interrupt context. Timing fidelity is bounded by interrupt
/// latency alone; no jitter compensation is performed.
pub trait TickSource {
    /// Configures the hardware to interrupt at `hz`, invoking `handler` once
    /// per interrupt.
    fn start_periodic(&mut self, hz: u32, handler: fn());
}

/// Where a timer's callback executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// Directly inside the tick interrupt handler.
    Interrupt,
    /// Later, in cooperative mainline context, via the event queue.
    Deferred,
}

/// A callback together with its captured argument.
///
/// The argument is one opaque word — an index, a peripheral address, or a
/// pointer the callee knows how to interpret.
#[derive(Debug, Clone, Copy)]
pub struct Callback {
    func: fn(usize),
    arg: usize,
}

impl Callback {
    /// Creates a callback that receives `arg` when invoked.
    pub const fn new(func: fn(usize), arg: usize) -> Self {
        Self { func, arg }
    }

    /// Adapts a callback that takes no argument.
    pub fn from_fn(func: fn()) -> Self {
        Self {
            func: call_bare,
            arg: func as usize,
        }
    }

    pub(crate) fn invoke(self) {
        (self.func)(self.arg);
    }
}

/// Trampoline for [`Callback::from_fn`]: the bare function pointer rides in
/// the argument word.
fn call_bare(arg: usize) {
    // SAFETY: `arg` was produced from a `fn()` in `Callback::from_fn`.
    let func = unsafe { core::mem::transmute::<usize, fn()>(arg) };
    func();
}

/// Opaque handle to a scheduled timer, used for cancellation.
///
/// Valid from the `schedule` call that returned it until the slot is freed:
/// by cancellation, or by a non-repeatable timer completing its single
/// firing. Use after that point is a programmer error, caught by the epoch
/// check in [`Scheduler::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a dropped handle cannot be canceled"]
pub struct TimerHandle {
    index: usize,
    epoch: u32,
}

/// Diagnostic snapshot of one active timer slot.
#[derive(Debug, Clone, Copy)]
pub struct TimerInfo {
    /// Name given at registration.
    pub debug_name: &'static str,
    /// Firing period in milliseconds.
    pub period_ms: u32,
    /// Whether the timer rearms itself after firing.
    pub repeatable: bool,
    /// Where the callback runs.
    pub context: Context,
    /// Whether an event from this slot is still in flight.
    pub pending: bool,
    /// The tick at which the timer next fires.
    pub next_due_tick: u64,
}

/// One entry in the timer pool.
#[derive(Clone, Copy)]
struct TimerSlot {
    used: bool,
    repeatable: bool,
    canceled: bool,
    pending: bool,
    context: Context,
    period: u32,
    next_due: u64,
    epoch: u32,
    callback: Callback,
    debug_name: &'static str,
}

fn nop(_arg: usize) {}

impl TimerSlot {
    const FREE: Self = Self {
        used: false,
        repeatable: false,
        canceled: false,
        pending: false,
        context: Context::Interrupt,
        period: 0,
        next_due: 0,
        epoch: 0,
        callback: Callback::new(nop, 0),
        debug_name: "",
    };

    /// Returns the slot to the free state and invalidates all outstanding
    /// handles to it.
    fn release(&mut self) {
        self.used = false;
        self.canceled = false;
        self.pending = false;
        self.epoch = self.epoch.wrapping_add(1);
    }
}

/// Pool state guarded by the scheduler's critical section.
///
/// The tick counter lives here rather than in an atomic: ARMv7-M has no
/// 64-bit atomics, and every writer already holds the lock.
struct Pool<const N: usize> {
    initialized: bool,
    ticks: u64,
    sink: Option<&'static dyn EventSink>,
    slots: [TimerSlot; N],
}

/// A fixed-capacity software-timer scheduler.
///
/// Const-constructable so instances can live in `static` items. The
/// firmware uses one process-wide instance behind the module-level
/// functions; tests own as many independent instances as they like.
pub struct Scheduler<const N: usize> {
    pool: IrqLock<Pool<N>>,
}

impl<const N: usize> Scheduler<N> {
    /// Creates an uninitialized scheduler with every slot free.
    pub const fn new() -> Self {
        Self {
            pool: IrqLock::new(Pool {
                initialized: false,
                ticks: 0,
                sink: None,
                slots: [TimerSlot::FREE; N],
            }),
        }
    }

    /// Binds the scheduler to its event sink and marks it ready.
    ///
    /// # Panics
    ///
    /// If the scheduler is already initialized, or if `sink` is not — the
    /// queue must come up before the scheduler.
    pub fn init(&self, sink: &'static dyn EventSink) {
        assert!(
            sink.is_initialized(),
            "event queue must be initialized before the scheduler"
        );
        let mut pool = self.pool.lock();
        assert!(!pool.initialized, "scheduler double init");
        pool.sink = Some(sink);
        pool.initialized = true;
    }

    /// Returns `true` once [`init`](Self::init) has completed.
    pub fn is_initialized(&self) -> bool {
        self.pool.lock().initialized
    }

    /// Milliseconds since init — the firmware's monotonic clock.
    pub fn now_ms(&self) -> u64 {
        self.pool.lock().ticks
    }

    /// Truncating 32-bit accessor of [`now_ms`](Self::now_ms).
    ///
    /// Wraps silently after about 49.7 days of uptime.
    #[allow(clippy::cast_possible_truncation)]
    pub fn now_ms32(&self) -> u32 {
        self.now_ms() as u32
    }

    /// Busy-waits until at least `ms` milliseconds have elapsed.
    ///
    /// The counter only advances from the tick interrupt, so this is valid
    /// solely in mainline code with interrupts enabled; anywhere else it
    /// would spin forever, which is a fatal misuse rather than a hang.
    ///
    /// # Panics
    ///
    /// If called from interrupt context, with interrupts masked, or before
    /// init.
    pub fn wait_ms(&self, ms: u32) {
        assert!(
            !sync::in_interrupt(),
            "wait_ms called from interrupt context"
        );
        assert!(
            sync::interrupts_enabled(),
            "wait_ms called with interrupts masked"
        );
        assert!(self.is_initialized(), "wait_ms before scheduler init");

        let start = self.now_ms();
        while self.now_ms().wrapping_sub(start) < u64::from(ms) {
            core::hint::spin_loop();
        }
    }

    /// Claims a pool slot and arms a timer.
    ///
    /// `period_ms == 0` means "fire once immediately": the callback is
    /// invoked synchronously before this returns — in the caller's
    /// (mainline) context for both timer kinds — and the returned handle is
    /// already stale.
    ///
    /// # Panics
    ///
    /// Before init, for a repeatable timer with `period_ms == 0`, or when
    /// the pool is exhausted.
    pub fn schedule(
        &self,
        context: Context,
        callback: Callback,
        debug_name: &'static str,
        period_ms: u32,
        repeatable: bool,
    ) -> TimerHandle {
        assert!(
            !(repeatable && period_ms == 0),
            "repeatable timer with zero period"
        );

        let mut pool = self.pool.lock();
        assert!(pool.initialized, "schedule before scheduler init");

        // Scan and claim inside the same critical section, so the tick
        // handler never observes a half-populated slot.
        let Some(index) = pool.slots.iter().position(|slot| !slot.used) else {
            panic!("timer pool exhausted ({} slots)", N);
        };

        let now = pool.ticks;
        let slot = &mut pool.slots[index];
        slot.used = true;
        slot.repeatable = repeatable;
        slot.canceled = false;
        slot.pending = false;
        slot.context = context;
        slot.period = period_ms;
        slot.next_due = now + u64::from(period_ms);
        slot.callback = callback;
        slot.debug_name = debug_name;
        let handle = TimerHandle {
            index,
            epoch: slot.epoch,
        };

        if period_ms == 0 {
            slot.pending = true;
            drop(pool);
            callback.invoke();
            self.pool.lock().slots[index].release();
        }

        handle
    }

    /// Cancels a timer.
    ///
    /// A slot with no event in flight is freed immediately. A pending slot
    /// cannot be reused yet — a reference to it is still queued or mid-call
    /// — so it is only marked, and whichever path completes the in-flight
    /// event reaps it.
    ///
    /// # Panics
    ///
    /// If the handle does not name a live timer: out of range, already
    /// freed, or the slot has since been reused (epoch mismatch).
    pub fn cancel(&self, handle: TimerHandle) {
        let mut pool = self.pool.lock();
        assert!(pool.initialized, "cancel before scheduler init");
        let slot = pool
            .slots
            .get_mut(handle.index)
            .expect("timer handle out of range");
        assert!(
            slot.used && slot.epoch == handle.epoch,
            "stale timer handle"
        );
        if slot.pending {
            slot.canceled = true;
        } else {
            slot.release();
        }
    }

    /// Advances the clock one tick and dispatches due timers.
    ///
    /// Runs once per hardware tick, in interrupt context — or called
    /// directly by a test driver standing in for it.
    pub fn tick(&'static self) {
        let mut pool = self.pool.lock();
        pool.ticks += 1;
        let now = pool.ticks;

        for index in 0..N {
            let slot = &mut pool.slots[index];
            if !slot.used || slot.next_due != now {
                continue;
            }

            if slot.pending {
                // The previous event from this slot has not completed. Only
                // a periodic timer can come due again while in flight;
                // postpone by one tick instead of queueing a second event.
                assert!(slot.repeatable, "one-shot timer due while pending");
                slot.next_due += 1;
                continue;
            }

            // A canceled slot is either freed on the spot or pending; it can
            // never still be armed when it comes due.
            debug_assert!(!slot.canceled, "canceled timer still armed");

            match slot.context {
                Context::Interrupt => {
                    let callback = slot.callback;
                    // `pending` marks the in-flight invocation: should the
                    // callback cancel its own handle, cancellation takes the
                    // two-phase path and the reap happens below.
                    slot.pending = true;
                    drop(pool);
                    callback.invoke();
                    pool = self.pool.lock();
                    let slot = &mut pool.slots[index];
                    slot.pending = false;
                    if slot.canceled || !slot.repeatable {
                        slot.release();
                    } else {
                        slot.next_due += u64::from(slot.period);
                    }
                }
                Context::Deferred => {
                    let repeatable = slot.repeatable;
                    let period = slot.period;
                    let event = Event::new(self, index, slot.debug_name);
                    let sink = pool.sink.expect("scheduler has no event sink");
                    let slot = &mut pool.slots[index];
                    if sink.try_push(event) {
                        slot.pending = true;
                        if repeatable {
                            // Rearm from the enqueue, not the drain, so a
                            // slow consumer cannot compress the period.
                            slot.next_due += u64::from(period);
                        }
                    } else {
                        // Queue full: retry on the very next tick.
                        slot.next_due += 1;
                    }
                }
            }
        }
    }

    /// Number of slots currently in use.
    pub fn in_use(&self) -> usize {
        self.pool.lock().slots.iter().filter(|slot| slot.used).count()
    }

    /// Snapshot of every active slot, for diagnostics.
    pub fn active_timers(&self) -> Vec<TimerInfo, N> {
        let pool = self.pool.lock();
        let mut out = Vec::new();
        for slot in pool.slots.iter().filter(|slot| slot.used) {
            // Capacity matches the pool, so the push cannot fail.
            let _ = out.push(TimerInfo {
                debug_name: slot.debug_name,
                period_ms: slot.period,
                repeatable: slot.repeatable,
                context: slot.context,
                pending: slot.pending,
                next_due_tick: slot.next_due,
            });
        }
        out
    }
}

impl<const N: usize> Default for Scheduler<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> EventHandler for Scheduler<N> {
    /// Completes a deferred firing in mainline context.
    ///
    /// If the timer was canceled while its event sat in the queue, the
    /// callback is skipped and the slot is reaped here — cancellation wins
    /// over an already-queued fire.
    fn handle(&self, token: usize) {
        let mut pool = self.pool.lock();
        let slot = &mut pool.slots[token];
        assert!(slot.used, "queued event for a freed timer slot");
        assert!(slot.pending, "queued event for a non-pending timer");

        if slot.canceled {
            slot.release();
            return;
        }

        let callback = slot.callback;
        drop(pool);
        callback.invoke();

        let mut pool = self.pool.lock();
        let slot = &mut pool.slots[token];
        slot.pending = false;
        if slot.canceled || !slot.repeatable {
            slot.release();
        }
    }
}

// ---------------------------------------------------------------------------
// Process-wide scheduler and the firmware-facing API
// ---------------------------------------------------------------------------

/// The firmware's scheduler instance.
static SCHEDULER: Scheduler<TIMER_POOL_SIZE> = Scheduler::new();

/// Tick trampoline bound to the hardware timer interrupt.
fn tick_isr() {
    SCHEDULER.tick();
}

/// Initializes the global scheduler and starts the hardware tick source.
///
/// # Panics
///
/// If the scheduler is already initialized or the event queue is not
/// ([`crate::event::init`] comes first).
pub fn init(source: &mut dyn TickSource) {
    SCHEDULER.init(event::queue());
    source.start_periodic(TICK_HZ, tick_isr);
    pion_core::info!("sched: {} timer slots at {} Hz", TIMER_POOL_SIZE, TICK_HZ);
}

/// Returns `true` once the global scheduler is initialized.
pub fn is_initialized() -> bool {
    SCHEDULER.is_initialized()
}

/// Milliseconds since scheduler init — the firmware's monotonic clock.
pub fn now_ms() -> u64 {
    SCHEDULER.now_ms()
}

/// Truncating 32-bit accessor of [`now_ms`].
pub fn now_ms32() -> u32 {
    SCHEDULER.now_ms32()
}

/// Busy-waits `ms` milliseconds. See [`Scheduler::wait_ms`] for the rules.
pub fn wait_ms(ms: u32) {
    SCHEDULER.wait_ms(ms);
}

/// Schedules a timer whose callback runs in interrupt context.
pub fn schedule_interrupt_timer(
    callback: Callback,
    debug_name: &'static str,
    period_ms: u32,
    repeatable: bool,
) -> TimerHandle {
    SCHEDULER.schedule(Context::Interrupt, callback, debug_name, period_ms, repeatable)
}

/// Schedules a timer whose callback runs in mainline context via the event
/// queue.
pub fn schedule_deferred_timer(
    callback: Callback,
    debug_name: &'static str,
    period_ms: u32,
    repeatable: bool,
) -> TimerHandle {
    SCHEDULER.schedule(Context::Deferred, callback, debug_name, period_ms, repeatable)
}

/// Cancels a timer scheduled on the global scheduler.
pub fn cancel(handle: TimerHandle) {
    SCHEDULER.cancel(handle);
}

/// Diagnostic snapshot of the global pool.
pub fn active_timers() -> Vec<TimerInfo, TIMER_POOL_SIZE> {
    SCHEDULER.active_timers()
}

/// Slots in use on the global scheduler.
pub fn in_use() -> usize {
    SCHEDULER.in_use()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn leaked_sched() -> &'static Scheduler<4> {
        let sched: &'static Scheduler<4> = Box::leak(Box::new(Scheduler::new()));
        let queue: &'static EventQueue<4> = Box::leak(Box::new(EventQueue::new()));
        queue.init();
        sched.init(queue);
        sched
    }

    static FROM_FN_FIRED: AtomicUsize = AtomicUsize::new(0);

    fn bare() {
        FROM_FN_FIRED.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn from_fn_trampoline_invokes() {
        let sched = leaked_sched();
        let before = FROM_FN_FIRED.load(Ordering::Relaxed);
        let _handle = sched.schedule(Context::Interrupt, Callback::from_fn(bare), "bare", 0, false);
        assert_eq!(FROM_FN_FIRED.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    #[should_panic(expected = "repeatable timer with zero period")]
    fn repeatable_zero_period_panics() {
        let sched = leaked_sched();
        let _handle = sched.schedule(Context::Interrupt, Callback::new(nop, 0), "bad", 0, true);
    }

    #[test]
    #[should_panic(expected = "schedule before scheduler init")]
    fn schedule_before_init_panics() {
        let sched: &'static Scheduler<4> = Box::leak(Box::new(Scheduler::new()));
        let _handle = sched.schedule(Context::Interrupt, Callback::new(nop, 0), "early", 5, false);
    }

    #[test]
    #[should_panic(expected = "event queue must be initialized before the scheduler")]
    fn init_requires_ready_queue() {
        let sched: &'static Scheduler<4> = Box::leak(Box::new(Scheduler::new()));
        let queue: &'static EventQueue<4> = Box::leak(Box::new(EventQueue::new()));
        sched.init(queue);
    }

    #[test]
    #[should_panic(expected = "scheduler double init")]
    fn double_init_panics() {
        let sched = leaked_sched();
        let queue: &'static EventQueue<4> = Box::leak(Box::new(EventQueue::new()));
        queue.init();
        sched.init(queue);
    }

    #[test]
    fn clock_accessor_truncates() {
        let sched = leaked_sched();
        sched.pool.lock().ticks = (1 << 32) + 7;
        assert_eq!(sched.now_ms(), (1 << 32) + 7);
        assert_eq!(sched.now_ms32(), 7);
    }

    #[test]
    fn starts_at_tick_zero() {
        let sched = leaked_sched();
        assert_eq!(sched.now_ms(), 0);
        assert!(sched.is_initialized());
        assert_eq!(sched.in_use(), 0);
    }
}
