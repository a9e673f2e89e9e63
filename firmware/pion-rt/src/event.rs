//! Bounded deferred-event queue.
//!
//! Decouples interrupt-context producers from the cooperative mainline:
//! interrupt handlers enqueue with the non-blocking [`EventSink::try_push`],
//! the mainline loop drains one event at a time with [`process_one`]. The
//! queue never allocates; when it is full, producers are refused and carry
//! their own retry policy.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use heapless::Deque;
use pion_core::sync::IrqLock;

use crate::config::EVENT_QUEUE_DEPTH;

/// Mainline-context handler a queued [`Event`] dispatches back into.
///
/// Producers that live in `static` storage (the scheduler, drivers with
/// deferred work) implement this and enqueue `(handler, token)` pairs; the
/// token tells the handler which of its resources the event refers to.
pub trait EventHandler: Sync {
    /// Called from mainline context when the event is drained.
    fn handle(&self, token: usize);
}

/// One queued unit of deferred work.
#[derive(Clone, Copy)]
pub struct Event {
    handler: &'static dyn EventHandler,
    token: usize,
    debug_name: &'static str,
}

impl Event {
    /// Creates an event that calls `handler.handle(token)` when drained.
    pub fn new(handler: &'static dyn EventHandler, token: usize, debug_name: &'static str) -> Self {
        Self {
            handler,
            token,
            debug_name,
        }
    }

    /// Name used in diagnostics.
    pub fn debug_name(&self) -> &'static str {
        self.debug_name
    }

    fn dispatch(self) {
        self.handler.handle(self.token);
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("token", &self.token)
            .field("debug_name", &self.debug_name)
            .finish_non_exhaustive()
    }
}

/// Producer-side interface to a bounded event queue.
///
/// The seam between the scheduler and the queue; tests substitute their own
/// sink to provoke backpressure.
pub trait EventSink: Sync {
    /// Returns `true` once the queue is ready to accept events.
    fn is_initialized(&self) -> bool;

    /// Attempts to enqueue `event` without blocking.
    ///
    /// Returns `false` iff the queue is full. Safe to call from interrupt
    /// context.
    fn try_push(&self, event: Event) -> bool;
}

/// A fixed-capacity event queue.
pub struct EventQueue<const N: usize> {
    initialized: AtomicBool,
    rejected: AtomicU32,
    ring: IrqLock<Deque<Event, N>>,
}

impl<const N: usize> EventQueue<N> {
    /// Creates an empty, uninitialized queue.
    pub const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            rejected: AtomicU32::new(0),
            ring: IrqLock::new(Deque::new()),
        }
    }

    /// Marks the queue ready to accept events.
    ///
    /// # Panics
    ///
    /// If the queue is already initialized.
    pub fn init(&self) {
        assert!(
            !self.initialized.swap(true, Ordering::AcqRel),
            "event queue double init"
        );
    }

    /// Number of events waiting to be drained.
    pub fn pending(&self) -> usize {
        self.ring.lock().len()
    }

    /// Number of pushes refused because the queue was full.
    pub fn rejected(&self) -> u32 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Pops the oldest event, if any.
    pub fn pop(&self) -> Option<Event> {
        self.ring.lock().pop_front()
    }

    /// Drains one event and dispatches it outside the queue lock.
    ///
    /// Returns `false` when the queue was empty. Mainline only: the
    /// dispatched handler runs in the caller's context.
    pub fn process_one(&self) -> bool {
        let Some(event) = self.pop() else {
            return false;
        };
        event.dispatch();
        true
    }
}

impl<const N: usize> Default for EventQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> EventSink for EventQueue<N> {
    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn try_push(&self, event: Event) -> bool {
        let pushed = self.ring.lock().push_back(event).is_ok();
        if !pushed {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        pushed
    }
}

// ---------------------------------------------------------------------------
// Process-wide queue and the mainline consumer API
// ---------------------------------------------------------------------------

/// The firmware's event queue instance.
static QUEUE: EventQueue<EVENT_QUEUE_DEPTH> = EventQueue::new();

/// Initializes the global event queue.
///
/// Must run before [`crate::sched::init`]; the scheduler refuses to come up
/// without a ready queue.
pub fn init() {
    QUEUE.init();
    pion_core::info!("event: queue ready ({} entries)", EVENT_QUEUE_DEPTH);
}

/// Returns `true` once the global queue has been initialized.
pub fn is_initialized() -> bool {
    QUEUE.is_initialized()
}

/// The global queue, for wiring collaborators at init time.
pub fn queue() -> &'static EventQueue<EVENT_QUEUE_DEPTH> {
    &QUEUE
}

/// Drains and dispatches one queued event. Returns `false` if none waited.
pub fn process_one() -> bool {
    QUEUE.process_one()
}

/// Drains the global queue completely; returns the number dispatched.
pub fn drain() -> usize {
    let mut count = 0;
    while QUEUE.process_one() {
        count += 1;
    }
    count
}

/// Events waiting in the global queue.
pub fn pending() -> usize {
    QUEUE.pending()
}

/// Pushes refused by the global queue since boot.
pub fn rejected() -> u32 {
    QUEUE.rejected()
}
