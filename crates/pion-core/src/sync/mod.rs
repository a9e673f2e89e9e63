//! Synchronization primitives for single-core firmware.
//!
//! There is exactly one lock: [`IrqLock`], which makes its critical section
//! atomic with respect to interrupt handlers by masking interrupts while
//! held. State shared between an ISR and mainline code must be reached
//! through one of these, and never held across a callback invocation.

mod irq_lock;

pub use irq_lock::{IrqLock, IrqLockGuard, in_interrupt, interrupts_enabled};
