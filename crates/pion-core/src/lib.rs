//! Core services for Pion firmware crates.
//!
//! Freestanding building blocks shared by the runtime and the drivers:
//! the interrupt-masking critical section ([`sync::IrqLock`]) and the
//! leveled logging machinery ([`log`]).

#![no_std]

// Host builds (tests, tooling) use std to model per-thread interrupt state.
#[cfg(not(target_os = "none"))]
extern crate std;

pub mod log;
pub mod sync;

pub use log::Level;
pub use sync::{IrqLock, IrqLockGuard};
