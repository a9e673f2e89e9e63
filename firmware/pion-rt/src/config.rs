//! Compile-time firmware configuration.
//!
//! Single source of truth for the sizing and clock constants the runtime
//! and the drivers share.

/// Number of slots in the software-timer pool.
///
/// Registration of a concurrent timer beyond this count is fatal; there is
/// no dynamic growth.
pub const TIMER_POOL_SIZE: usize = 32;

/// Capacity of the deferred event queue.
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Software-timer tick rate in Hz (one tick per millisecond).
pub const TICK_HZ: u32 = 1_000;

/// System core clock in Hz (168 MHz STM32F4 configuration).
pub const SYSCLK_HZ: u32 = 168_000_000;

/// Maximum level the console log sink accepts.
pub const MAX_LOG_LEVEL: pion_core::Level = pion_core::Level::Info;
