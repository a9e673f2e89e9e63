//! USART console driver and log sink.
//!
//! Blocking, transmit-only driver for the debug USART, plus the glue that
//! registers it as the firmware's log sink with tick-counter timestamps.
//! Pin multiplexing is board bring-up's responsibility.

use core::fmt::{self, Write as _};

use bitflags::bitflags;
use pion_core::log::{self, Level};
use pion_rt::{config, sched};

use crate::rcc;

/// USART3 register block base address (STM32F4, APB1).
const USART3_BASE: u32 = 0x4000_4800;
/// USART3 APB1ENR enable-bit position.
const USART3_APB1_BIT: u32 = 18;

/// Register offsets from the USART base address.
mod reg {
    /// Status register.
    pub const SR: u32 = 0x00;
    /// Data register.
    pub const DR: u32 = 0x04;
    /// Baud rate register.
    pub const BRR: u32 = 0x08;
    /// Control register 1.
    pub const CR1: u32 = 0x0C;
}

bitflags! {
    /// Status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Sr: u32 {
        /// Transmit data register empty.
        const TXE = 1 << 7;
        /// Transmission complete.
        const TC = 1 << 6;
    }
}

bitflags! {
    /// Control register 1 bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr1: u32 {
        /// USART enable.
        const UE = 1 << 13;
        /// Transmitter enable.
        const TE = 1 << 3;
        /// Receiver enable.
        const RE = 1 << 2;
    }
}

/// The console USART (transmit only).
///
/// Copy: the driver is stateless, a value is just the base address.
#[derive(Clone, Copy)]
pub struct Usart {
    base: u32,
}

/// The USART wired to the debug header.
pub const CONSOLE: Usart = Usart { base: USART3_BASE };

impl Usart {
    fn read(&self, offset: u32) -> u32 {
        // SAFETY: `offset` is one of the `reg` constants, all within the
        // USART register block.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write(&self, offset: u32, value: u32) {
        // SAFETY: As in `read`.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) };
    }

    /// Enables the peripheral at `baud` (8N1, 16x oversampling), transmit
    /// only.
    pub fn init(&self, pclk_hz: u32, baud: u32) {
        rcc::enable_apb1(USART3_APB1_BIT);
        self.write(reg::BRR, pclk_hz / baud);
        self.write(reg::CR1, (Cr1::UE | Cr1::TE).bits());
    }

    /// Writes one byte, blocking until the transmit register frees up.
    pub fn write_byte(&self, byte: u8) {
        while self.read(reg::SR) & Sr::TXE.bits() == 0 {
            core::hint::spin_loop();
        }
        self.write(reg::DR, u32::from(byte));
    }
}

/// `fmt::Write` adapter with `\n` to `\r\n` translation.
struct ConsoleWriter(Usart);

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.0.write_byte(b'\r');
            }
            self.0.write_byte(byte);
        }
        Ok(())
    }
}

/// Formats a leveled, timestamped line to the console.
///
/// The timestamp is the scheduler's millisecond clock; before scheduler
/// init it reads zero, which is fine for boot-time lines.
fn console_log(level: Level, args: fmt::Arguments<'_>) {
    if level > config::MAX_LOG_LEVEL {
        return;
    }
    let ms = sched::now_ms();
    let secs = ms / 1000;
    let millis = ms % 1000;
    let mut writer = ConsoleWriter(CONSOLE);
    let _ = write!(writer, "[{secs:>6}.{millis:03}] {} {args}\n", level.name());
}

/// Brings up the console and registers it as the log sink.
pub fn init_console(pclk_hz: u32, baud: u32) {
    CONSOLE.init(pclk_hz, baud);
    // SAFETY: `console_log` only touches the stateless USART registers and
    // the tick counter; safe from any context once the USART is enabled.
    unsafe { log::set_log_fn(console_log) };
}
