//! Reset and clock control (RCC).
//!
//! Peripheral clock gates and the clock-tree queries the other drivers
//! need. Assumes board bring-up configured SYSCLK to
//! [`SYSCLK_HZ`](pion_rt::config::SYSCLK_HZ) with the AHB prescaler at /1.

use pion_rt::config::SYSCLK_HZ;

/// RCC register block base address (STM32F4).
const RCC_BASE: u32 = 0x4002_3800;

/// Clock configuration register offset.
const CFGR: u32 = 0x08;
/// APB1 peripheral clock enable register offset.
const APB1ENR: u32 = 0x40;

fn read(offset: u32) -> u32 {
    // SAFETY: `RCC_BASE + offset` is a valid RCC register on every STM32F4.
    unsafe { core::ptr::read_volatile((RCC_BASE + offset) as *const u32) }
}

fn set_bits(offset: u32, bits: u32) {
    let ptr = (RCC_BASE + offset) as *mut u32;
    // SAFETY: As in `read`; read-modify-write of a single RCC register.
    unsafe { core::ptr::write_volatile(ptr, core::ptr::read_volatile(ptr) | bits) };
}

/// Gates on the APB1 clock for the peripheral at the given enable-bit
/// position.
pub(crate) fn enable_apb1(bit: u32) {
    set_bits(APB1ENR, 1 << bit);
    // Dummy read-back: the enable must take effect before the first
    // peripheral register access.
    let _ = read(APB1ENR);
}

/// Returns the clock feeding the APB1 timer kernels.
///
/// PCLK1 is HCLK divided by the APB1 prescaler; the timer kernels run at
/// twice PCLK1 whenever that prescaler is not /1.
pub fn apb1_timer_clock_hz() -> u32 {
    // PPRE1 is CFGR[12:10]: 0xx = /1, 100 = /2, 101 = /4, 110 = /8, 111 = /16.
    let ppre1 = (read(CFGR) >> 10) & 0b111;
    if ppre1 < 0b100 {
        SYSCLK_HZ
    } else {
        let div = 1 << (ppre1 - 0b011);
        (SYSCLK_HZ / div) * 2
    }
}
