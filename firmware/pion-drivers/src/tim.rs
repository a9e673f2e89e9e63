//! General-purpose timers (TIM2..TIM5) as the scheduler tick source.
//!
//! Configures a periodic update interrupt and dispatches it to the handler
//! registered at [`TickSource::start_periodic`] time. Register layout per
//! RM0090.

use core::sync::atomic::{AtomicPtr, Ordering};

use bitflags::bitflags;
use pion_rt::sched::TickSource;

use crate::{nvic, rcc};

/// Register offsets from a TIM base address.
mod reg {
    /// Control register 1.
    pub const CR1: u32 = 0x00;
    /// DMA/interrupt enable register.
    pub const DIER: u32 = 0x0C;
    /// Status register.
    pub const SR: u32 = 0x10;
    /// Event generation register.
    pub const EGR: u32 = 0x14;
    /// Counter.
    pub const CNT: u32 = 0x24;
    /// Prescaler.
    pub const PSC: u32 = 0x28;
    /// Auto-reload register.
    pub const ARR: u32 = 0x2C;
}

bitflags! {
    /// Control register 1 bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr1: u32 {
        /// Counter enable.
        const CEN = 1 << 0;
        /// Update request source: only overflow generates an update.
        const URS = 1 << 2;
        /// Auto-reload preload enable.
        const ARPE = 1 << 7;
    }
}

bitflags! {
    /// DMA/interrupt enable register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Dier: u32 {
        /// Update interrupt enable.
        const UIE = 1 << 0;
    }
}

bitflags! {
    /// Status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Sr: u32 {
        /// Update interrupt flag (write zero to clear).
        const UIF = 1 << 0;
    }
}

/// The timer instances usable as a tick source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instance {
    /// TIM2 (IRQ 28).
    Tim2,
    /// TIM3 (IRQ 29).
    Tim3,
    /// TIM4 (IRQ 30).
    Tim4,
    /// TIM5 (IRQ 50).
    Tim5,
}

impl Instance {
    const fn base(self) -> u32 {
        match self {
            Self::Tim2 => 0x4000_0000,
            Self::Tim3 => 0x4000_0400,
            Self::Tim4 => 0x4000_0800,
            Self::Tim5 => 0x4000_0C00,
        }
    }

    const fn irq(self) -> u32 {
        match self {
            Self::Tim2 => 28,
            Self::Tim3 => 29,
            Self::Tim4 => 30,
            Self::Tim5 => 50,
        }
    }

    /// APB1ENR enable-bit position.
    const fn apb1_bit(self) -> u32 {
        match self {
            Self::Tim2 => 0,
            Self::Tim3 => 1,
            Self::Tim4 => 2,
            Self::Tim5 => 3,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Tim2 => 0,
            Self::Tim3 => 1,
            Self::Tim4 => 2,
            Self::Tim5 => 3,
        }
    }
}

/// A general-purpose timer peripheral.
pub struct Tim {
    instance: Instance,
}

impl Tim {
    /// Creates a driver for the given instance.
    pub const fn new(instance: Instance) -> Self {
        Self { instance }
    }

    fn read(&self, offset: u32) -> u32 {
        // SAFETY: `offset` is one of the `reg` constants, all within the
        // TIM register block.
        unsafe { core::ptr::read_volatile((self.instance.base() + offset) as *const u32) }
    }

    fn write(&self, offset: u32, value: u32) {
        // SAFETY: As in `read`.
        unsafe { core::ptr::write_volatile((self.instance.base() + offset) as *mut u32, value) };
    }

    /// Acknowledges the update interrupt.
    ///
    /// SR bits are rc_w0: writing zero clears, writing one is a no-op.
    fn clear_update_flag(&self) {
        self.write(reg::SR, !Sr::UIF.bits());
    }

    /// Stops the counter and masks its interrupt.
    pub fn stop(&self) {
        self.write(reg::CR1, self.read(reg::CR1) & !Cr1::CEN.bits());
        self.write(reg::DIER, 0);
    }
}

/// Fixed auto-reload value; the prescaler absorbs the clock ratio.
const RELOAD: u32 = 999;

/// Prescaler for `hz` update events from a `clk` kernel clock with the
/// fixed reload.
fn prescaler_for(clk: u32, hz: u32) -> u32 {
    debug_assert!(
        clk % ((RELOAD + 1) * hz) == 0,
        "tick rate must divide the timer clock"
    );
    clk / (RELOAD + 1) / hz - 1
}

impl TickSource for Tim {
    fn start_periodic(&mut self, hz: u32, handler: fn()) {
        rcc::enable_apb1(self.instance.apb1_bit());

        let prescaler = prescaler_for(rcc::apb1_timer_clock_hz(), hz);
        assert!(
            prescaler <= 0xFFFF,
            "tick rate out of range for the 16-bit prescaler"
        );

        set_tick_handler(self.instance, handler);

        self.write(reg::PSC, prescaler);
        self.write(reg::ARR, RELOAD);
        self.write(reg::CNT, 0);
        // Latch PSC/ARR through an update event, then drop the flag it set
        // so the first interrupt is a real tick.
        self.write(reg::EGR, 1);
        self.clear_update_flag();
        self.write(reg::DIER, Dier::UIE.bits());
        nvic::clear_pending(self.instance.irq());
        nvic::enable_irq(self.instance.irq());
        self.write(reg::CR1, (Cr1::CEN | Cr1::URS | Cr1::ARPE).bits());
    }
}

// ---------------------------------------------------------------------------
// Update-interrupt dispatch
// ---------------------------------------------------------------------------

/// Registered update handlers, one per instance.
static TICK_HANDLERS: [AtomicPtr<()>; 4] = [const { AtomicPtr::new(core::ptr::null_mut()) }; 4];

fn set_tick_handler(instance: Instance, handler: fn()) {
    TICK_HANDLERS[instance.index()].store(handler as *mut (), Ordering::Release);
}

fn dispatch(instance: Instance) {
    let ptr = TICK_HANDLERS[instance.index()].load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: Only valid `fn()` pointers are ever stored in TICK_HANDLERS.
    let handler = unsafe { core::mem::transmute::<*mut (), fn()>(ptr) };
    handler();
}

/// TIM2 update interrupt entry, referenced by the vector table.
#[cfg(all(target_os = "none", target_arch = "arm"))]
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
extern "C" fn TIM2_IRQHandler() {
    Tim::new(Instance::Tim2).clear_update_flag();
    dispatch(Instance::Tim2);
}

/// TIM3 update interrupt entry, referenced by the vector table.
#[cfg(all(target_os = "none", target_arch = "arm"))]
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
extern "C" fn TIM3_IRQHandler() {
    Tim::new(Instance::Tim3).clear_update_flag();
    dispatch(Instance::Tim3);
}

/// TIM4 update interrupt entry, referenced by the vector table.
#[cfg(all(target_os = "none", target_arch = "arm"))]
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
extern "C" fn TIM4_IRQHandler() {
    Tim::new(Instance::Tim4).clear_update_flag();
    dispatch(Instance::Tim4);
}

/// TIM5 update interrupt entry, referenced by the vector table.
#[cfg(all(target_os = "none", target_arch = "arm"))]
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
extern "C" fn TIM5_IRQHandler() {
    Tim::new(Instance::Tim5).clear_update_flag();
    dispatch(Instance::Tim5);
}
