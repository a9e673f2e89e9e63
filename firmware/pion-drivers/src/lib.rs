//! Register-level STM32F4 peripheral drivers for Pion firmware.
//!
//! No HAL dependency: each peripheral is a thin struct over its MMIO base
//! address, with register bits spelled out via `bitflags`. Only the pieces
//! the runtime needs are implemented — a general-purpose timer as the
//! scheduler tick source and a USART as the log console.

#![cfg_attr(not(test), no_std)]

pub mod nvic;
pub mod rcc;
pub mod tim;
pub mod usart;
