//! Firmware panic policy.
//!
//! Every misuse of the runtime — double init, pool exhaustion, stale
//! handles, busy-waiting with interrupts masked — is a programmer error
//! surfaced as a panic, never an error code. On the target the policy is:
//! report through the log sink, mask interrupts, park the core. Host builds
//! (tests) use the platform runtime instead.

/// Panic handler for the firmware image.
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    pion_core::error!("firmware panic: {info}");

    #[cfg(target_arch = "arm")]
    // SAFETY: Masking interrupts on the way down is always legal; nothing
    // may run after a panic.
    unsafe {
        core::arch::asm!("cpsid i", options(nomem, nostack, preserves_flags));
    }

    loop {
        core::hint::spin_loop();
    }
}
