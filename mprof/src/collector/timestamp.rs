//! Tick source shared by trampolines and the calibration code.
//!
//! Trampolines read the time stamp counter inline; everything else on the
//! Rust side must use [`read`] so both agree on the unit.

#![allow(unsafe_code)] // rdtsc intrinsic

use std::time::{Duration, Instant};

/// Current tick count.
#[cfg(target_arch = "x86_64")]
#[must_use]
#[inline]
pub fn read() -> u64 {
    // SAFETY: rdtsc is available on every x86-64 CPU
    #[allow(unused_unsafe)]
    let ticks = unsafe { std::arch::x86_64::_rdtsc() };
    ticks
}

/// Current tick count (nanoseconds since first use on this target).
#[cfg(not(target_arch = "x86_64"))]
#[must_use]
pub fn read() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();

    u64::try_from(EPOCH.get_or_init(Instant::now).elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Estimate tick frequency by sampling [`read`] across `window`.
#[must_use]
pub fn ticks_per_second(window: Duration) -> u64 {
    let started = Instant::now();
    let start = read();
    std::thread::sleep(window);
    let ticks = read().saturating_sub(start);
    let elapsed = started.elapsed().as_secs_f64();

    if elapsed > 0.0 {
        (ticks as f64 / elapsed) as u64
    } else {
        0
    }
}
