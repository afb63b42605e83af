//! Busy-wait timing used when strobing the FPGA bus.
//!
//! The bus is driven from within critical sections, so these block rather
//! than yield.  embassy-time can't get below the 1us tick on the Pico, hence
//! [`block_ns`] counts clock cycles instead.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::{Duration, Instant};

/// Blocks until a specific instant.
#[inline(always)]
pub fn block_until(expires: Instant) {
    while Instant::now() < expires {}
}

/// Blocks for a specific Duration.
#[inline(always)]
pub fn block_for(duration: Duration) {
    block_until(Instant::now() + duration);
}

/// Blocks for a specific number of nanoseconds.  This won't be precise, as
/// a clock cycle is ~8ns on the Pico and ~6ns on the Pico 2.
///
/// A macro rather than a function so `$ns` can be checked at compile time.
macro_rules! block_ns {
    ($ns:expr) => {{
        #[cfg(feature = "pico")]
        const CLOCK_FREQ_MHZ: u32 = 125;

        #[cfg(all(feature = "pico2", not(feature = "pico")))]
        const CLOCK_FREQ_MHZ: u32 = 150;

        const NS_PER_CYCLE: u32 = 1000 / CLOCK_FREQ_MHZ;

        // Estimated overhead of the delay itself
        #[allow(dead_code)]
        const MIN_PRACTICAL_NS: u32 = 3 * NS_PER_CYCLE;

        static_assertions::const_assert!($ns >= MIN_PRACTICAL_NS);

        let cycles = {
            #[allow(clippy::manual_div_ceil)]
            let result = ($ns + NS_PER_CYCLE - 1) / NS_PER_CYCLE;
            result
        };

        cortex_m::asm::delay(cycles);
    }};
}
pub(crate) use block_ns;

/// Blocks for a specific number of microseconds.
macro_rules! block_us {
    ($us:expr) => {
        crate::util::time::block_for(embassy_time::Duration::from_micros($us))
    };
}
pub(crate) use block_us;
