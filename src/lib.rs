//! xpibridge
//!
//! Firmware for a USB to backplane bridge board.  The board reaches the
//! backplane through an FPGA, which carries a byte-oriented command/response
//! bus to up to 64 device boards, plus a serial board control bus used to
//! power boards on and off.
//!
//! The protocol core ([`xpi`], [`fpga`] and [`host`]) has no hardware
//! dependencies and is unit tested on the host.  The `firmware` feature adds
//! the RP2040/RP235x bindings, USB stack and task wiring.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#![cfg_attr(not(test), no_std)]

// Provide some feature guidance when compiling the firmware.
#[cfg(all(feature = "firmware", not(any(feature = "pico", feature = "pico2"))))]
compile_error!("Either 'pico' or 'pico2' feature must be enabled");
#[cfg(all(feature = "pico", feature = "pico2"))]
compile_error!("Features 'pico' and 'pico2' cannot be enabled simultaneously");

// Declare all of this library's modules.
pub mod constants;
pub mod fpga;
pub mod host;
pub mod xpi;
mod util;

#[cfg(feature = "firmware")]
pub mod entry;
#[cfg(feature = "firmware")]
mod infra;
#[cfg(feature = "firmware")]
mod task;
#[cfg(feature = "firmware")]
mod usb;

#[cfg(feature = "firmware")]
pub use entry::common_main;

// Extra binary information that picotool can read.
#[cfg(feature = "firmware")]
#[unsafe(link_section = ".bi_entries")]
#[used]
pub static PICOTOOL_ENTRIES: [embassy_rp::binary_info::EntryAddr; 4] = [
    embassy_rp::binary_info::rp_program_name!(c"xpibridge by piers.rocks"),
    embassy_rp::binary_info::rp_program_description!(
        c"A USB bridge to an FPGA-mediated backplane command/response bus."
    ),
    embassy_rp::binary_info::rp_cargo_version!(),
    embassy_rp::binary_info::rp_program_build_attribute!(),
];

// A note about Statics
//
// We set up statics primarily to avoid lifetime issues, and to allow us to
// spawn tasks (accessing these statics), and to split our code into
// separate modules.
//
// - Use StaticCell for statics that cannot be initialized at compile time.
//
// - Use ConstStaticCell for statics that can be initialized at compile time.
//
// - If you need mutable access, you need a Mutex.  An async
//   embassy_sync::mutex::Mutex doesn't need a RefCell for interior
//   mutability.  A blocking_mutex::Mutex does.  Generally use
//   CriticalSectionRawMutex, as it works on multi-core systems.
//
// The protocol core avoids Mutexes where it can.  The engine is owned by the
// dispatcher task, and other tasks talk to it through the signals and
// channel in `EngineLink`.
