//! Task spawning support.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use defmt::{debug, error, info, trace, warn};

use crate::infra::watchdog::reboot_normal;

// Threading and tasks model
//
// Everything runs on core 0, spawned from main():
// - the embassy USB stack
// - host rx, which reads bulk OUT packets and acts on them
// - host tx, which writes upstream messages to the bulk IN endpoint
// - the dispatcher, which owns the protocol engine and services the FPGA
//   interrupt line
// - the transmitter, which drains the staging queue into the engine
// - the watchdog
//
// The FPGA bus is driven inside critical sections, so nothing else can
// interleave a register access sequence.

/// Method to spawn tasks.
///
/// Using the Spawner object to spawn can fail, because too many instances of
/// that task are already running.  By default only 1 is allowed at once.
///
/// We handle that by rebooting - but it shouldn't happen as tasks are only
/// spawned at start of day.
///
/// Example:
/// ```ignore
/// spawn_or_reboot(spawner.spawn(my_task()), "my_task");
/// ```
pub fn spawn_or_reboot<T, E: defmt::Format>(spawn_result: Result<T, E>, task_name: &str) {
    match spawn_result {
        Ok(_) => debug!("Spawned task {}", task_name),
        Err(e) => {
            error!("Failed to spawn task: {}, error: {}", task_name, e);
            reboot_normal();
        }
    }
}
