//! Contains a multi-task capable watchdog, that ensures all expected tasks
//! are running, and resets the device if not.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use defmt::{debug, error, info, trace, warn};
use embassy_rp::peripherals::WATCHDOG as p_WATCHDOG;
use static_cell::StaticCell;
use task_watchdog::embassy_rp::{WatchdogRunner, watchdog_run};
use task_watchdog::{Id, WatchdogConfig};

use crate::constants::{WATCHDOG_CHECK_INTERVAL, WATCHDOG_HW_TIMEOUT};

// Create a type alias for the WatchdogRunner to make it easier to use.
pub type WatchdogType = WatchdogRunner<TaskId, NUM_TASK_IDS>;

// We use the WATCHDOG static to store the Watchdog object, so it can be
// shared with the policed tasks.
static WATCHDOG: StaticCell<WatchdogType> = StaticCell::new();

/// The tasks which are policed by the watchdog.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum TaskId {
    /// The dispatcher task, which owns the protocol engine.
    Dispatcher = 0,

    // USB, the host tasks and the transmitter all block indefinitely on
    // endpoints or queues, so can't be policed.
    /// The is the number of tasks which are policed by the watchdog.
    Num,
}
impl Id for TaskId {}
const NUM_TASK_IDS: usize = TaskId::Num as usize;

/// A helper function to create the watchdog.
pub fn create_watchdog(p_watchdog: p_WATCHDOG) -> &'static WatchdogType {
    let config = WatchdogConfig {
        hardware_timeout: WATCHDOG_HW_TIMEOUT,
        check_interval: WATCHDOG_CHECK_INTERVAL,
    };

    let watchdog = WatchdogRunner::new(p_watchdog, config);

    WATCHDOG.init(watchdog)
}

/// A task to run the watchdog.
#[embassy_executor::task]
pub async fn watchdog_task(watchdog: &'static WatchdogType) -> ! {
    watchdog_run(watchdog.create_task()).await
}

/// Reboots the device immediately.
pub fn reboot_normal() -> ! {
    warn!("Rebooting");
    cortex_m::peripheral::SCB::sys_reset()
}
