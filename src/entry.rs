//! Firmware start of day: brings up the peripherals and spawns the tasks.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use defmt::{debug, error, info, trace, warn};
use embassy_executor::Spawner;

use crate::constants::SERIAL;
use crate::fpga::rp::{FpgaIrq, FpgaPins, RpPort};
use crate::infra::watchdog::{create_watchdog, watchdog_task};
use crate::task::spawn_or_reboot;
use crate::usb::{UsbStack, host_rx_task, host_tx_task, usb_task};
use crate::util::built::log_fw_info;
use crate::xpi::dispatcher::{dispatcher_task, heartbeat_task, transmitter_task};

/// Common entry point for the firmware binary.
///
/// The engine starts disabled.  The host brings it up with an FPGA init
/// message.
pub async fn common_main(spawner: Spawner, bin_name: &'static str) -> ! {
    let p = embassy_rp::init(Default::default());

    log_fw_info(bin_name, SERIAL);

    // Create the watchdog first, so it's running before anything registers
    // with it.
    let watchdog = create_watchdog(p.WATCHDOG);
    spawn_or_reboot(spawner.spawn(watchdog_task(watchdog)), "Watchdog");

    // Start the FPGA side before USB, so the engine link is serviced by the
    // time the host can talk to us.
    let port = RpPort::new(FpgaPins {
        data: [
            p.PIN_0.into(),
            p.PIN_1.into(),
            p.PIN_2.into(),
            p.PIN_3.into(),
            p.PIN_4.into(),
            p.PIN_5.into(),
            p.PIN_6.into(),
            p.PIN_7.into(),
        ],
        addr: [p.PIN_8.into(), p.PIN_9.into(), p.PIN_10.into()],
        rd_n: p.PIN_11.into(),
        wr_n: p.PIN_12.into(),
        reset: p.PIN_13.into(),
    });
    let irq = FpgaIrq::new(p.PIN_14.into());
    spawn_or_reboot(
        spawner.spawn(dispatcher_task(port, irq, watchdog)),
        "Dispatcher",
    );
    spawn_or_reboot(spawner.spawn(transmitter_task()), "Transmitter");
    spawn_or_reboot(spawner.spawn(heartbeat_task()), "Heartbeat");

    let usb = UsbStack::create_static(p.USB, SERIAL).await;
    spawn_or_reboot(spawner.spawn(usb_task(usb)), "USB");
    spawn_or_reboot(spawner.spawn(host_rx_task()), "Host rx");
    spawn_or_reboot(spawner.spawn(host_tx_task()), "Host tx");

    info!("Start of day complete");
    core::future::pending().await
}
