//! Bulk transfers to and from the host.
//!
//! Host rx reads packets from the OUT endpoint and hands each to a
//! [`HostHandler`].  Host tx drains the upstream channel into the IN
//! endpoint.  Neither task is policed by the watchdog, as both block
//! indefinitely on the endpoints.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use defmt::{debug, error, info, trace, warn};
use embassy_usb::driver::{Endpoint as DriverEndpoint, EndpointError, EndpointIn, EndpointOut};

use super::{READ_EP, WRITE_EP};
use crate::constants::MAX_EP_PACKET_SIZE_USIZE;
use crate::host::HostHandler;
use crate::infra::watchdog::reboot_normal;
use crate::xpi::dispatcher::{ENGINE_LINK, OUTBOUND};
use crate::xpi::telemetry::UPSTREAM;

#[embassy_executor::task]
pub async fn host_rx_task() -> ! {
    info!("Host rx task started");

    let Some(mut read_ep) = READ_EP.lock().await.take() else {
        error!("OUT endpoint not available");
        reboot_normal();
    };
    let handler = HostHandler::new(&ENGINE_LINK, &OUTBOUND, &UPSTREAM);

    loop {
        debug!("Waiting for OUT endpoint to be enabled");
        read_ep.wait_enabled().await;
        debug!("OUT endpoint enabled");

        loop {
            let mut data = [0; MAX_EP_PACKET_SIZE_USIZE];

            // Blocking here applies back-pressure to the host when the
            // staging queue or upstream channel is full.
            match read_ep.read(&mut data).await {
                Ok(size) => handler.handle(&data[..size]).await,
                Err(EndpointError::Disabled) => {
                    debug!("OUT endpoint disabled");
                    break;
                }
                Err(e) => warn!("Error reading from OUT endpoint: {}", e),
            }
        }
    }
}

#[embassy_executor::task]
pub async fn host_tx_task() -> ! {
    info!("Host tx task started");

    let Some(mut write_ep) = WRITE_EP.lock().await.take() else {
        error!("IN endpoint not available");
        reboot_normal();
    };

    loop {
        debug!("Waiting for IN endpoint to be enabled");
        write_ep.wait_enabled().await;
        debug!("IN endpoint enabled");

        loop {
            let packet = UPSTREAM.receive().await;
            match write_ep.write(&packet).await {
                Ok(()) => trace!("Sent {} bytes upstream", packet.len()),
                Err(EndpointError::Disabled) => {
                    debug!("IN endpoint disabled, dropped {} bytes", packet.len());
                    break;
                }
                Err(e) => warn!("Error writing to IN endpoint: {}", e),
            }
        }
    }
}
