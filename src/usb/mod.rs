//! Handles creation of the embassy USB stack.
//!
//! The device presents a single vendor class interface with one bulk
//! endpoint in each direction.  Host messages arrive on the OUT endpoint
//! and upstream messages leave on the IN endpoint, see [`bulk`].

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub(crate) mod bulk;

pub use bulk::{host_rx_task, host_tx_task};

#[allow(unused_imports)]
use defmt::{debug, error, info, trace, warn};
use embassy_rp::bind_interrupts;
use embassy_rp::peripherals::USB;
use embassy_rp::usb::{Driver as RpUsbDriver, Endpoint, In, InterruptHandler, Out};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_usb::descriptor::{SynchronizationType, UsageType};
use embassy_usb::driver::{Driver, Endpoint as DriverEndpoint, EndpointType};
use embassy_usb::{Builder, Config, UsbDevice};
use static_cell::{ConstStaticCell, StaticCell};

use crate::constants::{
    IN_EP, MANUFACTURER, MAX_EP_PACKET_SIZE, MAX_PACKET_SIZE_0, OUT_EP, PRODUCT, PRODUCT_ID,
    USB_CLASS, USB_POWER_MA, USB_PROTOCOL, USB_SUB_CLASS, VENDOR_ID,
};

// USBCTRL_IRQ drives the embassy-rp USB driver.
bind_interrupts!(struct Irqs {
    USBCTRL_IRQ => InterruptHandler<USB>;
});

// usb_task() needs the device for 'static.  It is only ever touched by that
// task, so a StaticCell suffices.
static USB_DEVICE: StaticCell<UsbDevice<'static, RpUsbDriver<'static, USB>>> = StaticCell::new();

// Bulk OUT carries host messages to host_rx_task(), bulk IN carries
// upstream messages from host_tx_task().  Each task takes its endpoint once
// at start of day.
pub static READ_EP: Mutex<CriticalSectionRawMutex, Option<Endpoint<'static, USB, Out>>> =
    Mutex::new(None);
pub static WRITE_EP: Mutex<CriticalSectionRawMutex, Option<Endpoint<'static, USB, In>>> =
    Mutex::new(None);

// Descriptor and control buffers handed to the builder.  The vendor
// interface has no class requests, so these never see much use.
static CONFIG_DESC: ConstStaticCell<[u8; 256]> = ConstStaticCell::new([0; 256]);
static BOS_DESC: ConstStaticCell<[u8; 256]> = ConstStaticCell::new([0; 256]);
static MSOS_DESC: ConstStaticCell<[u8; 256]> = ConstStaticCell::new([0; 256]);
static CONTROL_BUF: ConstStaticCell<[u8; 256]> = ConstStaticCell::new([0; 256]);

/// The bridge's USB device: one vendor interface, two bulk endpoints.
pub struct UsbStack {}

impl UsbStack {
    /// Builds the device and stores the bulk endpoints in [`READ_EP`] and
    /// [`WRITE_EP`] for the host tasks.
    pub async fn create_static(
        p_usb: USB,
        serial: &'static str,
    ) -> &'static mut UsbDevice<'static, RpUsbDriver<'static, USB>> {
        let mut driver = RpUsbDriver::new(p_usb, Irqs);

        let mut config = Config::new(VENDOR_ID, PRODUCT_ID);
        config.manufacturer = Some(MANUFACTURER);
        config.product = Some(PRODUCT);
        config.serial_number = Some(serial);
        config.max_power = USB_POWER_MA;
        config.max_packet_size_0 = MAX_PACKET_SIZE_0;

        config.device_class = USB_CLASS;
        config.device_sub_class = USB_SUB_CLASS;
        config.device_protocol = USB_PROTOCOL;

        // A single vendor interface, not a composite device.
        config.composite_with_iads = false;

        // The host driver opens OUT 0x01 and IN 0x82 by address, so claim
        // those before the builder takes the driver.
        let (ep_in, ep_out) = Self::allocate_endpoints(&mut driver);

        let mut builder = Builder::new(
            driver,
            config,
            CONFIG_DESC.take(),
            BOS_DESC.take(),
            MSOS_DESC.take(),
            CONTROL_BUF.take(),
        );

        // Vendor interface carrying both bulk endpoints.
        let mut func = builder.function(USB_CLASS, USB_SUB_CLASS, USB_PROTOCOL);
        let mut interface = func.interface();
        let mut alt = interface.alt_setting(USB_CLASS, USB_SUB_CLASS, USB_PROTOCOL, None);

        alt.endpoint_descriptor(
            &ep_in.info().clone(),
            SynchronizationType::NoSynchronization,
            UsageType::DataEndpoint,
            &[],
        );
        alt.endpoint_descriptor(
            &ep_out.info().clone(),
            SynchronizationType::NoSynchronization,
            UsageType::DataEndpoint,
            &[],
        );

        drop(func);

        let usb = builder.build();
        let usb = USB_DEVICE.init(usb);

        READ_EP.lock().await.replace(ep_out);
        WRITE_EP.lock().await.replace(ep_in);

        usb
    }

    // The RP driver hands out endpoint numbers in order, so allocate until
    // OUT_EP and IN_EP come up.  Endpoints allocated on the way are unused.
    fn allocate_endpoints(
        driver: &mut RpUsbDriver<'static, USB>,
    ) -> (Endpoint<'static, USB, In>, Endpoint<'static, USB, Out>) {
        // Upstream messages
        let ep_in: Endpoint<'static, USB, In> = loop {
            let ep = match driver.alloc_endpoint_in(EndpointType::Bulk, MAX_EP_PACKET_SIZE, 0) {
                Ok(ep) => ep,
                Err(_) => defmt::panic!("Unable to allocate {} as IN endpoint", IN_EP),
            };
            if ep.info().addr == IN_EP.into() {
                break ep;
            }
        };

        // Host messages
        let ep_out: Endpoint<'static, USB, Out> = loop {
            let ep = match driver.alloc_endpoint_out(EndpointType::Bulk, MAX_EP_PACKET_SIZE, 0) {
                Ok(ep) => ep,
                Err(_) => defmt::panic!("Unable to allocate {} as OUT endpoint", OUT_EP),
            };
            if ep.info().addr == OUT_EP.into() {
                break ep;
            }
        };

        (ep_in, ep_out)
    }
}

// Services the USB device.  Host rx and tx run as separate tasks.
#[embassy_executor::task]
pub async fn usb_task(usb: &'static mut UsbDevice<'static, RpUsbDriver<'static, USB>>) -> ! {
    info!("USB task started");

    loop {
        usb.run_until_suspend().await;
        debug!("USB suspended");
        usb.wait_resume().await;
        debug!("USB resumed");
    }
}
