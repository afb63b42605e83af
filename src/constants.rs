//! This module contains constants used throughout xpibridge: protocol
//! timings, buffer sizes, watchdog and USB configuration.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use embassy_time::Duration;
use static_assertions::const_assert;

//
// Backplane protocol timings.  All protocol timeouts are in milliseconds, as
// the protocol timer counts down in whole milliseconds.
//

/// How long to wait for a polled board to answer on the response channel.
pub const EIRQ_POLL_TIMEOUT_MS: i32 = 4;

/// Enforced gap after sending a poll sentinel frame, before the next
/// transmission.
pub const INTER_SEND_DELAY_MS: i32 = 2;

/// How long to wait for the next octet of a frame (or an acknowledgement).
pub const RECEIVE_TIMEOUT_MS: i32 = 5;

/// How long to wait for the command FIFO to drain.
pub const CTXE_TIMEOUT_MS: i32 = 10;

/// How long a passive board waits to be polled, once it has seen the poll
/// sentinel with its own EIRQ pending.
pub const PASSIVE_POLL_TIMEOUT_MS: i32 = 100;

/// The dispatcher never sleeps longer than this, even if no protocol timer
/// is running, so that staged frames are picked up promptly.
pub const MAX_DISPATCH_WAIT_MS: i32 = 20;

/// Upper bound on bitmap reads in a single dispatch.  If the FPGA keeps
/// interrupts asserted for longer than this, it is assumed stuck and the
/// engine is reset.
pub const MAX_DISPATCH_ITERATIONS: u32 = 10_000;

/// Delay between the steps of a board power cycle.
pub const BOARD_POWER_CYCLE_DELAY: Duration = Duration::from_millis(2);

//
// Backplane protocol sizes.
//

/// Number of addressable boards on the backplane.
pub const MAX_BOARD_COUNT: usize = 64;

/// Maximum length of a backplane frame, header and checksum included.
pub const MAX_FRAME_LEN: usize = 18;

/// Capacity of the outbound staging queue, in bytes.
pub const STAGING_QUEUE_SIZE: usize = 4096;

/// Every staged payload starts with a big-endian request id.
pub const REQUEST_ID_LEN: usize = 2;

/// Largest payload accepted by the staging queue: request id plus a
/// maximal frame.
pub const MAX_STAGED_PAYLOAD: usize = REQUEST_ID_LEN + MAX_FRAME_LEN;

/// Smallest payload accepted: request id plus a control byte.
pub const MIN_STAGED_PAYLOAD: usize = REQUEST_ID_LEN + 1;

/// Each staged item carries a 2 byte length prefix.
pub const STAGED_HEADER_LEN: usize = 2;

/// How many times a frame is sent before the transmitter gives up on it.
pub const MAX_SEND_ATTEMPTS: u8 = 2;

/// How long host supplied frames may wait for space in the staging queue.
pub const HOST_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// The FPGA identifies itself with this value in its magic registers.
pub const FPGA_MAGIC: u16 = 0x11AA;

const_assert!(STAGING_QUEUE_SIZE >= MAX_STAGED_PAYLOAD + STAGED_HEADER_LEN);
const_assert!(MAX_BOARD_COUNT <= 64);

//
// Upstream telemetry.
//

/// Maximum number of data bytes in an upstream message.
pub const MAX_MESSAGE_DATA: usize = 24;

/// Upstream message header length: magic, type, subtype and timestamp.
pub const MESSAGE_HEADER_LEN: usize = 8;

/// Inbound host message header length: magic, type and subtype.
pub const HOST_HEADER_LEN: usize = 4;

const_assert!(MESSAGE_HEADER_LEN + MAX_MESSAGE_DATA <= MAX_EP_PACKET_SIZE_USIZE);

/// Number of encoded upstream messages that may be waiting for the USB IN
/// endpoint.  Messages published while this is full are dropped.
pub const UPSTREAM_CHANNEL_SIZE: usize = 16;

/// Number of engine actions that may be queued for the dispatcher.
pub const ENGINE_ACTION_CHANNEL_SIZE: usize = 4;

//
// Task main runner and related timers.
//

// How often we aim to log from our primary loops to prove they are still
// alive.
pub const LOOP_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// How often the transmitter logs while it is blocked waiting for the
/// engine to complete a frame.
pub const TX_WAIT_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// The green LED is lit for this long, then dark for
/// `HEARTBEAT_OFF_TIME`, while the FPGA is up.
pub const HEARTBEAT_ON_TIME: Duration = Duration::from_millis(900);
pub const HEARTBEAT_OFF_TIME: Duration = Duration::from_millis(100);

//
// Watchdog timers
//

/// The hardware watchdog resets the device if it isn't fed at least this
/// frequently.
pub const WATCHDOG_HW_TIMEOUT: Duration = Duration::from_millis(1500);

/// How often the watchdog task checks that policed tasks have been fed.
pub const WATCHDOG_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// How often the dispatcher task must feed the watchdog to prevent a reset.
pub const DISPATCHER_WATCHDOG_TIMER: Duration = Duration::from_secs(1);

const_assert!(MAX_DISPATCH_WAIT_MS < 1000);

//
// USB device configuration constants.
//

/// USB Descriptor information - what current in mA this device draws.
pub const USB_POWER_MA: u16 = 100;

/// USB Descriptor information - maximum endpoint 0 (control endpoint)
/// packet size.
pub const MAX_PACKET_SIZE_0: u8 = 64;

/// USB Descriptor information - maximum vendor endpoint packet sizes.
pub const MAX_EP_PACKET_SIZE: u16 = 64;
pub const MAX_EP_PACKET_SIZE_USIZE: usize = MAX_EP_PACKET_SIZE as usize;

/// USB Descriptor information - Vendor ID and Product ID
pub const VENDOR_ID: u16 = 0x1209;
pub const PRODUCT_ID: u16 = 0xb1d6;

/// USB Descriptor information - manufacturer string
pub const MANUFACTURER: &str = "piers.rocks";

/// USB Descriptor info - product string
pub const PRODUCT: &str = "xpibridge backplane adapter";

/// USB Descriptor info - serial number string
pub const SERIAL: &str = "000";

/// USB Descriptor info - device class, subclass, and protocol
pub const USB_CLASS: u8 = 0xff;
pub const USB_SUB_CLASS: u8 = 0;
pub const USB_PROTOCOL: u8 = 0;

/// USB Descriptor info - bulk endpoint addresses.  The IN endpoint address
/// includes the direction bit.
pub const OUT_EP: u8 = 0x01;
pub const IN_EP: u8 = 0x82;
