//! Messages sent upstream to the host, and the sink they are published to.
//!
//! On the wire a message is:
//!
//! | Offset | Length | Contents                              |
//! |--------|--------|---------------------------------------|
//! | 0      | 2      | magic, `'@' '!'`                      |
//! | 2      | 1      | [`MessageType`]                       |
//! | 3      | 1      | subtype, meaning depends on the type  |
//! | 4      | 4      | timestamp, ms since boot, little end. |
//! | 8      | 0-24   | data                                  |

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use bitflags::bitflags;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::Instant;
use heapless::Vec;

#[allow(unused_imports)]
use crate::util::log::{debug, error, info, trace, warn};

use crate::constants::{
    MAX_EP_PACKET_SIZE_USIZE, MAX_MESSAGE_DATA, MESSAGE_HEADER_LEN, UPSTREAM_CHANNEL_SIZE,
};

/// Magic bytes at the start of every message, in either direction.
pub const MAGIC: [u8; 2] = [b'@', b'!'];

/// Largest encoded message.
pub const MAX_ENCODED_LEN: usize = MESSAGE_HEADER_LEN + MAX_MESSAGE_DATA;

/// Frame trace subtypes, used with [`MessageType::TraceCtx`] and
/// [`MessageType::TraceCrx`].
pub mod subtype {
    /// A complete frame with a good checksum, or a single octet.
    pub const VALID: u8 = 0;
    /// A complete frame whose checksum didn't match.
    pub const BAD_CHECKSUM: u8 = 1;
    /// Too many octets arrived without completing a frame.
    pub const OVERFLOW: u8 = 2;
    /// An octet arrived in a state which doesn't expect one.  Data is the
    /// octet and the engine state.
    pub const IGNORED: u8 = 3;
    /// A negative acknowledgement.
    pub const NAK: u8 = 4;
}

/// Upstream message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MessageType {
    Null = 0,
    Loop = 1,
    Log = 2,
    /// Engine status: present, master, board position, reserved.
    FpgaStatus = 3,
    XsvfEnd = 4,
    /// Board control bus event: board, op, sense, engine state.
    FcEvent = 5,
    ScData = 6,
    /// A request could not be satisfied.  Subtype is the status code, data
    /// the request id.
    FlowCtrl = 7,
    TraceCtx = 8,
    TraceCrx = 9,
    TraceEirq = 10,
    TraceHssc = 11,
}

bitflags! {
    /// Optional trace categories, set by the host.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct TraceMask: u8 {
        /// External interrupt events, and poll traffic on the command
        /// channel.
        const EIRQ = 0x01;
        /// Acknowledgements in both directions.
        const ACK = 0x02;
        /// With `CTX`, also trace retransmission marked frames.
        const CTX_E0_PKT = 0x04;
        /// Frames echoed on the command channel.
        const CTX = 0x08;
        /// Poll responses on the response channel.
        const CRX = 0x10;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for TraceMask {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "TraceMask({=u8:#x})", self.bits())
    }
}

/// A single upstream message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub subtype: u8,
    pub timestamp: u32,
    pub data: Vec<u8, MAX_MESSAGE_DATA>,
}

impl Message {
    /// Creates a message, truncating `data` if it is too long.
    pub fn new(kind: MessageType, subtype: u8, timestamp: u32, data: &[u8]) -> Self {
        let len = data.len().min(MAX_MESSAGE_DATA);
        let mut message = Self {
            kind,
            subtype,
            timestamp,
            data: Vec::new(),
        };
        // Can't fail, as len is within capacity.
        let _ = message.data.extend_from_slice(&data[..len]);
        message
    }

    /// A flow control notice for `request_id`.
    pub fn flow_control(status: u8, request_id: u16, timestamp: u32) -> Self {
        Self::new(
            MessageType::FlowCtrl,
            status,
            timestamp,
            &request_id.to_be_bytes(),
        )
    }

    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_LEN + self.data.len()
    }

    /// Encodes the message into `out`, returning the number of bytes used,
    /// or `None` if `out` is too small.
    pub fn encode(&self, out: &mut [u8]) -> Option<usize> {
        let len = self.encoded_len();
        let out = out.get_mut(..len)?;
        out[..2].copy_from_slice(&MAGIC);
        out[2] = self.kind as u8;
        out[3] = self.subtype;
        out[4..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8..].copy_from_slice(&self.data);
        Some(len)
    }

    /// The message encoded as a single USB packet.
    pub fn to_packet(&self) -> Packet {
        let mut packet = Packet::new();
        // A message always fits in a packet.
        let _ = packet.resize_default(self.encoded_len());
        let _ = self.encode(&mut packet);
        packet
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Message {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(
            f,
            "Message {{ kind: {}, subtype: {=u8}, timestamp: {=u32}, data: {=[u8]:x} }}",
            self.kind,
            self.subtype,
            self.timestamp,
            self.data.as_slice(),
        )
    }
}

/// Somewhere to publish upstream messages.
///
/// Publishing never blocks.  A sink that can't accept a message drops it.
pub trait TelemetrySink {
    fn publish(&self, message: &Message);
}

impl<T: TelemetrySink + ?Sized> TelemetrySink for &T {
    fn publish(&self, message: &Message) {
        (**self).publish(message)
    }
}

/// A packet bound for the host's IN endpoint.
pub type Packet = Vec<u8, MAX_EP_PACKET_SIZE_USIZE>;

pub type UpstreamChannel = Channel<CriticalSectionRawMutex, Packet, UPSTREAM_CHANNEL_SIZE>;

/// Packets waiting to be written to the host.
pub static UPSTREAM: UpstreamChannel = Channel::new();

/// Publishes messages into an upstream channel.  Messages are dropped if the
/// channel is full.
#[derive(Clone, Copy)]
pub struct ChannelSink<'a> {
    channel: &'a UpstreamChannel,
}

impl<'a> ChannelSink<'a> {
    pub const fn new(channel: &'a UpstreamChannel) -> Self {
        Self { channel }
    }
}

impl TelemetrySink for ChannelSink<'_> {
    fn publish(&self, message: &Message) {
        if self.channel.try_send(message.to_packet()).is_err() {
            debug!("Upstream full, dropped {}", message.kind);
        }
    }
}

/// Milliseconds since boot, as carried in message timestamps.  Wraps after
/// about 49 days.
pub fn now_ms() -> u32 {
    Instant::now().as_millis() as u32
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink() {
        let channel = UpstreamChannel::new();
        let sink = ChannelSink::new(&channel);
        let message = Message::flow_control(0x77, 0x0102, 5);

        for _ in 0..UPSTREAM_CHANNEL_SIZE + 1 {
            sink.publish(&message);
        }

        let packet = channel.try_receive().unwrap();
        assert_eq!(
            packet.as_slice(),
            &[b'@', b'!', 7, 0x77, 5, 0, 0, 0, 0x01, 0x02]
        );
        // The last one didn't fit.
        assert_eq!(channel.len(), UPSTREAM_CHANNEL_SIZE - 1);
    }

    #[test]
    fn test_encode() {
        let message = Message::new(MessageType::FpgaStatus, 0, 0x0403_0201, &[1, 1, 0x33, 0]);
        let mut out = [0u8; MAX_ENCODED_LEN];
        let len = message.encode(&mut out).unwrap();
        assert_eq!(len, 12);
        assert_eq!(
            &out[..len],
            &[b'@', b'!', 3, 0, 0x01, 0x02, 0x03, 0x04, 1, 1, 0x33, 0]
        );
    }

    #[test]
    fn test_encode_too_small() {
        let message = Message::new(MessageType::Log, 0, 0, &[0; 4]);
        let mut out = [0u8; 11];
        assert_eq!(message.encode(&mut out), None);
    }

    #[test]
    fn test_data_truncated() {
        let message = Message::new(MessageType::TraceCrx, 0, 0, &[0xAA; 40]);
        assert_eq!(message.data.len(), MAX_MESSAGE_DATA);
        assert_eq!(message.encoded_len(), MAX_ENCODED_LEN);
    }

    #[test]
    fn test_flow_control() {
        let message = Message::flow_control(0x77, 0x1234, 5);
        assert_eq!(message.kind, MessageType::FlowCtrl);
        assert_eq!(message.subtype, 0x77);
        assert_eq!(message.data.as_slice(), &[0x12, 0x34]);
    }
}
