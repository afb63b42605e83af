//! Handles packets received from the host on the bulk OUT endpoint.
//!
//! A host packet is a 4 byte header, `'@' '!' type subtype`, followed by
//! type dependent data.  Packets without the header are looped straight
//! back, except that a packet starting `'?'` asks for an engine status
//! dump.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use crate::util::log::{debug, error, info, trace, warn};

use crate::constants::{HOST_ENQUEUE_TIMEOUT, HOST_HEADER_LEN};
use crate::xpi::dispatcher::{EngineAction, EngineLink};
use crate::xpi::queue::OutboundQueue;
use crate::xpi::telemetry::{MAGIC, MessageType, Packet, TelemetrySink, UpstreamChannel};

/// Host to device message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HostMessageType {
    Null,
    Loop,
    Query,
    LogConfig,
    XsvfStart,
    XsvfData,
    FpgaInit,
    BoardControl,
    StageData,
}

impl TryFrom<u8> for HostMessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Null),
            0x01 => Ok(Self::Loop),
            0x02 => Ok(Self::Query),
            0x03 => Ok(Self::LogConfig),
            0x04 => Ok(Self::XsvfStart),
            0x05 => Ok(Self::XsvfData),
            0x06 => Ok(Self::FpgaInit),
            0x07 => Ok(Self::BoardControl),
            0x08 => Ok(Self::StageData),
            _ => Err(()),
        }
    }
}

/// What a host packet asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request<'a> {
    /// Send the packet back unchanged.
    Loopback(&'a [u8]),
    /// Send the packet back as a loop message.
    Loop(&'a [u8]),
    /// Log the engine status.
    DumpStatus,
    /// Log the system status.
    SystemStatus,
    SetTraceMask(u8),
    /// FPGA configuration, which this firmware doesn't support.
    Xsvf,
    Initialize {
        cold_start: bool,
        force_passive: bool,
    },
    /// A single board control command, `(board << 2) | op`.
    BoardControl(u8),
    PowerCycle(u8),
    /// Stage a frame, preceded by its request id, for the backplane.
    StageData(&'a [u8]),
    /// Nothing to do.
    Ignore,
    Unknown(u8),
}

impl<'a> Request<'a> {
    pub fn parse(packet: &'a [u8]) -> Self {
        if packet.len() < HOST_HEADER_LEN || packet[..2] != MAGIC {
            return match packet.first() {
                Some(b'?') => Request::DumpStatus,
                Some(_) => Request::Loopback(packet),
                None => Request::Ignore,
            };
        }

        let subtype = packet[3];
        let data = &packet[HOST_HEADER_LEN..];
        let flag = |index: usize| data.get(index).is_some_and(|&b| b != 0);

        let Ok(kind) = HostMessageType::try_from(packet[2]) else {
            return Request::Unknown(packet[2]);
        };

        match kind {
            HostMessageType::Null => Request::Ignore,
            HostMessageType::Loop => Request::Loop(packet),
            HostMessageType::Query if subtype == 0x01 => Request::DumpStatus,
            HostMessageType::Query => Request::SystemStatus,
            HostMessageType::LogConfig => {
                Request::SetTraceMask(data.first().copied().unwrap_or(0))
            }
            HostMessageType::XsvfStart | HostMessageType::XsvfData => Request::Xsvf,
            HostMessageType::FpgaInit => Request::Initialize {
                cold_start: flag(0),
                force_passive: flag(1),
            },
            HostMessageType::BoardControl => match data {
                [board, op, ..] => Request::BoardControl(((board & 0x3F) << 2) | (op & 0x03)),
                [board] => Request::PowerCycle(board & 0x3F),
                [] => Request::Ignore,
            },
            HostMessageType::StageData => Request::StageData(data),
        }
    }
}

/// Acts on host packets.
pub struct HostHandler<'a, S: TelemetrySink, const N: usize> {
    link: &'a EngineLink,
    queue: &'a OutboundQueue<S, N>,
    upstream: &'a UpstreamChannel,
}

impl<'a, S: TelemetrySink, const N: usize> HostHandler<'a, S, N> {
    pub const fn new(
        link: &'a EngineLink,
        queue: &'a OutboundQueue<S, N>,
        upstream: &'a UpstreamChannel,
    ) -> Self {
        Self {
            link,
            queue,
            upstream,
        }
    }

    pub async fn handle(&self, packet: &[u8]) {
        let request = Request::parse(packet);
        trace!("Host request, {} bytes", packet.len());

        match request {
            Request::Loopback(packet) => self.send_upstream(packet).await,
            Request::Loop(packet) => {
                let Ok(mut reply) = Packet::from_slice(packet) else {
                    warn!("Loop packet too long: {}", packet.len());
                    return;
                };
                reply[2] = MessageType::Loop as u8;
                reply[3] = 0;
                self.upstream.send(reply).await;
            }
            Request::DumpStatus => self.link.request_action(EngineAction::DumpStatus).await,
            Request::SystemStatus => {
                info!(
                    "Engine ready {}, master {}",
                    self.link.is_ready(),
                    self.link.is_master()
                );
                info!(
                    "Staged {} of {} bytes",
                    self.queue.in_flight_bytes(),
                    self.queue.capacity()
                );
            }
            Request::SetTraceMask(mask) => {
                self.link
                    .request_action(EngineAction::SetTraceMask(mask))
                    .await
            }
            Request::Xsvf => warn!("FPGA configuration not supported"),
            Request::Initialize {
                cold_start,
                force_passive,
            } => {
                self.link
                    .request_action(EngineAction::Initialize {
                        cold_start,
                        force_passive,
                    })
                    .await
            }
            Request::BoardControl(command) => {
                self.link
                    .request_action(EngineAction::BoardControl(command))
                    .await
            }
            Request::PowerCycle(board) => {
                self.link
                    .request_action(EngineAction::PowerCycle(board))
                    .await
            }
            Request::StageData(data) => {
                if !self.queue.enqueue(data, HOST_ENQUEUE_TIMEOUT).await {
                    debug!("Failed to stage {} bytes", data.len());
                }
            }
            Request::Ignore => (),
            Request::Unknown(kind) => warn!("Unknown host message type {=u8:#x}", kind),
        }
    }

    async fn send_upstream(&self, packet: &[u8]) {
        match Packet::from_slice(packet) {
            Ok(packet) => self.upstream.send(packet).await,
            Err(_) => warn!("Loopback packet too long: {}", packet.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::xpi::telemetry::test_sink::RecordingSink;

    fn packet(kind: u8, subtype: u8, data: &[u8]) -> std::vec::Vec<u8> {
        let mut packet = vec![b'@', b'!', kind, subtype];
        packet.extend_from_slice(data);
        packet
    }

    #[test]
    fn test_parse_without_magic() {
        assert_eq!(Request::parse(b"hello"), Request::Loopback(b"hello"));
        assert_eq!(Request::parse(b"?"), Request::DumpStatus);
        assert_eq!(Request::parse(b"@!"), Request::Loopback(b"@!"));
        assert_eq!(Request::parse(&[]), Request::Ignore);
    }

    #[test]
    fn test_parse_types() {
        assert_eq!(Request::parse(&packet(0, 0, &[])), Request::Ignore);
        assert_eq!(Request::parse(&packet(2, 1, &[])), Request::DumpStatus);
        assert_eq!(Request::parse(&packet(2, 0, &[])), Request::SystemStatus);
        assert_eq!(Request::parse(&packet(3, 0, &[])), Request::SetTraceMask(0));
        assert_eq!(Request::parse(&packet(3, 0, &[0x1F])), Request::SetTraceMask(0x1F));
        assert_eq!(Request::parse(&packet(5, 0, &[1, 2])), Request::Xsvf);
        assert_eq!(Request::parse(&packet(9, 0, &[])), Request::Unknown(9));
    }

    #[test]
    fn test_parse_fpga_init() {
        assert_eq!(
            Request::parse(&packet(6, 0, &[])),
            Request::Initialize {
                cold_start: false,
                force_passive: false
            }
        );
        assert_eq!(
            Request::parse(&packet(6, 0, &[1, 1])),
            Request::Initialize {
                cold_start: true,
                force_passive: true
            }
        );
    }

    #[test]
    fn test_parse_board_control() {
        assert_eq!(
            Request::parse(&packet(7, 0, &[0x45, 0x07])),
            Request::BoardControl((0x05 << 2) | 0x03)
        );
        assert_eq!(Request::parse(&packet(7, 0, &[0x41])), Request::PowerCycle(1));
        assert_eq!(Request::parse(&packet(7, 0, &[])), Request::Ignore);
    }

    #[test]
    fn test_loop_reply() {
        let link = EngineLink::new();
        let queue: OutboundQueue<RecordingSink, 64> = OutboundQueue::new(RecordingSink::new());
        let upstream = UpstreamChannel::new();
        let handler = HostHandler::new(&link, &queue, &upstream);

        block_on(handler.handle(&packet(1, 5, &[1, 2, 3])));
        block_on(handler.handle(b"raw"));

        let reply = upstream.try_receive().unwrap();
        assert_eq!(reply.as_slice(), &[b'@', b'!', 1, 0, 1, 2, 3]);
        let reply = upstream.try_receive().unwrap();
        assert_eq!(reply.as_slice(), b"raw");
    }

    #[test]
    fn test_stage_data() {
        let link = EngineLink::new();
        let queue: OutboundQueue<RecordingSink, 64> = OutboundQueue::new(RecordingSink::new());
        let upstream = UpstreamChannel::new();
        let handler = HostHandler::new(&link, &queue, &upstream);

        block_on(handler.handle(&packet(8, 0, &[0x00, 0x01, 0x41, 0x00, 0xBE])));
        assert_eq!(queue.in_flight_bytes(), 7);

        // Too short to hold a request id and a frame.
        block_on(handler.handle(&packet(8, 0, &[0x00, 0x01])));
        assert_eq!(queue.in_flight_bytes(), 7);
    }
}
