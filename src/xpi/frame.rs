//! Backplane frame classification and checksumming.
//!
//! A frame starts with a control byte whose top two bits give its class.
//! Multi-byte frames carry their payload length in the low nibble of the
//! second byte, and end with a checksum byte: starting from 0xFF, each byte
//! is XORed in and the result rotated left by one.  A frame is valid if the
//! running value ends at 0.
//!
//! Frames arriving one octet at a time are collected in a [`Reassembly`]
//! owned by the caller.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use crate::constants::MAX_FRAME_LEN;

/// Starting value of the running checksum.
pub const CHECKSUM_SEED: u8 = 0xFF;

/// The EIRQ poll sentinel, sent by the master to ask which board raised
/// the external interrupt.
pub const POLL_SENTINEL: u8 = 0xC0;

/// Header (control and length bytes) plus checksum.
const FRAME_OVERHEAD: usize = 3;

const CLASS_MASK: u8 = 0xC0;
const ID_MASK: u8 = 0x3F;
const RETRANSMIT_BIT: u8 = 0x20;

/// The class of a frame, from the top two bits of its control byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlClass {
    /// `00` - NAK, or a poll response.  Low 6 bits are the board id.
    Response,
    /// `01` - acknowledgement, or a multi-byte frame header.
    Ack,
    /// `10` - a frame which must be acknowledged.
    NeedsAck,
    /// `11` - the poll sentinel, or a frame marked as a retransmission.
    Sentinel,
}

impl From<u8> for ControlClass {
    fn from(control: u8) -> Self {
        match control & CLASS_MASK {
            0x00 => ControlClass::Response,
            0x40 => ControlClass::Ack,
            0x80 => ControlClass::NeedsAck,
            _ => ControlClass::Sentinel,
        }
    }
}

/// The board id carried in the low 6 bits of a control byte.
pub fn board_id(control: u8) -> u8 {
    control & ID_MASK
}

/// The acknowledgement octet which answers a frame starting with `control`.
pub fn ack_id(control: u8) -> u8 {
    0x40 | board_id(control)
}

/// One step of the running checksum.
#[inline]
pub fn checksum_step(running: u8, octet: u8) -> u8 {
    (running ^ octet).rotate_left(1)
}

/// Runs the checksum over `octets` from the seed.  For a complete frame
/// this is 0 if the frame is valid.  For a frame body, it is the checksum
/// byte which must be appended to make the frame valid.
pub fn checksum(octets: &[u8]) -> u8 {
    octets.iter().fold(CHECKSUM_SEED, |c, &b| checksum_step(c, b))
}

/// Total length of a multi-byte frame, given its second (length) byte.
pub fn declared_len(len_byte: u8) -> usize {
    FRAME_OVERHEAD + usize::from(len_byte & 0x0F)
}

/// Marks a sent sentinel class frame as a retransmission of itself.
///
/// Sets bit 5 of the control byte.  The checksum is kept valid by flipping
/// the single checksum bit that the control byte's bit 5 lands on after
/// `len - 1` rotations, i.e. bit `(5 + len - 1) % 8`.
///
/// Returns `false`, leaving the frame untouched, if it is not an unmarked
/// sentinel class frame.
pub fn mark_retransmission(frame: &mut [u8]) -> bool {
    let len = frame.len();
    if len == 0 || frame[0] & (CLASS_MASK | RETRANSMIT_BIT) != POLL_SENTINEL {
        return false;
    }
    frame[0] |= RETRANSMIT_BIT;
    frame[len - 1] ^= 1 << ((5 + len - 1) & 0x07);
    true
}

/// A frame being collected one octet at a time.
#[derive(Clone)]
pub struct Reassembly {
    len: usize,
    cksum: u8,
    timestamp: u32,
    // One spare byte, so the octet which overflows a frame is kept for
    // reporting.
    data: [u8; MAX_FRAME_LEN + 1],
}

impl Default for Reassembly {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembly {
    pub const fn new() -> Self {
        Self {
            len: 0,
            cksum: CHECKSUM_SEED,
            timestamp: 0,
            data: [0; MAX_FRAME_LEN + 1],
        }
    }

    /// Discards anything collected.
    pub fn clear(&mut self) {
        self.len = 0;
        self.cksum = CHECKSUM_SEED;
    }

    /// Discards anything collected and starts a new frame, stamped with
    /// `timestamp`.
    pub fn begin(&mut self, timestamp: u32) {
        self.clear();
        self.timestamp = timestamp;
    }

    /// Appends an octet and folds it into the running checksum.  Once the
    /// buffer is full further octets are only counted, so
    /// [`Reassembly::is_overflow`] still reports them.
    pub fn append_and_checksum(&mut self, octet: u8) {
        if self.len < self.data.len() {
            self.data[self.len] = octet;
        }
        self.len += 1;
        self.cksum = checksum_step(self.cksum, octet);
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// The collected octets.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len.min(self.data.len())]
    }

    /// The control byte, once one has arrived.
    pub fn control(&self) -> Option<u8> {
        (self.len > 0).then_some(self.data[0])
    }

    pub fn checksum(&self) -> u8 {
        self.cksum
    }

    /// Whether the checksum over everything collected is 0.
    pub fn is_valid(&self) -> bool {
        self.cksum == 0
    }

    /// A multi-byte frame has reached its declared length.
    pub fn is_complete(&self) -> bool {
        self.len >= 2 && self.len == declared_len(self.data[1])
    }

    pub fn is_poll_sentinel(&self) -> bool {
        self.control() == Some(POLL_SENTINEL)
    }

    pub fn is_nak_or_poll_response(&self) -> bool {
        self.control().map(ControlClass::from) == Some(ControlClass::Response)
    }

    pub fn is_ack(&self) -> bool {
        self.control().map(ControlClass::from) == Some(ControlClass::Ack)
    }

    /// More octets have arrived than any frame can hold.
    pub fn is_overflow(&self) -> bool {
        self.len > MAX_FRAME_LEN
    }
}
