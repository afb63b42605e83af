//! Access to the FPGA which sits between this board and the backplane.
//!
//! The FPGA exposes a paged file of eight 8-bit registers.  Register 0 is
//! special: writing it selects the page, and reading it on page 0 returns
//! the interrupt request bitmap.  The bus is half-duplex, so every access
//! sequence first switches the bus direction.
//!
//! [`RegisterPort`] is the raw bus, implemented by the board specific
//! bit-banging code (see `rp`) or by the simulated FPGA used in tests.
//! [`Fpga`] wraps a port and provides the multi-register sequences the
//! protocol engine needs.  Each sequence runs inside a critical section, as
//! there is no atomic multi-register transaction on the bus.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[cfg(feature = "firmware")]
pub mod rp;
#[cfg(test)]
pub mod sim;

use bitflags::bitflags;

#[allow(unused_imports)]
use crate::util::log::{debug, error, info, trace, warn};

/// Register 0 - written to select the page.
pub const W_PAGE_ADDR: u8 = 0;
/// Register 0 on page 0 - read to get the pending interrupt sources.
pub const R_INT_REQUEST: u8 = 0;

/// Registers on page 0.
pub mod page0 {
    pub const PAGE: u8 = 0;

    pub const R_SC_CTX: u8 = 1;
    pub const R_SC_CRX: u8 = 2;
    pub const R_SC_EIRQ: u8 = 3;
    pub const R_FC_FDFA: u8 = 4;
    pub const R_FC_SENSE: u8 = 5;
    pub const R_FC_STATUS: u8 = 6;
    pub const R_GLB_STATUS: u8 = 7;

    pub const W_IRQ_ENABLE: u8 = 1;
    pub const W_IRQ_DISABLE: u8 = 2;
    pub const W_LED_SET: u8 = 3;
    pub const W_LED_CLEAR: u8 = 4;
    pub const W_FC_CONTROL: u8 = 5;
    pub const W_GLB_CONTROL: u8 = 7;
}

/// Registers on page 1.
pub mod page1 {
    pub const PAGE: u8 = 1;

    pub const R_IRQ_ENABLE: u8 = 1;
    pub const R_MAGIC_LSB: u8 = 4;
    pub const R_MAGIC_MSB: u8 = 5;
    pub const R_BOARD_POS: u8 = 7;

    pub const W_SC_CTX_DATA: u8 = 1;
    pub const W_SC_CTX_INCFIFO: u8 = 2;
}

/// Registers on page 2 (PCM, only acknowledged).
pub mod page2 {
    pub const PAGE: u8 = 2;

    pub const R_PCM_ACK: u8 = 0;
}

bitflags! {
    /// Interrupt sources, as found in the interrupt request bitmap and as
    /// written to the enable/disable registers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IrqSource: u8 {
        /// Command channel FIFO is empty.
        const CTXE = 0x20;
        /// PCM timeslot - not handled beyond acknowledgement.
        const PCM = 0x10;
        /// A board on the backplane has raised its external interrupt.
        const EIRQ = 0x08;
        /// Octet available on the response channel.
        const CRX = 0x04;
        /// Octet available on the command channel (echo, or from the master
        /// when passive).
        const CTX = 0x02;
        /// Board control (FC) bus event.
        const FC = 0x01;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for IrqSource {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "IrqSource({=u8:#x})", self.bits())
    }
}

bitflags! {
    /// Front panel LEDs driven through the FPGA.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Led: u8 {
        const RED = 0x04;
        const YELLOW = 0x02;
        const GREEN = 0x01;
    }
}

bitflags! {
    /// Board control (FC) bus lines.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct FcLine: u8 {
        const SENSE = 0x08;
        const FCE = 0x04;
        const FCD = 0x02;
        const FCC = 0x01;
    }
}

/// Global status/control bit indicating this board is the backplane master.
pub const GLB_MCPU: u8 = 0x01;

/// The raw, paged FPGA bus.
///
/// Addresses are 3 bits.  Implementations don't need to be re-entrant:
/// [`Fpga`] only ever drives the port from within a critical section.
pub trait RegisterPort {
    /// Switch the data bus to output, ready for writes.
    fn begin_write(&mut self);

    /// Switch the data bus to input, ready for reads.
    fn begin_read(&mut self);

    fn write(&mut self, addr: u8, data: u8);

    fn read(&mut self, addr: u8) -> u8;

    /// Assert (`true`) or release (`false`) the FPGA reset line.
    fn set_reset(&mut self, asserted: bool);

    fn is_reset(&self) -> bool;

    /// Assert the reset line briefly, leaving the FPGA running.
    fn pulse_reset(&mut self);
}

/// What the FPGA reports about itself and this board's backplane slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Identity {
    pub magic: u16,
    pub board_pos: u8,
}

/// The register sequences used by the protocol engine.
pub struct Fpga<P: RegisterPort> {
    port: P,
}

impl<P: RegisterPort> Fpga<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    /// Access to the underlying port.  Used by tests to inspect the
    /// simulated FPGA.
    #[allow(dead_code)]
    pub fn port(&self) -> &P {
        &self.port
    }

    #[allow(dead_code)]
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Reads a single register from `page`.
    pub fn read_reg(&mut self, page: u8, addr: u8) -> u8 {
        critical_section::with(|_| {
            self.port.begin_write();
            self.port.write(W_PAGE_ADDR, page);
            self.port.begin_read();
            self.port.read(addr)
        })
    }

    /// Writes a sequence of `(addr, data)` pairs to `page`, leaving the bus
    /// in read mode.
    pub fn write_regs(&mut self, page: u8, writes: &[(u8, u8)]) {
        critical_section::with(|_| {
            self.port.begin_write();
            self.port.write(W_PAGE_ADDR, page);
            for &(addr, data) in writes {
                self.port.write(addr, data);
            }
            self.port.begin_read();
        })
    }

    /// The currently pending interrupt sources.  Bits the FPGA sets which
    /// we don't know about are dropped.
    pub fn pending_irqs(&mut self) -> IrqSource {
        IrqSource::from_bits_truncate(self.read_reg(page0::PAGE, R_INT_REQUEST))
    }

    pub fn irq_enable(&mut self, sources: IrqSource) {
        self.write_regs(page0::PAGE, &[(page0::W_IRQ_ENABLE, sources.bits())]);
    }

    pub fn irq_disable(&mut self, sources: IrqSource) {
        self.write_regs(page0::PAGE, &[(page0::W_IRQ_DISABLE, sources.bits())]);
    }

    pub fn led_set(&mut self, leds: Led) {
        self.write_regs(page0::PAGE, &[(page0::W_LED_SET, leds.bits())]);
    }

    pub fn led_clear(&mut self, leds: Led) {
        self.write_regs(page0::PAGE, &[(page0::W_LED_CLEAR, leds.bits())]);
    }

    /// Sets some LEDs and clears others in a single bus sequence.
    pub fn leds(&mut self, set: Led, clear: Led) {
        self.write_regs(
            page0::PAGE,
            &[
                (page0::W_LED_SET, set.bits()),
                (page0::W_LED_CLEAR, clear.bits()),
            ],
        );
    }

    /// Pushes octets into the command channel FIFO.  Each octet is written
    /// to the data register and then committed, which also re-arms the
    /// CTXE interrupt.
    pub fn push_ctx(&mut self, octets: &[u8]) {
        critical_section::with(|_| {
            self.port.begin_write();
            self.port.write(W_PAGE_ADDR, page1::PAGE);
            for &octet in octets {
                self.port.write(page1::W_SC_CTX_DATA, octet);
                self.port.write(page1::W_SC_CTX_INCFIFO, 0);
            }
            self.port.begin_read();
        })
    }

    pub fn read_ctx(&mut self) -> u8 {
        self.read_reg(page0::PAGE, page0::R_SC_CTX)
    }

    pub fn read_crx(&mut self) -> u8 {
        self.read_reg(page0::PAGE, page0::R_SC_CRX)
    }

    /// Reads the passive side's view of the external interrupt.
    pub fn read_eirq(&mut self) -> bool {
        self.read_reg(page0::PAGE, page0::R_SC_EIRQ) != 0
    }

    /// Reads the last board control command seen on the bus and the sense
    /// line value.
    pub fn read_fc_event(&mut self) -> (u8, u8) {
        critical_section::with(|_| {
            self.port.begin_write();
            self.port.write(W_PAGE_ADDR, page0::PAGE);
            self.port.begin_read();
            let fdfa = self.port.read(page0::R_FC_FDFA);
            let sense = self.port.read(page0::R_FC_SENSE);
            (fdfa, sense)
        })
    }

    /// Acknowledges a PCM interrupt.  PCM data is not consumed.
    pub fn ack_pcm(&mut self) {
        let _ = self.read_reg(page2::PAGE, page2::R_PCM_ACK);
    }

    pub fn identify(&mut self) -> Identity {
        critical_section::with(|_| {
            self.port.begin_write();
            self.port.write(W_PAGE_ADDR, page1::PAGE);
            self.port.begin_read();
            let lsb = self.port.read(page1::R_MAGIC_LSB);
            let msb = self.port.read(page1::R_MAGIC_MSB);
            let board_pos = self.port.read(page1::R_BOARD_POS);
            Identity {
                magic: u16::from_le_bytes([lsb, msb]),
                board_pos,
            }
        })
    }

    /// Whether the FPGA reports this board as the backplane master.
    pub fn is_master(&mut self) -> bool {
        self.read_reg(page0::PAGE, page0::R_GLB_STATUS) & GLB_MCPU != 0
    }

    /// Claims the backplane master role and returns the re-read board
    /// position.
    pub fn claim_master(&mut self) -> u8 {
        critical_section::with(|_| {
            self.port.begin_write();
            self.port.write(W_PAGE_ADDR, page0::PAGE);
            self.port.write(page0::W_GLB_CONTROL, GLB_MCPU);
            self.port.write(W_PAGE_ADDR, page1::PAGE);
            self.port.begin_read();
            self.port.read(page1::R_BOARD_POS)
        })
    }

    /// Clocks an 8 bit command, MSB first, out on the board control bus and
    /// returns the state of the sense line afterwards.
    ///
    /// The command is `(board << 2) | op`.  Ops are 0 = off and reset,
    /// 1 = on, 2 = query powered, 3 = query installed.
    pub fn fc_command(&mut self, cmd: u8) -> bool {
        critical_section::with(|_| {
            self.port.begin_write();
            self.port.write(W_PAGE_ADDR, page0::PAGE);
            self.port.write(page0::W_FC_CONTROL, 0);

            for bit in (0..8).rev() {
                let fcd = if cmd & (1 << bit) != 0 {
                    FcLine::FCD
                } else {
                    FcLine::empty()
                };
                self.port.write(page0::W_FC_CONTROL, fcd.bits());
                self.port.write(page0::W_FC_CONTROL, (fcd | FcLine::FCC).bits());
            }

            self.port.write(page0::W_FC_CONTROL, FcLine::FCE.bits());

            self.port.begin_read();
            let status = self.port.read(page0::R_FC_STATUS);

            self.port.begin_write();
            self.port.write(page0::W_FC_CONTROL, 0);
            self.port.begin_read();

            FcLine::from_bits_truncate(status).contains(FcLine::SENSE)
        })
    }

    pub fn set_reset(&mut self, asserted: bool) {
        self.port.set_reset(asserted);
    }

    pub fn is_reset(&self) -> bool {
        self.port.is_reset()
    }

    pub fn pulse_reset(&mut self) {
        self.port.pulse_reset();
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimPort;
    use super::*;

    #[test]
    fn test_fc_command_clocks_msb_first() {
        let mut fpga = Fpga::new(SimPort::new());
        fpga.port_mut().queue_read(page0::PAGE, page0::R_FC_STATUS, 0x08);

        let sense = fpga.fc_command(0b1000_0001);
        assert!(sense);

        let fc: Vec<u8> = fpga
            .port()
            .writes_to(page0::PAGE, page0::W_FC_CONTROL)
            .collect();
        // Initial clear, 8 pairs of data/clock, FCE, final clear.
        assert_eq!(fc.len(), 1 + 16 + 1 + 1);
        assert_eq!(&fc[1..3], &[0x02, 0x03]);
        assert_eq!(&fc[3..5], &[0x00, 0x01]);
        assert_eq!(&fc[15..17], &[0x02, 0x03]);
        assert_eq!(fc[17], 0x04);
        assert_eq!(fc[18], 0x00);
    }

    #[test]
    fn test_fc_command_no_sense() {
        let mut fpga = Fpga::new(SimPort::new());
        assert!(!fpga.fc_command(0x05));
    }

    #[test]
    fn test_identify() {
        let mut fpga = Fpga::new(SimPort::new());
        fpga.port_mut().set_default(page1::PAGE, page1::R_BOARD_POS, 0x35);
        let id = fpga.identify();
        assert_eq!(id.magic, crate::constants::FPGA_MAGIC);
        assert_eq!(id.board_pos, 0x35);
    }

    #[test]
    fn test_push_ctx() {
        let mut fpga = Fpga::new(SimPort::new());
        fpga.push_ctx(&[0x81, 0x02, 0x33]);
        assert_eq!(fpga.port().ctx_fifo(), &[0x81, 0x02, 0x33]);
    }

    #[test]
    fn test_pending_irqs_drops_unknown_bits() {
        let mut fpga = Fpga::new(SimPort::new());
        fpga.port_mut().queue_irqs(0xC4);
        assert_eq!(fpga.pending_irqs(), IrqSource::CRX);
        assert!(fpga.pending_irqs().is_empty());
    }
}
