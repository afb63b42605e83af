//! GPIO bit-banged FPGA bus for the RP2040/RP235x.
//!
//! Pin assignments:
//! - D0-D7 - GPIO 0-7, bidirectional
//! - A0-A2 - GPIO 8-10
//! - RDn - GPIO 11
//! - WRn - GPIO 12
//! - RESET - GPIO 13, active high
//! - INTn - GPIO 14, input, active low

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use crate::util::log::{debug, error, info, trace, warn};
use embassy_rp::gpio::{AnyPin, Flex, Input, Level, Output, Pull};

use super::RegisterPort;
use crate::util::time::{block_ns, block_us};
use crate::xpi::dispatcher::IrqLine;

/// The pins making up the FPGA bus.
pub struct FpgaPins {
    pub data: [AnyPin; 8],
    pub addr: [AnyPin; 3],
    pub rd_n: AnyPin,
    pub wr_n: AnyPin,
    pub reset: AnyPin,
}

/// The bus itself.
pub struct RpPort {
    data: [Flex<'static>; 8],
    addr: [Output<'static>; 3],
    rd_n: Output<'static>,
    wr_n: Output<'static>,
    reset: Output<'static>,
}

impl RpPort {
    /// Sets up the bus in read mode, with both strobes released and the
    /// FPGA held in reset.
    pub fn new(pins: FpgaPins) -> Self {
        let data = pins.data.map(|pin| {
            let mut pin = Flex::new(pin);
            pin.set_pull(Pull::None);
            pin.set_as_input();
            pin
        });

        Self {
            data,
            addr: pins.addr.map(|pin| Output::new(pin, Level::Low)),
            rd_n: Output::new(pins.rd_n, Level::High),
            wr_n: Output::new(pins.wr_n, Level::High),
            reset: Output::new(pins.reset, Level::High),
        }
    }

    #[inline(always)]
    fn set_addr(&mut self, addr: u8) {
        for (bit, pin) in self.addr.iter_mut().enumerate() {
            pin.set_level(Level::from(addr & (1 << bit) != 0));
        }
    }
}

impl RegisterPort for RpPort {
    fn begin_write(&mut self) {
        for pin in self.data.iter_mut() {
            pin.set_as_output();
        }
    }

    fn begin_read(&mut self) {
        for pin in self.data.iter_mut() {
            pin.set_as_input();
        }
    }

    fn write(&mut self, addr: u8, data: u8) {
        self.set_addr(addr);
        for (bit, pin) in self.data.iter_mut().enumerate() {
            pin.set_level(Level::from(data & (1 << bit) != 0));
        }
        self.wr_n.set_low();
        block_ns!(40);
        self.wr_n.set_high();
    }

    fn read(&mut self, addr: u8) -> u8 {
        self.set_addr(addr);
        self.rd_n.set_low();
        block_ns!(40);
        let data = self
            .data
            .iter()
            .enumerate()
            .fold(0, |acc, (bit, pin)| acc | ((pin.is_high() as u8) << bit));
        self.rd_n.set_high();
        data
    }

    fn set_reset(&mut self, asserted: bool) {
        self.reset.set_level(Level::from(asserted));
    }

    fn is_reset(&self) -> bool {
        self.reset.is_set_high()
    }

    fn pulse_reset(&mut self) {
        self.reset.set_high();
        block_us!(1);
        self.reset.set_low();
    }
}

/// The FPGA's interrupt request line.
pub struct FpgaIrq {
    pin: Input<'static>,
}

impl FpgaIrq {
    pub fn new(pin: AnyPin) -> Self {
        Self {
            pin: Input::new(pin, Pull::Up),
        }
    }
}

impl IrqLine for FpgaIrq {
    async fn wait_for_irq(&mut self) {
        self.pin.wait_for_low().await;
    }
}
