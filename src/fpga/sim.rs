//! A simulated FPGA, used to exercise the protocol engine in tests.
//!
//! Reads are scripted per register, writes are recorded, and the registers
//! with side effects the engine relies on (the interrupt mask, LEDs and the
//! command channel FIFO) are modelled.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use std::collections::{HashMap, VecDeque};
use std::vec::Vec;

use super::{IrqSource, R_INT_REQUEST, RegisterPort, W_PAGE_ADDR, page0, page1};

const IRQ_KEY: (u8, u8) = (page0::PAGE, R_INT_REQUEST);

pub struct SimPort {
    page: u8,
    writing: bool,
    reset: bool,
    pulses: u32,
    writes: Vec<(u8, u8, u8)>,
    reads: HashMap<(u8, u8), VecDeque<u8>>,
    defaults: HashMap<(u8, u8), u8>,
    ctx_data: u8,
    ctx_fifo: Vec<u8>,
    irq_mask: u8,
    leds: u8,
}

impl SimPort {
    /// A present FPGA, held in reset, in a backplane slot with no master.
    pub fn new() -> Self {
        let mut defaults = HashMap::new();
        defaults.insert((page1::PAGE, page1::R_MAGIC_LSB), 0xAA);
        defaults.insert((page1::PAGE, page1::R_MAGIC_MSB), 0x11);
        defaults.insert((page1::PAGE, page1::R_BOARD_POS), 0x30);
        Self {
            page: 0,
            writing: false,
            reset: true,
            pulses: 0,
            writes: Vec::new(),
            reads: HashMap::new(),
            defaults,
            ctx_data: 0,
            ctx_fifo: Vec::new(),
            irq_mask: 0,
            leds: 0,
        }
    }

    /// Queues a value to be returned by the next read of a register.
    pub fn queue_read(&mut self, page: u8, addr: u8, value: u8) {
        self.reads.entry((page, addr)).or_default().push_back(value);
    }

    /// Queues an interrupt bitmap.  Once the queue is empty the bitmap
    /// reads as 0.
    pub fn queue_irqs(&mut self, bits: u8) {
        self.reads.entry(IRQ_KEY).or_default().push_back(bits);
    }

    /// Sets the value read from a register once its queue is empty.
    pub fn set_default(&mut self, page: u8, addr: u8, value: u8) {
        self.defaults.insert((page, addr), value);
    }

    /// All values written to a register, oldest first.
    pub fn writes_to(&self, page: u8, addr: u8) -> impl Iterator<Item = u8> + '_ {
        self.writes
            .iter()
            .filter(move |(p, a, _)| *p == page && *a == addr)
            .map(|(_, _, d)| *d)
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    /// Octets committed to the command channel FIFO.
    pub fn ctx_fifo(&self) -> &[u8] {
        &self.ctx_fifo
    }

    pub fn take_ctx(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.ctx_fifo)
    }

    pub fn irq_mask(&self) -> u8 {
        self.irq_mask
    }

    pub fn leds(&self) -> u8 {
        self.leds
    }

    pub fn pulses(&self) -> u32 {
        self.pulses
    }
}

impl RegisterPort for SimPort {
    fn begin_write(&mut self) {
        self.writing = true;
    }

    fn begin_read(&mut self) {
        self.writing = false;
    }

    fn write(&mut self, addr: u8, data: u8) {
        assert!(self.writing, "write with bus in read mode");
        if addr == W_PAGE_ADDR {
            self.page = data;
            return;
        }
        self.writes.push((self.page, addr, data));
        match (self.page, addr) {
            (page0::PAGE, page0::W_IRQ_ENABLE) => self.irq_mask |= data,
            (page0::PAGE, page0::W_IRQ_DISABLE) => self.irq_mask &= !data,
            (page0::PAGE, page0::W_LED_SET) => self.leds |= data,
            (page0::PAGE, page0::W_LED_CLEAR) => self.leds &= !data,
            (page1::PAGE, page1::W_SC_CTX_DATA) => self.ctx_data = data,
            (page1::PAGE, page1::W_SC_CTX_INCFIFO) => {
                self.ctx_fifo.push(self.ctx_data);
                self.irq_mask |= IrqSource::CTXE.bits();
            }
            _ => (),
        }
    }

    fn read(&mut self, addr: u8) -> u8 {
        assert!(!self.writing, "read with bus in write mode");
        let key = (self.page, addr);
        if let Some(value) = self.reads.get_mut(&key).and_then(VecDeque::pop_front) {
            return value;
        }
        self.defaults.get(&key).copied().unwrap_or(0)
    }

    fn set_reset(&mut self, asserted: bool) {
        self.reset = asserted;
    }

    fn is_reset(&self) -> bool {
        self.reset
    }

    fn pulse_reset(&mut self) {
        self.pulses += 1;
        self.reset = false;
    }
}
