//! The backplane protocol engine.
//!
//! A single state machine which transmits frames to the boards on the
//! backplane, collects their acknowledgements and responses, polls them
//! when one raises the external interrupt, and snoops the command channel
//! for tracing.  When another board is the bus master it instead reassembles
//! whatever the master and the polled boards say.
//!
//! The engine is a plain value owned by the dispatcher task.  Its handlers
//! are called from the dispatcher as the FPGA reports interrupt sources, and
//! [`Engine::on_timer`] is called on every dispatcher wake so state
//! timeouts fire.  Nothing here blocks.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use heapless::Vec;

#[allow(unused_imports)]
use crate::util::log::{debug, error, info, trace, warn};

use super::XpiError;
use super::frame::{ControlClass, POLL_SENTINEL, Reassembly, ack_id, board_id};
use super::poll_list::{PollList, PollStep};
use super::telemetry::{Message, MessageType, TelemetrySink, TraceMask, subtype};
use crate::constants::{
    CTXE_TIMEOUT_MS, EIRQ_POLL_TIMEOUT_MS, FPGA_MAGIC, INTER_SEND_DELAY_MS, MAX_BOARD_COUNT,
    MAX_DISPATCH_WAIT_MS, MAX_FRAME_LEN, PASSIVE_POLL_TIMEOUT_MS, RECEIVE_TIMEOUT_MS,
};
use crate::fpga::{Fpga, IrqSource, Led, RegisterPort};

// Board slot bits which read as 11 when no master is present.
const BOARD_POS_NO_MASTER: u8 = 0x30;

// Value of the board slot while the FPGA isn't present.
const BOARD_POS_UNKNOWN: u8 = 0xFF;

/// Protocol engine states.  The numeric values appear in traces and the
/// engine status record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum State {
    Disabled = 0,
    Idle = 1,
    WaitSent = 2,
    WaitCtxe = 3,
    WaitAck = 4,
    BlockedSend = 5,
    PollEirq = 6,
    ReceiveCrx = 7,
    ReceiveCtx = 8,
}

/// How the transmission of a frame ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxStatus {
    /// Sent, and acknowledged if the frame needed it.
    Ok,
    /// The engine was reset or re-initialized with the frame in flight.
    Unspecified,
    /// No response when an acknowledgement was expected.
    AckTimeout,
    /// The wrong response arrived.  Carries the frame's control byte.
    Nak(u8),
    /// The command FIFO never emptied after an acknowledgement.
    CtxeTimeout,
    /// The command FIFO never emptied after sending.
    SentTimeout,
}

impl TxStatus {
    /// The status code carried in flow control records.
    pub fn code(&self) -> u8 {
        match self {
            TxStatus::Ok => 0,
            TxStatus::Unspecified => 0xFF,
            TxStatus::AckTimeout => 3,
            TxStatus::Nak(control) => 0x80 | control,
            TxStatus::CtxeTimeout => 0x78,
            TxStatus::SentTimeout => 0x79,
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == TxStatus::Ok
    }
}

/// A summary of the engine, as logged by [`Engine::dump_status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusSnapshot {
    pub present: bool,
    pub master: bool,
    pub board_pos: u8,
    pub eirq_pending: bool,
    pub ctx_empty: bool,
    pub trace_mask: u8,
    pub state: State,
    pub timer: i32,
    pub eirq_count: u32,
    pub stuck_eirq_count: u32,
    pub active_boards: usize,
}

// The frame being transmitted.
struct InFlight {
    frame: Vec<u8, MAX_FRAME_LEN>,
    // Accepted but not yet pushed into the command FIFO.
    pending: bool,
    // Submitted and not yet completed.
    awaiting: bool,
    // Completed, waiting to be collected.
    status: Option<TxStatus>,
}

impl InFlight {
    const fn new() -> Self {
        Self {
            frame: Vec::new(),
            pending: false,
            awaiting: false,
            status: None,
        }
    }

    fn control(&self) -> u8 {
        self.frame.first().copied().unwrap_or(0)
    }

    fn is_busy(&self) -> bool {
        self.pending || self.awaiting || self.status.is_some()
    }
}

pub struct Engine<P: RegisterPort, S: TelemetrySink> {
    fpga: Fpga<P>,
    sink: S,
    state: State,
    // Milliseconds until the current state times out.  Negative when no
    // timeout is armed.
    timer: i32,
    last_tick: u32,
    present: bool,
    master: bool,
    board_pos: u8,
    // A board has raised EIRQ (master), or the EIRQ line is asserted
    // (passive).
    eirq_pending: bool,
    // The command FIFO has been seen empty since we last wrote to it.
    ctx_empty: bool,
    interrupts_enabled: bool,
    trace_mask: TraceMask,
    poll: PollList,
    ctx: Reassembly,
    crx: Reassembly,
    tx: InFlight,
    eirq_count: u32,
    stuck_eirq_count: u32,
}

impl<P: RegisterPort, S: TelemetrySink> Engine<P, S> {
    /// Creates a disabled engine.  [`Engine::initialize`] brings up the
    /// FPGA.
    pub fn new(port: P, sink: S) -> Self {
        Self {
            fpga: Fpga::new(port),
            sink,
            state: State::Disabled,
            timer: -1,
            last_tick: 0,
            present: false,
            master: false,
            board_pos: BOARD_POS_UNKNOWN,
            eirq_pending: false,
            ctx_empty: false,
            interrupts_enabled: false,
            trace_mask: TraceMask::empty(),
            poll: PollList::new(),
            ctx: Reassembly::new(),
            crx: Reassembly::new(),
            tx: InFlight::new(),
            eirq_count: 0,
            stuck_eirq_count: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Whether the FPGA has been initialized successfully.
    pub fn is_ready(&self) -> bool {
        self.present
    }

    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn board_pos(&self) -> u8 {
        self.board_pos
    }

    /// Whether the dispatcher should wait on the FPGA interrupt line.
    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled
    }

    pub fn trace_mask(&self) -> TraceMask {
        self.trace_mask
    }

    pub fn set_trace_mask(&mut self, mask: TraceMask) {
        info!("Trace mask {}", mask);
        self.trace_mask = mask;
    }

    pub fn poll_list(&self) -> &PollList {
        &self.poll
    }

    pub fn fpga(&self) -> &Fpga<P> {
        &self.fpga
    }

    pub fn fpga_mut(&mut self) -> &mut Fpga<P> {
        &mut self.fpga
    }

    /// How long the dispatcher may sleep before calling
    /// [`Engine::on_timer`] again.
    pub fn next_timeout_ms(&self) -> i32 {
        if self.timer < 0 || self.timer > MAX_DISPATCH_WAIT_MS {
            MAX_DISPATCH_WAIT_MS
        } else {
            self.timer
        }
    }

    /// Whether a frame has been submitted and its completion not yet
    /// collected.
    pub fn has_frame_in_flight(&self) -> bool {
        self.tx.is_busy()
    }

    fn goto(&mut self, state: State, timeout_ms: Option<i32>) {
        if state != self.state {
            trace!("State {} -> {}", self.state, state);
        }
        self.state = state;
        self.timer = timeout_ms.unwrap_or(-1);
    }

    fn publish(&self, kind: MessageType, subtype: u8, data: &[u8]) {
        self.sink
            .publish(&Message::new(kind, subtype, self.last_tick, data));
    }

    fn publish_frame(&self, kind: MessageType, frame: &Reassembly, subtype: u8) {
        self.sink.publish(&Message::new(
            kind,
            subtype,
            frame.timestamp(),
            frame.bytes(),
        ));
    }

    // An octet arrived in a state which doesn't expect one.
    fn publish_ignored(&self, kind: MessageType, octet: u8) {
        self.publish(kind, subtype::IGNORED, &[octet, self.state as u8]);
    }

    fn publish_status(&self) {
        self.publish(
            MessageType::FpgaStatus,
            0,
            &[self.present as u8, self.master as u8, self.board_pos, 0],
        );
    }

    fn complete(&mut self, status: TxStatus) {
        if !self.tx.awaiting {
            return;
        }
        if !status.is_ok() {
            debug!("Frame {=u8:#x} failed {}", self.tx.control(), status);
        }
        self.tx.pending = false;
        self.tx.awaiting = false;
        self.tx.status = Some(status);
    }

    /// Accepts a frame for transmission.  It is sent the next time the
    /// engine is idle and the command FIFO empty, and its outcome is
    /// collected with [`Engine::take_completion`].
    pub fn submit(&mut self, frame: &[u8]) -> Result<(), XpiError> {
        if !self.present || !self.master {
            return Err(XpiError::NotMaster);
        }
        if self.tx.is_busy() {
            return Err(XpiError::Busy);
        }
        let frame = Vec::from_slice(frame).map_err(|_| XpiError::BadFrame(frame.len()))?;
        if frame.is_empty() {
            return Err(XpiError::BadFrame(0));
        }

        self.tx.frame = frame;
        self.tx.pending = true;
        self.tx.awaiting = true;
        self.tx.status = None;
        Ok(())
    }

    /// Collects the outcome of the last submitted frame, once there is one.
    pub fn take_completion(&mut self) -> Option<TxStatus> {
        self.tx.status.take()
    }

    /// Advances the state timer to `now_ms`, handling the timeout if it
    /// expires.
    pub fn on_timer(&mut self, now_ms: u32) {
        let delta = now_ms.wrapping_sub(self.last_tick) as i32;
        self.last_tick = now_ms;

        if self.timer < 0 {
            return;
        }
        self.timer -= delta;
        if self.timer > 0 {
            return;
        }
        self.timer = -1;

        match self.state {
            State::PollEirq => {
                self.poll.mark_active(false);
                self.poll_next_board();
            }
            State::BlockedSend => self.goto(State::Idle, None),
            State::ReceiveCtx => {
                warn!("Timeout receiving on CTX after {} bytes", self.ctx.len());
                self.ctx.clear();
                self.goto(State::Idle, None);
            }
            State::ReceiveCrx => {
                warn!("Timeout receiving on CRX after {} bytes", self.crx.len());
                self.crx.clear();
                self.goto(State::Idle, None);
                self.fpga.irq_enable(IrqSource::EIRQ);
            }
            State::WaitCtxe => {
                error!("Timeout waiting for CTX FIFO to empty after ack");
                self.reset_failing(TxStatus::CtxeTimeout);
            }
            State::WaitSent => {
                error!("Timeout waiting for frame to be sent");
                self.reset_failing(TxStatus::SentTimeout);
            }
            State::WaitAck => {
                debug!("Timeout waiting for ack");
                self.complete(TxStatus::AckTimeout);
                self.goto(State::Idle, None);
            }
            state => warn!("Unexpected timeout in state {}", state),
        }
    }

    /// The command FIFO has emptied.
    pub fn on_ctxe(&mut self) {
        self.ctx_empty = true;
        self.fpga.irq_disable(IrqSource::CTXE);

        match self.state {
            State::WaitSent => {
                self.complete(TxStatus::Ok);
                if ControlClass::from(self.tx.control()) == ControlClass::Sentinel {
                    self.goto(State::BlockedSend, Some(INTER_SEND_DELAY_MS));
                } else {
                    self.goto(State::Idle, None);
                }
            }
            State::WaitCtxe => self.goto(State::Idle, None),
            State::PollEirq if self.poll.on_sentinel() => self.poll_next_board(),
            _ => (),
        }
    }

    fn poll_next_board(&mut self) {
        match self.poll.advance() {
            PollStep::Board(board) => {
                self.ctx_empty = false;
                self.fpga.push_ctx(&[board]);
                self.goto(State::PollEirq, Some(EIRQ_POLL_TIMEOUT_MS));
            }
            PollStep::Exhausted => {
                self.stuck_eirq_count = self.stuck_eirq_count.wrapping_add(1);
                error!("EIRQ stuck - no board responded to poll");
                self.poll.rearrange();
                self.fpga.irq_enable(IrqSource::EIRQ);
                self.goto(State::Idle, None);
            }
        }
    }

    /// An octet is available on the command channel.
    pub fn on_ctx(&mut self) {
        let octet = self.fpga.read_ctx();

        if self.master {
            match self.state {
                State::Idle
                | State::WaitAck
                | State::WaitCtxe
                | State::WaitSent
                | State::BlockedSend => self.snoop_ctx(octet),
                State::PollEirq => {
                    if self.trace_mask.contains(TraceMask::EIRQ) {
                        self.publish(MessageType::TraceCtx, subtype::VALID, &[octet]);
                    }
                }
                _ => self.publish_ignored(MessageType::TraceCtx, octet),
            }
            return;
        }

        match self.state {
            State::Idle | State::ReceiveCtx => {
                if self.state == State::Idle {
                    self.ctx.begin(self.last_tick);
                }
                self.goto(State::ReceiveCtx, Some(RECEIVE_TIMEOUT_MS));
                self.ctx.append_and_checksum(octet);

                if self.eirq_pending && self.ctx.is_poll_sentinel() {
                    self.publish_frame(MessageType::TraceCtx, &self.ctx, subtype::VALID);
                    self.ctx.clear();
                    self.goto(State::PollEirq, Some(PASSIVE_POLL_TIMEOUT_MS));
                } else if self.ctx.is_ack() {
                    self.publish_frame(MessageType::TraceCtx, &self.ctx, subtype::VALID);
                    self.ctx.clear();
                    self.goto(State::Idle, None);
                } else if self.ctx.is_complete() {
                    let sub = frame_subtype(&self.ctx);
                    self.publish_frame(MessageType::TraceCtx, &self.ctx, sub);
                    self.ctx.clear();
                    self.goto(State::Idle, None);
                } else if self.ctx.is_overflow() {
                    self.publish_frame(MessageType::TraceCtx, &self.ctx, subtype::OVERFLOW);
                    self.ctx.clear();
                    self.goto(State::Idle, None);
                }
            }
            State::PollEirq => self.publish(MessageType::TraceCtx, subtype::VALID, &[octet]),
            _ => self.publish_ignored(MessageType::TraceCtx, octet),
        }
    }

    // As master, everything we write to the command channel is echoed
    // back.  Reassemble it for tracing.
    fn snoop_ctx(&mut self, octet: u8) {
        if self.ctx.is_empty() {
            self.ctx.begin(self.last_tick);
        }
        self.ctx.append_and_checksum(octet);

        if self.ctx.is_poll_sentinel() || self.ctx.is_nak_or_poll_response() {
            if self.trace_mask.contains(TraceMask::EIRQ) {
                self.publish_frame(MessageType::TraceCtx, &self.ctx, subtype::VALID);
            }
            self.ctx.clear();
        } else if self.ctx.is_ack() {
            if self.trace_mask.contains(TraceMask::ACK) {
                self.publish_frame(MessageType::TraceCtx, &self.ctx, subtype::VALID);
            }
            self.ctx.clear();
        } else if self.ctx.is_complete() {
            let sub = frame_subtype(&self.ctx);
            let control = self.ctx.control().unwrap_or(0);
            if self.trace_mask.contains(TraceMask::CTX)
                && (self.trace_mask.contains(TraceMask::CTX_E0_PKT)
                    || sub != subtype::VALID
                    || control & 0xE0 != 0xE0)
            {
                self.publish_frame(MessageType::TraceCtx, &self.ctx, sub);
            }
            self.ctx.clear();
        } else if self.ctx.is_overflow() {
            self.publish_frame(MessageType::TraceCtx, &self.ctx, subtype::OVERFLOW);
            self.ctx.clear();
        }
    }

    /// An octet is available on the response channel.
    pub fn on_crx(&mut self) {
        let octet = self.fpga.read_crx();

        if self.master {
            match self.state {
                State::WaitAck => self.receive_ack(octet),
                State::PollEirq => self.receive_poll_response(octet),
                State::ReceiveCrx => self.collect_crx(octet),
                _ => self.publish_ignored(MessageType::TraceCrx, octet),
            }
            return;
        }

        match self.state {
            State::Idle | State::ReceiveCrx | State::PollEirq => {
                if self.state != State::ReceiveCrx {
                    self.crx.begin(self.last_tick);
                }
                self.goto(State::ReceiveCrx, Some(RECEIVE_TIMEOUT_MS));
                self.crx.append_and_checksum(octet);

                if self.crx.is_ack() {
                    self.publish_frame(MessageType::TraceCrx, &self.crx, subtype::VALID);
                    self.crx.clear();
                    self.goto(State::Idle, None);
                } else if self.crx.is_complete() {
                    let sub = frame_subtype(&self.crx);
                    self.publish_frame(MessageType::TraceCrx, &self.crx, sub);
                    self.crx.clear();
                    self.goto(State::Idle, None);
                } else if self.crx.is_overflow() {
                    self.publish_frame(MessageType::TraceCrx, &self.crx, subtype::OVERFLOW);
                    self.crx.clear();
                    self.goto(State::Idle, None);
                }
            }
            _ => self.publish_ignored(MessageType::TraceCrx, octet),
        }
    }

    fn receive_ack(&mut self, octet: u8) {
        let control = self.tx.control();
        let status = if octet == ack_id(control) {
            TxStatus::Ok
        } else {
            TxStatus::Nak(control)
        };

        if self.trace_mask.contains(TraceMask::ACK) {
            let sub = if status.is_ok() {
                subtype::VALID
            } else {
                subtype::NAK
            };
            self.publish(MessageType::TraceCrx, sub, &[octet]);
        }

        self.complete(status);
        if self.ctx_empty {
            self.goto(State::Idle, None);
        } else {
            self.goto(State::WaitCtxe, Some(CTXE_TIMEOUT_MS));
        }
    }

    fn receive_poll_response(&mut self, octet: u8) {
        // Anything arriving while the sentinel is outstanding is ignored.
        let Some(board) = self.poll.current_board() else {
            return;
        };

        if self.trace_mask.contains(TraceMask::CRX) {
            self.publish(MessageType::TraceCrx, subtype::VALID, &[octet, board]);
        }

        if board_id(octet) != board {
            debug!("Poll of board {=u8} answered by {=u8:#x}", board, octet);
            self.poll.mark_active(false);
            self.poll_next_board();
            return;
        }

        match ControlClass::from(octet) {
            ControlClass::Response => {
                self.poll.mark_active(true);
                self.poll_next_board();
            }
            ControlClass::Ack => (),
            ControlClass::NeedsAck | ControlClass::Sentinel => {
                self.poll.mark_active(true);
                self.crx.begin(self.last_tick);
                self.fpga.irq_enable(IrqSource::EIRQ);
                self.collect_crx(octet);
            }
        }
    }

    fn collect_crx(&mut self, octet: u8) {
        self.crx.append_and_checksum(octet);
        if !self.crx.is_complete() {
            self.goto(State::ReceiveCrx, Some(RECEIVE_TIMEOUT_MS));
            return;
        }

        let sub = frame_subtype(&self.crx);
        self.publish_frame(MessageType::TraceCrx, &self.crx, sub);
        let control = self.crx.control().unwrap_or(0);
        self.crx.clear();

        if self.ctx_empty {
            self.ctx_empty = false;
            self.fpga.push_ctx(&[ack_id(control)]);
        } else {
            error!("Can't ack frame from {=u8:#x}, CTX FIFO busy", control);
        }

        self.poll.rearrange();
        self.goto(State::WaitCtxe, Some(CTXE_TIMEOUT_MS));
    }

    /// The external interrupt line has changed.
    pub fn on_eirq(&mut self) {
        if self.master {
            self.eirq_pending = true;
            self.fpga.irq_disable(IrqSource::EIRQ);
        } else {
            self.eirq_pending = self.fpga.read_eirq();
        }

        if self.trace_mask.contains(TraceMask::EIRQ) {
            self.publish(
                MessageType::TraceEirq,
                0,
                &[
                    self.eirq_pending as u8,
                    self.ctx.len() as u8,
                    self.state as u8,
                ],
            );
        }
    }

    /// A board control bus event.
    pub fn on_fc(&mut self) {
        let (command, sense) = self.fpga.read_fc_event();
        self.publish(
            MessageType::FcEvent,
            0,
            &[(command >> 2) & 0x3F, command & 0x03, sense, self.state as u8],
        );
    }

    /// Acknowledges and discards a PCM interrupt.
    pub fn on_pcm(&mut self) {
        self.fpga.ack_pcm();
    }

    pub fn pending_irqs(&mut self) -> IrqSource {
        self.fpga.pending_irqs()
    }

    /// Starts an EIRQ poll sweep, or sends the pending frame, if the engine
    /// is idle and the command FIFO is empty.  An EIRQ sweep takes
    /// precedence.
    pub fn start_transmission_if_idle(&mut self) {
        if !self.master || self.state != State::Idle || !self.ctx_empty {
            return;
        }

        self.fpga.led_clear(Led::YELLOW);

        if self.eirq_pending {
            self.eirq_pending = false;
            self.poll.start_sweep();
            self.eirq_count = self.eirq_count.wrapping_add(1);
            self.ctx_empty = false;
            self.fpga.push_ctx(&[POLL_SENTINEL]);
            self.goto(State::PollEirq, Some(EIRQ_POLL_TIMEOUT_MS));
            self.fpga.led_set(Led::YELLOW);
        } else if self.tx.pending {
            self.ctx_empty = false;
            self.tx.pending = false;
            self.fpga.push_ctx(&self.tx.frame);
            if ControlClass::from(self.tx.control()) == ControlClass::NeedsAck {
                self.goto(State::WaitAck, Some(RECEIVE_TIMEOUT_MS));
            } else {
                self.goto(State::WaitSent, Some(CTXE_TIMEOUT_MS));
            }
            self.fpga.led_set(Led::YELLOW);
        }
    }

    /// Shuts the backplane down and holds the FPGA in reset.  Any frame in
    /// flight fails.
    pub fn reset(&mut self) {
        self.reset_failing(TxStatus::Unspecified);
    }

    fn reset_failing(&mut self, status: TxStatus) {
        self.goto(State::Disabled, None);

        if self.present {
            info!("Resetting FPGA");
            self.interrupts_enabled = false;
            if self.master {
                for board in 0..MAX_BOARD_COUNT as u8 {
                    self.fpga.fc_command(board << 2);
                }
            }
            self.fpga.set_reset(true);
            self.present = false;
            self.master = false;
            self.board_pos = BOARD_POS_UNKNOWN;
            self.publish_status();
        }

        self.complete(status);
    }

    /// Brings the FPGA up and determines this board's role on the
    /// backplane.  Always publishes an engine status record.
    pub fn initialize(&mut self, cold_start: bool, force_passive: bool) {
        self.present = false;
        self.master = false;
        self.interrupts_enabled = false;
        self.complete(TxStatus::Unspecified);

        if cold_start || self.fpga.is_reset() {
            debug!("FPGA cold start");
            self.fpga.pulse_reset();
        } else {
            self.fpga.set_reset(false);
        }

        let id = self.fpga.identify();
        self.board_pos = id.board_pos;

        if id.magic != FPGA_MAGIC {
            warn!("FPGA not present, magic {=u16:#x}", id.magic);
            self.fpga.set_reset(true);
        } else if force_passive || id.board_pos & BOARD_POS_NO_MASTER != BOARD_POS_NO_MASTER {
            self.master = self.fpga.is_master();
            self.present = true;
        } else {
            self.board_pos = self.fpga.claim_master();
            if self.board_pos & BOARD_POS_NO_MASTER != 0 {
                error!(
                    "Failed to become bus master, board pos {=u8:#x}",
                    self.board_pos
                );
            } else {
                self.master = true;
                self.present = true;
            }
        }

        if self.present {
            info!(
                "FPGA initialized, board pos {=u8:#x}, master {}",
                self.board_pos, self.master
            );
            self.fpga.leds(Led::GREEN, Led::RED | Led::YELLOW);

            let mut irqs = IrqSource::EIRQ | IrqSource::CRX | IrqSource::CTX | IrqSource::FC;
            if self.master {
                irqs |= IrqSource::CTXE;
            }
            self.fpga.irq_enable(irqs);

            self.goto(State::Idle, None);
            self.eirq_pending = false;
            self.ctx_empty = false;
            self.ctx.clear();
            self.crx.clear();
            self.poll.reset();
            self.interrupts_enabled = true;
        }

        self.publish_status();
    }

    /// Sends a command on the board control bus, returning the sense line.
    pub fn board_control(&mut self, command: u8) -> bool {
        self.fpga.fc_command(command)
    }

    /// Drives the green LED for the heartbeat.  Does nothing until the
    /// FPGA has been initialized.
    pub fn heartbeat(&mut self, on: bool) {
        if !self.present {
            return;
        }
        if on {
            self.fpga.led_set(Led::GREEN);
        } else {
            self.fpga.led_clear(Led::GREEN);
        }
    }

    /// Logs the engine state.
    pub fn dump_status(&self) -> StatusSnapshot {
        let snapshot = StatusSnapshot {
            present: self.present,
            master: self.master,
            board_pos: self.board_pos,
            eirq_pending: self.eirq_pending,
            ctx_empty: self.ctx_empty,
            trace_mask: self.trace_mask.bits(),
            state: self.state,
            timer: self.timer,
            eirq_count: self.eirq_count,
            stuck_eirq_count: self.stuck_eirq_count,
            active_boards: self.poll.active_count(),
        };

        info!("{}", snapshot);

        let active: Vec<u8, MAX_BOARD_COUNT> = self.poll.active_boards().collect();
        let passive: Vec<u8, MAX_BOARD_COUNT> = self.poll.passive_boards().collect();
        info!("Active boards: {=[u8]}", active.as_slice());
        info!("Passive boards: {=[u8]}", passive.as_slice());

        snapshot
    }
}

fn frame_subtype(frame: &Reassembly) -> u8 {
    if frame.is_valid() {
        subtype::VALID
    } else {
        subtype::BAD_CHECKSUM
    }
}
