//! The deferred interrupt dispatcher.
//!
//! The dispatcher task owns the protocol [`Engine`].  It sleeps until the
//! FPGA asserts its interrupt line, another task pokes it through the
//! [`EngineLink`], or the engine's next timeout is due.  On an interrupt it
//! reads the FPGA's interrupt request bitmap and routes each pending source
//! to the engine, repeating until nothing is pending.
//!
//! The interrupt line is level triggered, and is only waited on again once
//! the bitmap has been drained, which leaves it masked while the engine
//! works.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::future::Future;
use embassy_futures::select::{Either3, select3};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer, with_timeout};
use heapless::Vec;
use portable_atomic::{AtomicBool, Ordering};

#[allow(unused_imports)]
use crate::util::log::{debug, error, info, trace, warn};

use super::engine::{Engine, TxStatus};
use super::telemetry::{TelemetrySink, TraceMask, now_ms};
use crate::constants::{
    BOARD_POWER_CYCLE_DELAY, ENGINE_ACTION_CHANNEL_SIZE, MAX_DISPATCH_ITERATIONS, MAX_FRAME_LEN,
    TX_WAIT_LOG_INTERVAL,
};
use crate::fpga::{IrqSource, RegisterPort};

/// Board control operations.
pub mod board_op {
    pub const OFF: u8 = 0;
    pub const ON: u8 = 1;
    pub const QUERY_POWERED: u8 = 2;
    pub const QUERY_INSTALLED: u8 = 3;
}

/// Requests other tasks make of the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EngineAction {
    Initialize {
        cold_start: bool,
        force_passive: bool,
    },
    Reset,
    SetTraceMask(u8),
    DumpStatus,
    /// Send a single board control command, `(board << 2) | op`.
    BoardControl(u8),
    /// Power a board off and on again, then query it.
    PowerCycle(u8),
    /// Light or darken the heartbeat LED.
    Heartbeat(bool),
}

/// The FPGA interrupt line.
pub trait IrqLine {
    /// Completes while the line is asserted.
    fn wait_for_irq(&mut self) -> impl Future<Output = ()>;
}

/// Everything other tasks use to reach the engine.
pub struct EngineLink {
    wake: Signal<CriticalSectionRawMutex, ()>,
    request: Signal<CriticalSectionRawMutex, Vec<u8, MAX_FRAME_LEN>>,
    done: Signal<CriticalSectionRawMutex, TxStatus>,
    actions: Channel<CriticalSectionRawMutex, EngineAction, ENGINE_ACTION_CHANNEL_SIZE>,
    ready: AtomicBool,
    master: AtomicBool,
}

impl Default for EngineLink {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineLink {
    pub const fn new() -> Self {
        Self {
            wake: Signal::new(),
            request: Signal::new(),
            done: Signal::new(),
            actions: Channel::new(),
            ready: AtomicBool::new(false),
            master: AtomicBool::new(false),
        }
    }

    /// Whether the engine has initialized the FPGA.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Whether this board is the backplane master.
    pub fn is_master(&self) -> bool {
        self.master.load(Ordering::Relaxed)
    }

    fn sync<P: RegisterPort, S: TelemetrySink>(&self, engine: &Engine<P, S>) {
        self.ready.store(engine.is_ready(), Ordering::Relaxed);
        self.master.store(engine.is_master(), Ordering::Relaxed);
    }

    /// Queues an action for the dispatcher.
    pub async fn request_action(&self, action: EngineAction) {
        self.actions.send(action).await;
    }

    /// Hands a frame to the engine and waits for the outcome.  Only one
    /// task may transmit.
    pub async fn transmit(&self, frame: &[u8]) -> TxStatus {
        let Ok(frame) = Vec::from_slice(frame) else {
            warn!("Frame too long to transmit: {}", frame.len());
            return TxStatus::Unspecified;
        };

        self.done.reset();
        self.request.signal(frame);
        self.wake.signal(());

        loop {
            match with_timeout(TX_WAIT_LOG_INTERVAL, self.done.wait()).await {
                Ok(status) => return status,
                Err(_) => debug!("Still waiting for frame to be sent"),
            }
        }
    }
}

/// How a drain of the interrupt bitmap ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DrainOutcome {
    /// Nothing left pending.
    Clean,
    /// Sources were still pending after the iteration limit.
    Flooded,
}

/// Routes pending interrupt sources to the engine until none remain, giving
/// the engine the chance to start a transmission between reads.
pub fn drain_interrupts<P: RegisterPort, S: TelemetrySink>(
    engine: &mut Engine<P, S>,
) -> DrainOutcome {
    for _ in 0..MAX_DISPATCH_ITERATIONS {
        engine.start_transmission_if_idle();

        let irqs = engine.pending_irqs();
        if irqs.is_empty() {
            return DrainOutcome::Clean;
        }

        if irqs.contains(IrqSource::CTXE) {
            engine.on_ctxe();
        }
        if irqs.contains(IrqSource::CTX) {
            engine.on_ctx();
        }
        if irqs.contains(IrqSource::CRX) {
            engine.on_crx();
        }
        if irqs.contains(IrqSource::EIRQ) {
            engine.on_eirq();
        }
        if irqs.contains(IrqSource::FC) {
            engine.on_fc();
        }
        if irqs.contains(IrqSource::PCM) {
            engine.on_pcm();
        }
    }

    DrainOutcome::Flooded
}

// Why the dispatcher woke.
enum Wake {
    Timeout,
    Irq,
    Link,
    Action(EngineAction),
}

pub struct Dispatcher<'a, P: RegisterPort, S: TelemetrySink, I: IrqLine> {
    engine: Engine<P, S>,
    link: &'a EngineLink,
    irq: I,
}

impl<'a, P: RegisterPort, S: TelemetrySink, I: IrqLine> Dispatcher<'a, P, S, I> {
    pub fn new(engine: Engine<P, S>, link: &'a EngineLink, irq: I) -> Self {
        link.sync(&engine);
        Self { engine, link, irq }
    }

    pub fn engine(&self) -> &Engine<P, S> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<P, S> {
        &mut self.engine
    }

    /// Runs a single dispatch cycle.
    pub async fn run_once(&mut self) {
        self.engine.on_timer(now_ms());
        self.link.sync(&self.engine);

        let timeout = Duration::from_millis(self.engine.next_timeout_ms() as u64);
        let wake = self.wait(timeout).await;

        self.engine.on_timer(now_ms());

        if let Wake::Action(action) = wake {
            self.perform_action(action).await;
        }
        while let Ok(action) = self.link.actions.try_receive() {
            self.perform_action(action).await;
        }

        self.accept_frame();

        match wake {
            Wake::Timeout => self.engine.start_transmission_if_idle(),
            Wake::Irq | Wake::Link | Wake::Action(_) => {
                if drain_interrupts(&mut self.engine) == DrainOutcome::Flooded {
                    error!("FPGA interrupt flood, resetting");
                    self.engine.reset();
                }
            }
        }

        if let Some(status) = self.engine.take_completion() {
            self.link.done.signal(status);
        }
        self.link.sync(&self.engine);
    }

    async fn wait(&mut self, timeout: Duration) -> Wake {
        let irq_enabled = self.engine.interrupts_enabled();
        let irq = &mut self.irq;
        let irq_wait = async {
            if irq_enabled {
                irq.wait_for_irq().await
            } else {
                core::future::pending().await
            }
        };

        let woken = with_timeout(
            timeout,
            select3(irq_wait, self.link.wake.wait(), self.link.actions.receive()),
        )
        .await;

        match woken {
            Err(_) => Wake::Timeout,
            Ok(Either3::First(())) => Wake::Irq,
            Ok(Either3::Second(())) => Wake::Link,
            Ok(Either3::Third(action)) => Wake::Action(action),
        }
    }

    // Passes a frame from the transmitter to the engine.  A frame the
    // engine refuses completes straight away.
    fn accept_frame(&mut self) {
        let Some(frame) = self.link.request.try_take() else {
            return;
        };
        if let Err(e) = self.engine.submit(&frame) {
            warn!("Engine refused frame: {}", e);
            self.link.done.signal(TxStatus::Unspecified);
        }
    }

    async fn perform_action(&mut self, action: EngineAction) {
        trace!("Engine action {}", action);
        match action {
            EngineAction::Initialize {
                cold_start,
                force_passive,
            } => self.engine.initialize(cold_start, force_passive),
            EngineAction::Reset => self.engine.reset(),
            EngineAction::SetTraceMask(mask) => self
                .engine
                .set_trace_mask(TraceMask::from_bits_truncate(mask)),
            EngineAction::DumpStatus => {
                self.engine.dump_status();
            }
            EngineAction::BoardControl(command) => {
                let sense = self.engine.board_control(command);
                debug!("Board control {=u8:#x}, sense {}", command, sense);
                Timer::after(BOARD_POWER_CYCLE_DELAY).await;
            }
            EngineAction::PowerCycle(board) => self.power_cycle(board).await,
            EngineAction::Heartbeat(on) => self.engine.heartbeat(on),
        }
    }

    async fn power_cycle(&mut self, board: u8) {
        let board = (board & 0x3F) << 2;
        info!("Power cycling board {=u8}", board >> 2);

        self.engine.board_control(board | board_op::OFF);
        Timer::after(BOARD_POWER_CYCLE_DELAY).await;
        self.engine.board_control(board | board_op::ON);
        Timer::after(BOARD_POWER_CYCLE_DELAY).await;

        if self.engine.board_control(board | board_op::QUERY_INSTALLED) {
            Timer::after(BOARD_POWER_CYCLE_DELAY).await;
            let powered = self.engine.board_control(board | board_op::QUERY_POWERED);
            debug!("Board {=u8} installed, powered {}", board >> 2, powered);
        } else {
            debug!("Board {=u8} not installed", board >> 2);
        }
        Timer::after(BOARD_POWER_CYCLE_DELAY).await;
    }
}

#[cfg(feature = "firmware")]
pub use firmware::{ENGINE_LINK, OUTBOUND, dispatcher_task, heartbeat_task, transmitter_task};

#[cfg(feature = "firmware")]
mod firmware {
    use embassy_time::{Instant, Timer};

    #[allow(unused_imports)]
    use crate::util::log::{debug, error, info, trace, warn};

    use super::{Dispatcher, EngineAction, EngineLink};
    use crate::constants::{
        DISPATCHER_WATCHDOG_TIMER, HEARTBEAT_OFF_TIME, HEARTBEAT_ON_TIME, LOOP_LOG_INTERVAL,
        STAGING_QUEUE_SIZE,
    };
    use crate::fpga::rp::{FpgaIrq, RpPort};
    use crate::infra::watchdog::{TaskId, WatchdogType};
    use crate::xpi::delivery::deliver;
    use crate::xpi::engine::Engine;
    use crate::xpi::queue::OutboundQueue;
    use crate::xpi::telemetry::{ChannelSink, UPSTREAM};

    /// The link between the engine and the other tasks.
    pub static ENGINE_LINK: EngineLink = EngineLink::new();

    /// Frames staged for the backplane.
    pub static OUTBOUND: OutboundQueue<ChannelSink<'static>, STAGING_QUEUE_SIZE> =
        OutboundQueue::new(ChannelSink::new(&UPSTREAM));

    #[embassy_executor::task]
    pub async fn dispatcher_task(
        port: RpPort,
        irq: FpgaIrq,
        watchdog: &'static WatchdogType,
    ) -> ! {
        info!("Dispatcher task started");

        let engine = Engine::new(port, ChannelSink::new(&UPSTREAM));
        let mut dispatcher = Dispatcher::new(engine, &ENGINE_LINK, irq);

        let id = TaskId::Dispatcher;
        watchdog.register_task(&id, DISPATCHER_WATCHDOG_TIMER).await;

        let mut next_log_instant = Instant::now();
        loop {
            let now = Instant::now();
            if now >= next_log_instant {
                trace!("Dispatcher loop, state {}", dispatcher.engine().state());
                next_log_instant += LOOP_LOG_INTERVAL;
            }

            watchdog.feed(&id).await;

            dispatcher.run_once().await;
        }
    }

    /// Flashes the green LED off briefly once a second while the FPGA is
    /// up.
    #[embassy_executor::task]
    pub async fn heartbeat_task() -> ! {
        info!("Heartbeat task started");

        let mut next = Instant::now();
        loop {
            next += HEARTBEAT_ON_TIME;
            Timer::at(next).await;
            if ENGINE_LINK.is_ready() {
                ENGINE_LINK
                    .request_action(EngineAction::Heartbeat(false))
                    .await;
            }

            next += HEARTBEAT_OFF_TIME;
            Timer::at(next).await;
            if ENGINE_LINK.is_ready() {
                ENGINE_LINK
                    .request_action(EngineAction::Heartbeat(true))
                    .await;
            }
        }
    }

    #[embassy_executor::task]
    pub async fn transmitter_task() -> ! {
        info!("Transmitter task started");

        let sink = ChannelSink::new(&UPSTREAM);
        loop {
            OUTBOUND
                .drain_one(|frame| deliver(&ENGINE_LINK, &sink, frame))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;
    use embassy_futures::select::{Either, select};

    use super::*;
    use crate::fpga::sim::SimPort;
    use crate::fpga::{page0, page1};
    use crate::xpi::delivery::deliver;
    use crate::xpi::engine::State;
    use crate::xpi::frame::checksum;
    use crate::xpi::queue::StagedFrame;
    use crate::xpi::telemetry::MessageType;
    use crate::xpi::telemetry::test_sink::RecordingSink;

    // An interrupt line which never asserts.
    struct QuietIrq;

    impl IrqLine for QuietIrq {
        fn wait_for_irq(&mut self) -> impl Future<Output = ()> {
            core::future::pending()
        }
    }

    // An interrupt line which is always asserted.
    struct StuckIrq;

    impl IrqLine for StuckIrq {
        fn wait_for_irq(&mut self) -> impl Future<Output = ()> {
            core::future::ready(())
        }
    }

    fn master_port() -> SimPort {
        let mut port = SimPort::new();
        port.queue_read(page1::PAGE, page1::R_BOARD_POS, 0x30);
        port.queue_read(page1::PAGE, page1::R_BOARD_POS, 0x02);
        port
    }

    #[test]
    fn test_drain_routes_sources() {
        let sink = RecordingSink::new();
        let mut engine = Engine::new(master_port(), &sink);
        engine.initialize(false, false);

        let port = engine.fpga_mut().port_mut();
        port.queue_irqs((IrqSource::CTXE | IrqSource::FC | IrqSource::PCM).bits());
        port.queue_irqs(IrqSource::EIRQ.bits());

        assert_eq!(drain_interrupts(&mut engine), DrainOutcome::Clean);
        assert_eq!(sink.of_kind(MessageType::FcEvent).len(), 1);
        // The EIRQ sweep started on the final pass round the loop.
        assert_eq!(engine.state(), State::PollEirq);
        assert_eq!(engine.fpga().port().ctx_fifo(), &[0xC0]);
    }

    #[test]
    fn test_drain_flood() {
        let sink = RecordingSink::new();
        let mut engine = Engine::new(master_port(), &sink);
        engine.initialize(false, false);
        engine
            .fpga_mut()
            .port_mut()
            .set_default(page0::PAGE, 0, IrqSource::FC.bits());

        assert_eq!(drain_interrupts(&mut engine), DrainOutcome::Flooded);
        assert_eq!(
            sink.of_kind(MessageType::FcEvent).len(),
            MAX_DISPATCH_ITERATIONS as usize
        );
    }

    #[test]
    fn test_flood_resets_engine() {
        let sink = RecordingSink::new();
        let link = EngineLink::new();
        let mut engine = Engine::new(master_port(), &sink);
        engine.initialize(false, false);
        engine
            .fpga_mut()
            .port_mut()
            .set_default(page0::PAGE, 0, IrqSource::CRX.bits());
        let mut dispatcher = Dispatcher::new(engine, &link, StuckIrq);
        assert!(link.is_master());

        block_on(dispatcher.run_once());

        assert_eq!(dispatcher.engine().state(), State::Disabled);
        assert!(!link.is_ready());
        assert!(!link.is_master());
        assert!(!dispatcher.engine().interrupts_enabled());
    }

    #[test]
    fn test_actions() {
        let sink = RecordingSink::new();
        let link = EngineLink::new();
        let engine = Engine::new(master_port(), &sink);
        let mut dispatcher = Dispatcher::new(engine, &link, QuietIrq);
        assert!(!link.is_ready());

        block_on(async {
            link.request_action(EngineAction::Initialize {
                cold_start: true,
                force_passive: false,
            })
            .await;
            link.request_action(EngineAction::SetTraceMask(0x0A)).await;
            dispatcher.run_once().await;
        });

        assert!(link.is_ready());
        assert!(link.is_master());
        assert_eq!(
            dispatcher.engine().trace_mask(),
            TraceMask::ACK | TraceMask::CTX
        );
        assert_eq!(sink.of_kind(MessageType::FpgaStatus).len(), 1);
    }

    #[test]
    fn test_heartbeat_action() {
        let sink = RecordingSink::new();
        let link = EngineLink::new();
        let mut engine = Engine::new(master_port(), &sink);
        engine.initialize(false, false);
        let mut dispatcher = Dispatcher::new(engine, &link, QuietIrq);
        let green = crate::fpga::Led::GREEN.bits();
        assert_eq!(dispatcher.engine().fpga().port().leds() & green, green);

        block_on(async {
            link.request_action(EngineAction::Heartbeat(false)).await;
            dispatcher.run_once().await;
        });
        assert_eq!(dispatcher.engine().fpga().port().leds() & green, 0);

        block_on(async {
            link.request_action(EngineAction::Heartbeat(true)).await;
            dispatcher.run_once().await;
        });
        assert_eq!(dispatcher.engine().fpga().port().leds() & green, green);
    }

    #[test]
    fn test_power_cycle_queries_installed_board() {
        let sink = RecordingSink::new();
        let link = EngineLink::new();
        let mut engine = Engine::new(master_port(), &sink);
        engine.initialize(false, false);
        let mut dispatcher = Dispatcher::new(engine, &link, QuietIrq);
        let port = dispatcher.engine_mut().fpga_mut().port_mut();
        port.clear_writes();
        // Sense for off, on, then installed.
        port.queue_read(page0::PAGE, page0::R_FC_STATUS, 0);
        port.queue_read(page0::PAGE, page0::R_FC_STATUS, 0);
        port.queue_read(page0::PAGE, page0::R_FC_STATUS, 0x08);

        block_on(async {
            link.request_action(EngineAction::PowerCycle(0x45)).await;
            dispatcher.run_once().await;
        });

        // Four commands, 19 writes each.
        let writes = dispatcher
            .engine()
            .fpga()
            .port()
            .writes_to(page0::PAGE, page0::W_FC_CONTROL)
            .count();
        assert_eq!(writes, 4 * 19);
    }

    #[test]
    fn test_transmit_through_dispatcher() {
        let sink = RecordingSink::new();
        let link = EngineLink::new();
        let mut engine = Engine::new(master_port(), &sink);
        engine.initialize(false, false);
        engine.on_ctxe();
        let mut dispatcher = Dispatcher::new(engine, &link, QuietIrq);

        let body = [0x41, 0x00];
        let mut frame = heapless::Vec::from_slice(&body).unwrap();
        frame.push(checksum(&body)).unwrap();
        let expected = frame.clone();
        // The FIFO reports empty as soon as the frame is pushed.
        dispatcher
            .engine_mut()
            .fpga_mut()
            .port_mut()
            .queue_irqs(IrqSource::CTXE.bits());

        let staged = StagedFrame {
            request_id: 0x0101,
            frame,
        };
        let result = block_on(select(
            async {
                loop {
                    dispatcher.run_once().await;
                }
            },
            deliver(&link, &sink, staged),
        ));

        assert!(matches!(result, Either::Second(())));
        assert!(sink.of_kind(MessageType::FlowCtrl).is_empty());
        assert_eq!(
            dispatcher.engine().fpga().port().ctx_fifo(),
            expected.as_slice()
        );
        assert_eq!(dispatcher.engine().state(), State::Idle);
    }

    // Delivers `body` through a dispatcher over an initialized master,
    // returning the flow control records published.
    fn deliver_through(
        body: &[u8],
        request_id: u16,
        irqs: &[IrqSource],
    ) -> (std::vec::Vec<(u8, std::vec::Vec<u8>)>, State) {
        let sink = RecordingSink::new();
        let link = EngineLink::new();
        let mut engine = Engine::new(master_port(), &sink);
        engine.initialize(false, false);
        engine.on_ctxe();
        for irq in irqs {
            engine.fpga_mut().port_mut().queue_irqs(irq.bits());
        }
        let mut dispatcher = Dispatcher::new(engine, &link, QuietIrq);

        let mut frame = heapless::Vec::from_slice(body).unwrap();
        frame.push(checksum(body)).unwrap();
        let staged = StagedFrame { request_id, frame };
        let result = block_on(select(
            async {
                loop {
                    dispatcher.run_once().await;
                }
            },
            deliver(&link, &sink, staged),
        ));
        assert!(matches!(result, Either::Second(())));

        let records = sink
            .of_kind(MessageType::FlowCtrl)
            .into_iter()
            .map(|m| (m.subtype, m.data.to_vec()))
            .collect();
        (records, dispatcher.engine().state())
    }

    #[test]
    fn test_sent_timeout_reported_with_own_status() {
        // The FIFO never reports empty.
        let (records, state) = deliver_through(&[0x41, 0x00], 0x0A0B, &[]);

        assert_eq!(records, vec![(TxStatus::SentTimeout.code(), vec![0x0A, 0x0B])]);
        assert_eq!(state, State::Disabled);
    }

    #[test]
    fn test_unacknowledged_frame_reported() {
        // The FIFO empties after the first attempt, but no ack ever comes.
        let (records, state) = deliver_through(&[0x85, 0x00], 0x1234, &[IrqSource::CTXE]);

        assert_eq!(records, vec![(TxStatus::AckTimeout.code(), vec![0x12, 0x34])]);
        assert_eq!(TxStatus::AckTimeout.code(), 3);
        assert_eq!(state, State::Idle);
    }

    #[test]
    fn test_refused_frame_completes() {
        let sink = RecordingSink::new();
        let link = EngineLink::new();
        let engine = Engine::new(master_port(), &sink);
        let mut dispatcher = Dispatcher::new(engine, &link, QuietIrq);

        let result = block_on(select(
            async {
                loop {
                    dispatcher.run_once().await;
                }
            },
            link.transmit(&[0x41, 0x00, 0x00]),
        ));

        assert!(matches!(result, Either::Second(TxStatus::Unspecified)));
    }
}
