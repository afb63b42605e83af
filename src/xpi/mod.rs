//! The backplane protocol: framing, the outbound staging queue, the board
//! poll list, the protocol engine and the task glue which drives it.
//!
//! The engine is owned by the dispatcher task.  Everything else talks to it
//! through an [`dispatcher::EngineLink`]: the transmitter hands it frames
//! and waits for their completion, and the host link requests actions
//! (initialize, reset, trace configuration and so on).

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

pub mod delivery;
pub mod dispatcher;
pub mod engine;
pub mod frame;
pub mod poll_list;
pub mod queue;
pub mod sema;
pub mod telemetry;

/// Reasons the engine refuses a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum XpiError {
    /// The FPGA isn't initialized, or this board isn't the bus master.
    NotMaster,
    /// A frame is already in flight, or its completion hasn't been
    /// collected.
    Busy,
    /// The frame is empty or longer than a backplane frame can be.
    BadFrame(usize),
}
