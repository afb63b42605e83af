//! Delivery of staged frames to the backplane.
//!
//! Each frame taken from the staging queue gets [`MAX_SEND_ATTEMPTS`]
//! attempts.  A frame with the sentinel class is sent twice when it
//! succeeds, the second time marked as a retransmission.  If every attempt
//! fails, a flow control record carrying the final status and the request
//! id is published upstream.  A frame which times out in the FIFO has
//! already reset the engine, so it fails straight away.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[allow(unused_imports)]
use crate::util::log::{debug, error, info, trace, warn};

use super::dispatcher::EngineLink;
use super::engine::TxStatus;
use super::frame::mark_retransmission;
use super::queue::StagedFrame;
use super::telemetry::{Message, TelemetrySink, now_ms};
use crate::constants::MAX_SEND_ATTEMPTS;

/// What to do after an attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NextStep {
    /// Send [`Delivery::frame`] again.
    Resend,
    /// Delivered.
    Done,
    /// Out of attempts.  Carries the final status.
    Failed(TxStatus),
}

/// Retry bookkeeping for a single staged frame.
pub struct Delivery {
    staged: StagedFrame,
    attempts: u8,
    last_failure: Option<TxStatus>,
}

impl Delivery {
    pub fn new(staged: StagedFrame) -> Self {
        Self {
            staged,
            attempts: 0,
            last_failure: None,
        }
    }

    /// The bytes to send on the next attempt.
    pub fn frame(&self) -> &[u8] {
        &self.staged.frame
    }

    pub fn request_id(&self) -> u16 {
        self.staged.request_id
    }

    /// Records the outcome of the attempt just made.
    pub fn on_complete(&mut self, status: TxStatus) -> NextStep {
        self.attempts += 1;

        if status.is_ok() {
            if mark_retransmission(&mut self.staged.frame) {
                trace!("Resending {=u16:#x} as retransmission", self.staged.request_id);
                // The retransmission gets a single attempt.
                self.attempts = MAX_SEND_ATTEMPTS - 1;
                return NextStep::Resend;
            }
            return NextStep::Done;
        }

        // An engine reset refuses the retry, which mustn't hide the
        // original failure.
        let status = match (status, self.last_failure) {
            (TxStatus::Unspecified, Some(earlier)) => earlier,
            _ => status,
        };
        self.last_failure = Some(status);

        let fatal = matches!(status, TxStatus::SentTimeout | TxStatus::CtxeTimeout);
        if !fatal && self.attempts < MAX_SEND_ATTEMPTS {
            debug!(
                "Retrying {=u16:#x}, attempt {} failed {}",
                self.staged.request_id, self.attempts, status
            );
            NextStep::Resend
        } else {
            warn!(
                "Giving up on {=u16:#x} after {} attempts, {}",
                self.staged.request_id, self.attempts, status
            );
            NextStep::Failed(status)
        }
    }
}

/// Delivers one staged frame through the engine, publishing a flow control
/// record if it can't be delivered.  Frames are dropped when this board
/// isn't the bus master.
pub async fn deliver<S: TelemetrySink>(link: &EngineLink, sink: &S, staged: StagedFrame) {
    if !link.is_master() {
        debug!("Not bus master, dropping {=u16:#x}", staged.request_id);
        return;
    }

    let mut delivery = Delivery::new(staged);
    loop {
        let status = link.transmit(delivery.frame()).await;
        match delivery.on_complete(status) {
            NextStep::Resend => continue,
            NextStep::Done => return,
            NextStep::Failed(status) => {
                sink.publish(&Message::flow_control(
                    status.code(),
                    delivery.request_id(),
                    now_ms(),
                ));
                return;
            }
        }
    }
}
