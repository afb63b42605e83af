//! The outbound staging queue.
//!
//! Any task may stage a frame for transmission on the backplane.  The single
//! transmitter task drains the queue, one frame at a time, and hands each to
//! the protocol engine.
//!
//! Items are stored in a byte ring as a 2 byte big-endian length followed by
//! the payload, whose first 2 bytes are the caller's request id.  Two
//! counting semaphores track free space and staged bytes.  Space for an item
//! is only handed back once the transmitter has finished with it, whether
//! or not it was delivered.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::cell::RefCell;
use core::future::Future;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::Duration;
use heapless::Vec;

#[allow(unused_imports)]
use crate::util::log::{debug, error, info, trace, warn};

use super::sema::CountingSemaphore;
use super::telemetry::{Message, TelemetrySink, now_ms};
use crate::constants::{
    MAX_FRAME_LEN, MAX_STAGED_PAYLOAD, MIN_STAGED_PAYLOAD, REQUEST_ID_LEN, STAGED_HEADER_LEN,
};

/// Flow control status reported when a frame couldn't be staged in time.
pub const STATUS_QUEUE_FULL: u8 = 0x77;

// Producers which may wait for space at once, before waiters get woken
// spuriously.
const MAX_PRODUCERS: usize = 4;

/// A frame taken from the queue.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StagedFrame {
    pub request_id: u16,
    pub frame: Vec<u8, MAX_FRAME_LEN>,
}

struct Ring<const N: usize> {
    buf: [u8; N],
    write: usize,
    read: usize,
}

impl<const N: usize> Ring<N> {
    fn put(&mut self, octets: &[u8]) {
        for &octet in octets {
            self.buf[self.write] = octet;
            self.write = (self.write + 1) % N;
        }
    }

    fn take(&mut self, out: &mut [u8]) {
        for octet in out.iter_mut() {
            *octet = self.buf[self.read];
            self.read = (self.read + 1) % N;
        }
    }

    fn skip(&mut self, len: usize) {
        self.read = (self.read + len) % N;
    }
}

/// A bounded multi-producer, single consumer queue of staged frames.
pub struct OutboundQueue<S: TelemetrySink, const N: usize> {
    ring: Mutex<CriticalSectionRawMutex, RefCell<Ring<N>>>,
    free: CountingSemaphore<CriticalSectionRawMutex, MAX_PRODUCERS>,
    staged: CountingSemaphore<CriticalSectionRawMutex, 1>,
    sink: S,
}

impl<S: TelemetrySink, const N: usize> OutboundQueue<S, N> {
    /// Creates an empty queue.  Flow control notices are published to
    /// `sink`.
    pub const fn new(sink: S) -> Self {
        Self {
            ring: Mutex::new(RefCell::new(Ring {
                buf: [0; N],
                write: 0,
                read: 0,
            })),
            free: CountingSemaphore::new(N),
            staged: CountingSemaphore::new(0),
            sink,
        }
    }

    /// Stages `data` - a request id followed by a frame - for transmission.
    ///
    /// Waits up to `timeout` for space.  On timeout returns `false` and,
    /// unless `timeout` was zero, publishes a flow control notice carrying
    /// the request id.  Payloads which could never be sent are refused
    /// immediately.
    pub async fn enqueue(&self, data: &[u8], timeout: Duration) -> bool {
        let len = data.len();
        if !(MIN_STAGED_PAYLOAD..=MAX_STAGED_PAYLOAD).contains(&len) {
            warn!("Refusing to stage {} byte payload", len);
            return false;
        }
        let total = len + STAGED_HEADER_LEN;

        if !self.free.acquire_timeout(total, timeout).await {
            if timeout.as_ticks() != 0 {
                let request_id = u16::from_be_bytes([data[0], data[1]]);
                debug!("Staging queue full, request {=u16:#x}", request_id);
                self.sink.publish(&Message::flow_control(
                    STATUS_QUEUE_FULL,
                    request_id,
                    now_ms(),
                ));
            }
            return false;
        }

        self.ring.lock(|ring| {
            let mut ring = ring.borrow_mut();
            ring.put(&(len as u16).to_be_bytes());
            ring.put(data);
        });
        self.staged.release(total);

        true
    }

    /// Takes the next staged frame, waiting for one if necessary, and passes
    /// it to `deliver`.  The frame's space is returned to the queue once
    /// `deliver` completes.
    ///
    /// Only one task may drain the queue.
    pub async fn drain_one<F, Fut>(&self, deliver: F) -> u16
    where
        F: FnOnce(StagedFrame) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.staged.acquire(STAGED_HEADER_LEN).await;
        let mut header = [0; STAGED_HEADER_LEN];
        self.ring.lock(|ring| ring.borrow_mut().take(&mut header));
        let len = usize::from(u16::from_be_bytes(header));

        self.staged.acquire(len).await;
        let mut payload = [0; MAX_STAGED_PAYLOAD];
        let staged = self.ring.lock(|ring| {
            let mut ring = ring.borrow_mut();
            if len <= MAX_STAGED_PAYLOAD {
                ring.take(&mut payload[..len]);
                true
            } else {
                // Can't happen, as enqueue checks lengths.  Step over the
                // item so the ring stays in sync.
                ring.skip(len);
                false
            }
        });

        let request_id = u16::from_be_bytes([payload[0], payload[1]]);
        if staged {
            let frame = Vec::from_slice(&payload[REQUEST_ID_LEN..len]).unwrap_or_default();
            deliver(StagedFrame { request_id, frame }).await;
        } else {
            error!("Staged item with bad length {}", len);
        }

        self.free.release(len + STAGED_HEADER_LEN);
        request_id
    }

    /// Bytes currently reserved by staged items, including items being
    /// delivered.
    pub fn in_flight_bytes(&self) -> usize {
        N - self.free.available()
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xpi::telemetry::MessageType;
    use crate::xpi::telemetry::test_sink::RecordingSink;
    use embassy_futures::block_on;
    use std::cell::RefCell as StdRefCell;

    fn payload(request_id: u16, frame: &[u8]) -> std::vec::Vec<u8> {
        let mut data = request_id.to_be_bytes().to_vec();
        data.extend_from_slice(frame);
        data
    }

    #[test]
    fn test_enqueue_then_drain() {
        let sink = RecordingSink::new();
        let queue: OutboundQueue<_, 4096> = OutboundQueue::new(&sink);
        let data = payload(0xBEEF, &[0x85, 0x05, 1, 2, 3, 4, 5, 0x66]);
        assert_eq!(data.len(), 10);

        let start = embassy_time::Instant::now();
        assert!(block_on(queue.enqueue(&data, Duration::from_millis(1000))));
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(queue.in_flight_bytes(), 12);

        let got = StdRefCell::new(None);
        let request_id = block_on(queue.drain_one(|frame| {
            *got.borrow_mut() = Some(frame);
            async {}
        }));
        assert_eq!(request_id, 0xBEEF);
        let frame = got.take().unwrap();
        assert_eq!(frame.request_id, 0xBEEF);
        assert_eq!(&frame.frame[..], &data[2..]);
        assert_eq!(queue.in_flight_bytes(), 0);
        assert_eq!(sink.len(), 0);
    }

    #[test]
    fn test_space_held_until_delivery_done() {
        let sink = RecordingSink::new();
        let queue: OutboundQueue<_, 64> = OutboundQueue::new(&sink);
        assert!(block_on(queue.enqueue(&payload(1, &[0x05]), Duration::from_ticks(0))));

        let seen = StdRefCell::new(0);
        block_on(queue.drain_one(|_| {
            *seen.borrow_mut() = queue.in_flight_bytes();
            async {}
        }));
        assert_eq!(*seen.borrow(), 5);
        assert_eq!(queue.in_flight_bytes(), 0);
    }

    #[test]
    fn test_full_queue_zero_timeout() {
        let sink = RecordingSink::new();
        let queue: OutboundQueue<_, 16> = OutboundQueue::new(&sink);
        let data = payload(7, &[0x05, 0x01, 0x02, 0x03]);
        assert!(block_on(queue.enqueue(&data, Duration::from_ticks(0))));
        assert!(block_on(queue.enqueue(&data, Duration::from_ticks(0))));
        // 24 of 16 bytes would be needed.
        assert!(!block_on(queue.enqueue(&data, Duration::from_ticks(0))));
        assert!(queue.in_flight_bytes() <= queue.capacity());
        assert_eq!(sink.len(), 0);
    }

    #[test]
    fn test_full_queue_reports_flow_control() {
        let sink = RecordingSink::new();
        let queue: OutboundQueue<_, 16> = OutboundQueue::new(&sink);
        assert!(block_on(queue.enqueue(
            &payload(1, &[0; 12]),
            Duration::from_ticks(0)
        )));
        assert!(!block_on(queue.enqueue(
            &payload(0x0102, &[0x05]),
            Duration::from_millis(5)
        )));

        let notices = sink.of_kind(MessageType::FlowCtrl);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].subtype, STATUS_QUEUE_FULL);
        assert_eq!(notices[0].data.as_slice(), &[0x01, 0x02]);
    }

    #[test]
    fn test_bad_lengths_refused() {
        let sink = RecordingSink::new();
        let queue: OutboundQueue<_, 256> = OutboundQueue::new(&sink);
        assert!(!block_on(queue.enqueue(&[0x00, 0x01], Duration::from_ticks(0))));
        assert!(!block_on(queue.enqueue(&[0; 21], Duration::from_ticks(0))));
        assert_eq!(queue.in_flight_bytes(), 0);
        assert_eq!(sink.len(), 0);
    }

    #[test]
    fn test_fifo_order_across_wrap() {
        let sink = RecordingSink::new();
        let queue: OutboundQueue<_, 20> = OutboundQueue::new(&sink);
        let mut next_id = 0u16;
        let mut expect_id = 0u16;

        // Repeatedly fill and drain, so items straddle the end of the ring.
        for round in 0..10u8 {
            while block_on(queue.enqueue(
                &payload(next_id, &[0x80 | round, next_id as u8, 0xAA]),
                Duration::from_ticks(0),
            )) {
                next_id += 1;
                assert!(queue.in_flight_bytes() <= queue.capacity());
            }
            while queue.in_flight_bytes() > 0 {
                let id = block_on(queue.drain_one(|frame| {
                    assert_eq!(frame.frame[1], frame.request_id as u8);
                    assert_eq!(frame.frame[2], 0xAA);
                    async {}
                }));
                assert_eq!(id, expect_id);
                expect_id += 1;
            }
        }
        assert_eq!(next_id, expect_id);
        assert!(next_id > 10);
    }

    #[test]
    fn test_blocked_producer_proceeds_after_drain() {
        let sink = RecordingSink::new();
        let queue: OutboundQueue<_, 16> = OutboundQueue::new(&sink);
        assert!(block_on(queue.enqueue(
            &payload(1, &[0; 12]),
            Duration::from_ticks(0)
        )));

        let (staged, _) = block_on(embassy_futures::join::join(
            queue.enqueue(&payload(2, &[0x05]), Duration::from_millis(500)),
            queue.drain_one(|_| async {}),
        ));
        assert!(staged);
        assert_eq!(queue.in_flight_bytes(), 5);
        assert_eq!(sink.len(), 0);
    }
}
