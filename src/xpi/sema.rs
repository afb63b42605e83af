//! A counting semaphore, built on embassy-sync primitives.
//!
//! embassy-sync provides mutexes, signals and channels, but the staging
//! queue needs classic bounded-buffer signalling, where producers and the
//! consumer acquire and release arbitrary numbers of permits.

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::waitqueue::MultiWakerRegistration;
use embassy_time::{Duration, with_timeout};

struct State<const W: usize> {
    permits: usize,
    waiters: MultiWakerRegistration<W>,
}

/// A semaphore holding a count of permits.
///
/// `W` is the number of tasks which may be waiting at once.  If more wait,
/// all waiters are woken and re-register, so it is a limit on efficiency
/// rather than correctness.
pub struct CountingSemaphore<M: RawMutex, const W: usize> {
    state: Mutex<M, RefCell<State<W>>>,
}

impl<M: RawMutex, const W: usize> CountingSemaphore<M, W> {
    pub const fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(RefCell::new(State {
                permits,
                waiters: MultiWakerRegistration::new(),
            })),
        }
    }

    /// Takes `n` permits if they are available now.
    pub fn try_acquire(&self, n: usize) -> bool {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.permits >= n {
                state.permits -= n;
                true
            } else {
                false
            }
        })
    }

    /// Waits until `n` permits are available, and takes them.
    pub async fn acquire(&self, n: usize) {
        poll_fn(|cx| {
            self.state.lock(|state| {
                let mut state = state.borrow_mut();
                if state.permits >= n {
                    state.permits -= n;
                    Poll::Ready(())
                } else {
                    state.waiters.register(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }

    /// As [`CountingSemaphore::acquire`], but gives up after `timeout`.  A
    /// zero timeout doesn't wait at all.
    ///
    /// Returns whether the permits were taken.
    pub async fn acquire_timeout(&self, n: usize, timeout: Duration) -> bool {
        if self.try_acquire(n) {
            return true;
        }
        if timeout.as_ticks() == 0 {
            return false;
        }
        with_timeout(timeout, self.acquire(n)).await.is_ok()
    }

    /// Returns `n` permits, waking any waiters.
    pub fn release(&self, n: usize) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            state.permits += n;
            state.waiters.wake();
        })
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.state.lock(|state| state.borrow().permits)
    }
}
