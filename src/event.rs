// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! User event slots.
//!
//! One slot per user interrupt source. A reader clears the slot and blocks;
//! the interrupt callback pulses it. The pulse is edge-triggered: it wakes a
//! reader that is already waiting and is otherwise lost. A signal that lands
//! strictly before `wait` clears the slot is never observed.

use crate::error::{AdmaError, AdmaResult};
use crate::lock;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct SlotState {
    /// Bumped by every pulse; a waiter watches for a change.
    generation: u64,
    waiting: bool,
    cancel_pending: bool,
    last_value: bool,
}

impl SlotState {
    /// Claim the slot for one waiter and clear it.
    fn begin_wait(&mut self) -> AdmaResult<u64> {
        if self.waiting {
            return Err(AdmaError::Busy);
        }
        self.waiting = true;
        Ok(self.generation)
    }

    /// The wait's result once cancelled or pulsed since `cleared`.
    fn outcome(&mut self, cleared: u64) -> Option<AdmaResult<bool>> {
        if self.cancel_pending {
            self.cancel_pending = false;
            // Leave the primitive signaled-then-reset, as a pulse would.
            self.generation = self.generation.wrapping_add(1);
            return Some(Err(AdmaError::Cancelled));
        }
        (self.generation != cleared).then_some(Ok(true))
    }

    fn end_wait(&mut self, result: AdmaResult<bool>) -> AdmaResult<bool> {
        self.waiting = false;
        if let Ok(value) = result {
            self.last_value = value;
        }
        result
    }
}

/// Wait/signal primitive for one hardware event source.
#[derive(Debug)]
pub struct EventSlot {
    index: u32,
    state: Mutex<SlotState>,
    pulsed: Condvar,
    #[cfg(feature = "async")]
    notify: tokio::sync::Notify,
}

impl EventSlot {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            state: Mutex::new(SlotState::default()),
            pulsed: Condvar::new(),
            #[cfg(feature = "async")]
            notify: tokio::sync::Notify::new(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Result of the most recent completed wait.
    pub fn last_value(&self) -> bool {
        lock(&self.state).last_value
    }

    /// Clear the slot, then block until pulsed or `timeout` elapses.
    ///
    /// `Ok(false)` on timeout. Only one reader per slot may wait at a time;
    /// a second concurrent reader gets `Busy`.
    pub fn wait(&self, timeout: Duration) -> AdmaResult<bool> {
        let mut state = lock(&self.state);
        let cleared = state.begin_wait()?;
        let deadline = Instant::now() + timeout;

        let result = loop {
            if let Some(result) = state.outcome(cleared) {
                break result;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break Ok(false);
            };
            state = self
                .pulsed
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        };
        state.end_wait(result)
    }

    /// Pulse the slot from the interrupt callback. Never blocks.
    pub fn signal(&self) {
        {
            let mut state = lock(&self.state);
            state.generation = state.generation.wrapping_add(1);
        }
        self.pulsed.notify_one();
        #[cfg(feature = "async")]
        self.notify.notify_waiters();
        log::trace!("event_{} signaled", self.index);
    }

    /// Release the blocked reader with `Cancelled`. No effect when idle.
    pub fn cancel_wait(&self) {
        let mut state = lock(&self.state);
        if state.waiting {
            state.cancel_pending = true;
            self.pulsed.notify_all();
            #[cfg(feature = "async")]
            self.notify.notify_waiters();
        }
    }

    /// Read-style entry point: `out` must be exactly one byte and receives
    /// 1 if the event fired, 0 on timeout. The size is checked before
    /// any waiting.
    pub fn read(&self, out: &mut [u8], timeout: Duration) -> AdmaResult<usize> {
        if out.len() != std::mem::size_of::<bool>() {
            log::error!(
                "event_{}: length is {} but must be {}",
                self.index,
                out.len(),
                std::mem::size_of::<bool>()
            );
            return Err(AdmaError::InvalidParameter(format!(
                "event read needs a {}-byte buffer, got {}",
                std::mem::size_of::<bool>(),
                out.len()
            )));
        }
        let fired = self.wait(timeout)?;
        out[0] = u8::from(fired);
        log::info!("event_{} returned {}", self.index, fired);
        Ok(out.len())
    }

    /// Async variant of [`wait`](Self::wait). Shares the slot with blocking
    /// readers: the same single-waiter rule, cancellation and edge semantics.
    #[cfg(feature = "async")]
    pub async fn wait_async(&self, timeout: Duration) -> AdmaResult<bool> {
        let cleared = lock(&self.state).begin_wait()?;
        let deadline = tokio::time::Instant::now() + timeout;

        let result = loop {
            // Register before looking at the state so a pulse in between
            // still wakes this waiter.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if let Some(result) = lock(&self.state).outcome(cleared) {
                break result;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break Ok(false);
            }
        };
        lock(&self.state).end_wait(result)
    }
}
