// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Streaming ring buffer.
//!
//! Single producer (the engine completion context appending freshly DMA'd
//! bytes), single consumer (a blocking reader). Cursors and the occupied
//! count are only touched under one lock so they always agree. The producer
//! never waits for the consumer: a full ring rejects the append.

use crate::error::{AdmaError, AdmaResult};
use crate::lock;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How a ring read ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingStatus {
    /// At least one byte was copied.
    Success,
    /// Nothing arrived before the deadline. Not an error; retry.
    Timeout,
}

/// Result of [`RingBuffer::copy_bytes_to_memory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingRead {
    pub status: RingStatus,
    pub copied: usize,
}

struct RingState {
    storage: Box<[u8]>,
    read: usize,
    write: usize,
    occupied: usize,
    closed: bool,
    /// Consumers currently inside `copy_bytes_to_memory`.
    readers: usize,
    cancel_pending: bool,
    overruns: u64,
}

/// Bounded circular byte buffer.
pub struct RingBuffer {
    capacity: usize,
    state: Mutex<RingState>,
    data_ready: Condvar,
    drained: Condvar,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(RingState {
                storage: vec![0; capacity].into_boxed_slice(),
                read: 0,
                write: 0,
                occupied: 0,
                closed: false,
                readers: 0,
                cancel_pending: false,
                overruns: 0,
            }),
            data_ready: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn occupied(&self) -> usize {
        lock(&self.state).occupied
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Number of rejected appends.
    pub fn overruns(&self) -> u64 {
        lock(&self.state).overruns
    }

    /// Append `data` as a whole, or reject it with `RingOverrun` and leave
    /// the ring untouched.
    pub fn push(&self, data: &[u8]) -> AdmaResult<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(AdmaError::InvalidParameter("ring is closed".to_string()));
        }
        let available = self.capacity - state.occupied;
        if data.len() > available {
            state.overruns += 1;
            return Err(AdmaError::RingOverrun {
                requested: data.len(),
                available,
            });
        }
        if data.is_empty() {
            return Ok(());
        }

        let write = state.write;
        let first = data.len().min(self.capacity - write);
        state.storage[write..write + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        state.storage[..rest].copy_from_slice(&data[first..]);
        state.write = (write + data.len()) % self.capacity;
        state.occupied += data.len();
        drop(state);

        self.data_ready.notify_one();
        Ok(())
    }

    /// Copy up to `dst.len()` bytes out of the ring.
    ///
    /// Blocks until at least one byte is available or `timeout` elapses.
    /// Returns partial reads as soon as any data is present. Fails with
    /// `Cancelled` if the read is withdrawn or the ring is torn down.
    pub fn copy_bytes_to_memory(&self, dst: &mut [u8], timeout: Duration) -> AdmaResult<RingRead> {
        if dst.is_empty() {
            return Err(AdmaError::InvalidDeviceRequest(
                "zero-length ring read".to_string(),
            ));
        }
        let mut state = lock(&self.state);
        if state.closed {
            return Err(AdmaError::Cancelled);
        }
        state.readers += 1;
        let (mut state, result) = self.wait_and_copy(state, dst, timeout);
        state.readers -= 1;
        if state.readers == 0 {
            self.drained.notify_all();
        }
        result
    }

    fn wait_and_copy<'a>(
        &'a self,
        mut state: MutexGuard<'a, RingState>,
        dst: &mut [u8],
        timeout: Duration,
    ) -> (MutexGuard<'a, RingState>, AdmaResult<RingRead>) {
        let deadline = Instant::now() + timeout;
        loop {
            if state.cancel_pending || state.closed {
                state.cancel_pending = false;
                return (state, Err(AdmaError::Cancelled));
            }
            if state.occupied > 0 {
                let copied = Self::take(&mut state, self.capacity, dst);
                return (
                    state,
                    Ok(RingRead {
                        status: RingStatus::Success,
                        copied,
                    }),
                );
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return (
                    state,
                    Ok(RingRead {
                        status: RingStatus::Timeout,
                        copied: 0,
                    }),
                );
            };
            state = self
                .data_ready
                .wait_timeout(state, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn take(state: &mut RingState, capacity: usize, dst: &mut [u8]) -> usize {
        let n = dst.len().min(state.occupied);
        let read = state.read;
        let first = n.min(capacity - read);
        dst[..first].copy_from_slice(&state.storage[read..read + first]);
        dst[first..n].copy_from_slice(&state.storage[..n - first]);
        state.read = (read + n) % capacity;
        state.occupied -= n;
        n
    }

    /// Release a consumer blocked in `copy_bytes_to_memory` with `Cancelled`.
    /// No effect when nobody is waiting.
    pub fn cancel_reader(&self) {
        let mut state = lock(&self.state);
        if state.readers > 0 {
            state.cancel_pending = true;
            self.data_ready.notify_all();
        }
    }

    /// Tear down: reject further use, release blocked consumers, wait until
    /// they have left, then free the storage.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        self.data_ready.notify_all();
        while state.readers > 0 {
            state = self
                .drained
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        state.storage = Box::default();
        state.occupied = 0;
        state.read = 0;
        state.write = 0;
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("occupied", &state.occupied)
            .field("closed", &state.closed)
            .finish()
    }
}
