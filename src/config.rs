// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device-wide tuning knobs.

use std::time::Duration;

/// Default wait for a user event before reporting "not fired".
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default wait for streaming data before reporting a timeout.
pub const DEFAULT_RING_TIMEOUT: Duration = Duration::from_secs(3);

/// Default streaming ring size.
pub const DEFAULT_RING_CAPACITY: usize = 4 * 1024 * 1024;

/// Default upper bound on a polled transfer.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default spin iterations before the poll loop starts sleeping.
pub const DEFAULT_POLL_SPIN_ITERATIONS: u32 = 1_000;

/// Descriptors per engine descriptor ring.
pub const DEFAULT_DESCRIPTOR_RING_CAPACITY: usize = 2048;

/// Largest byte count a single descriptor may carry.
pub const DEFAULT_MAX_DESC_BYTES: usize = (1 << 28) - 1;

/// Configuration applied to every engine and slot at attach.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub event_timeout: Duration,
    pub ring_timeout: Duration,
    pub ring_capacity: usize,
    pub poll_timeout: Duration,
    pub poll_spin_iterations: u32,
    pub descriptor_ring_capacity: usize,
    pub max_desc_bytes: usize,
    /// Required host buffer alignment in bytes (1 = none).
    pub buffer_alignment: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            event_timeout: DEFAULT_EVENT_TIMEOUT,
            ring_timeout: DEFAULT_RING_TIMEOUT,
            ring_capacity: DEFAULT_RING_CAPACITY,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            poll_spin_iterations: DEFAULT_POLL_SPIN_ITERATIONS,
            descriptor_ring_capacity: DEFAULT_DESCRIPTOR_RING_CAPACITY,
            max_desc_bytes: DEFAULT_MAX_DESC_BYTES,
            buffer_alignment: 1,
        }
    }
}

impl DeviceConfig {
    pub fn with_event_timeout(mut self, timeout: Duration) -> Self {
        self.event_timeout = timeout;
        self
    }

    pub fn with_ring_timeout(mut self, timeout: Duration) -> Self {
        self.ring_timeout = timeout;
        self
    }

    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_poll_spin_iterations(mut self, iterations: u32) -> Self {
        self.poll_spin_iterations = iterations;
        self
    }

    pub fn with_descriptor_ring_capacity(mut self, capacity: usize) -> Self {
        self.descriptor_ring_capacity = capacity;
        self
    }

    pub fn with_max_desc_bytes(mut self, bytes: usize) -> Self {
        self.max_desc_bytes = bytes;
        self
    }

    pub fn with_buffer_alignment(mut self, alignment: usize) -> Self {
        self.buffer_alignment = alignment;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DeviceConfig::default();
        assert_eq!(config.event_timeout, Duration::from_secs(3));
        assert_eq!(config.ring_timeout, Duration::from_secs(3));
        assert_eq!(config.buffer_alignment, 1);
    }

    #[test]
    fn test_setters_chain() {
        let config = DeviceConfig::default()
            .with_event_timeout(Duration::from_millis(50))
            .with_ring_capacity(256)
            .with_max_desc_bytes(4096);
        assert_eq!(config.event_timeout, Duration::from_millis(50));
        assert_eq!(config.ring_capacity, 256);
        assert_eq!(config.max_desc_bytes, 4096);
    }
}
