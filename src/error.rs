// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for ADMA operations.

use crate::engine::StatusFlags;
use thiserror::Error;

/// Errors that can occur during ADMA operations.
#[derive(Debug, Error)]
pub enum AdmaError {
    /// Bad offset, length, node name, BAR index or buffer size.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Request not valid for this device node (wrong direction, zero length).
    #[error("invalid device request: {0}")]
    InvalidDeviceRequest(String),

    /// Engine already has an in-flight transaction.
    #[error("engine busy")]
    Busy,

    /// Transaction ended in the `Failed` state.
    #[error("hardware failure: {0}")]
    HardwareFailure(Failure),

    /// No data or event arrived within the deadline. Not fatal; retry.
    #[error("timed out")]
    Timeout,

    /// The caller withdrew the request.
    #[error("request cancelled")]
    Cancelled,

    /// Unknown control code.
    #[error("unsupported control code {0:#010x}")]
    Unsupported(u32),

    /// Streaming ring has no room for the appended bytes.
    #[error("ring overrun: {requested} bytes offered, {available} bytes free")]
    RingOverrun { requested: usize, available: usize },

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine or register window not enabled in the IP core.
    #[error("ADMA device not enabled or not configured")]
    DeviceNotEnabled,

    /// Permission denied accessing a BAR resource.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Memory mapping failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),
}

impl AdmaError {
    /// Returns true if the caller can simply retry the request.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Busy)
    }

    /// Returns true if the request was withdrawn rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Why a DMA transaction ended in the `Failed` state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// The engine status register reported an error.
    #[error("engine status {status:?}, completed {bytes_completed} bytes")]
    Device {
        status: StatusFlags,
        bytes_completed: usize,
    },

    /// The buffer needs more descriptors than the descriptor ring holds.
    #[error("descriptor chain needs {needed} entries, ring holds {capacity}")]
    DescriptorOverflow { needed: usize, capacity: usize },

    /// The buffer does not satisfy the engine's alignment requirement.
    #[error("buffer address {addr:#x} not aligned to {alignment} bytes")]
    Misaligned { addr: usize, alignment: usize },

    /// The card-side range of the transfer runs past the end of the
    /// address space.
    #[error("card range {addr:#x} + {len} bytes overflows the card address space")]
    CardAddressOverflow { addr: u64, len: usize },

    /// The engine refused to start.
    #[error("engine failed to start")]
    StartFailed,

    /// Poll-mode completion did not arrive in time.
    #[error("polled transfer did not complete within {millis} ms")]
    PollTimeout { millis: u64 },
}

/// Result type alias for ADMA operations.
pub type AdmaResult<T> = Result<T, AdmaError>;
