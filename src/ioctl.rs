// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Out-of-band control codes for DMA device nodes.
//!
//! The numeric values match the Windows `CTL_CODE(FILE_DEVICE_UNKNOWN,
//! 0x800 + index, METHOD_BUFFERED, FILE_ANY_ACCESS)` encoding used by the
//! ADMA user-space tools, so raw codes can be passed straight through.

use crate::engine::{AddressMode, PerfData};
use crate::error::AdmaError;

const FILE_DEVICE_UNKNOWN: u32 = 0x22;
const METHOD_BUFFERED: u32 = 0;
const FILE_ANY_ACCESS: u32 = 0;

const fn ctl_code(index: u32) -> u32 {
    (FILE_DEVICE_UNKNOWN << 16) | (FILE_ANY_ACCESS << 14) | ((0x800 + index) << 2) | METHOD_BUFFERED
}

/// Control operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ControlCode {
    /// Reset the performance counters and start measuring.
    PerfStart = ctl_code(0x1),

    /// Read the performance counters.
    PerfGet = ctl_code(0x3),

    /// Read the address increment mode (0 = incrementing, 1 = fixed).
    AddrModeGet = ctl_code(0x4),

    /// Write the address increment mode.
    AddrModeSet = ctl_code(0x5),
}

impl ControlCode {
    /// Returns the code as a u32 value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Returns a human-readable name for the code.
    pub const fn name(self) -> &'static str {
        match self {
            Self::PerfStart => "PERF_START",
            Self::PerfGet => "PERF_GET",
            Self::AddrModeGet => "ADDRMODE_GET",
            Self::AddrModeSet => "ADDRMODE_SET",
        }
    }
}

impl TryFrom<u32> for ControlCode {
    type Error = AdmaError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        [
            Self::PerfStart,
            Self::PerfGet,
            Self::AddrModeGet,
            Self::AddrModeSet,
        ]
        .into_iter()
        .find(|c| c.as_u32() == code)
        .ok_or(AdmaError::Unsupported(code))
    }
}

impl std::fmt::Display for ControlCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#010x})", self.name(), self.as_u32())
    }
}

/// A decoded control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    PerfStart,
    PerfGet,
    AddrModeGet,
    AddrModeSet(AddressMode),
}

impl ControlRequest {
    /// The wire code for this request.
    pub fn code(&self) -> ControlCode {
        match self {
            Self::PerfStart => ControlCode::PerfStart,
            Self::PerfGet => ControlCode::PerfGet,
            Self::AddrModeGet => ControlCode::AddrModeGet,
            Self::AddrModeSet(_) => ControlCode::AddrModeSet,
        }
    }

    /// Decode a raw code plus its input buffer.
    ///
    /// `AddrModeSet` takes a 4-byte little-endian mode value.
    pub fn decode(code: u32, input: &[u8]) -> Result<Self, AdmaError> {
        Ok(match ControlCode::try_from(code)? {
            ControlCode::PerfStart => Self::PerfStart,
            ControlCode::PerfGet => Self::PerfGet,
            ControlCode::AddrModeGet => Self::AddrModeGet,
            ControlCode::AddrModeSet => {
                let raw: [u8; 4] = input.get(..4).and_then(|b| b.try_into().ok()).ok_or_else(
                    || {
                        AdmaError::InvalidParameter(format!(
                            "address mode input must be 4 bytes, got {}",
                            input.len()
                        ))
                    },
                )?;
                Self::AddrModeSet(AddressMode::from(u32::from_le_bytes(raw)))
            }
        })
    }
}

/// Result of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResponse {
    Done,
    Perf(PerfData),
    AddrMode(AddressMode),
}

impl ControlResponse {
    /// Serialize into `output`, returning the number of bytes written.
    pub fn encode(&self, output: &mut [u8]) -> Result<usize, AdmaError> {
        let out_len = output.len();
        let mut put = |bytes: &[u8]| {
            let dst = output.get_mut(..bytes.len()).ok_or_else(|| {
                AdmaError::InvalidParameter(format!(
                    "output buffer holds {} bytes, need {}",
                    out_len,
                    bytes.len()
                ))
            })?;
            dst.copy_from_slice(bytes);
            Ok(bytes.len())
        };
        match self {
            Self::Done => Ok(0),
            Self::Perf(perf) => put(&perf.to_bytes()),
            Self::AddrMode(mode) => put(&mode.as_u32().to_le_bytes()),
        }
    }
}
