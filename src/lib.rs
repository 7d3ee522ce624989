// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # ADMA PCIe DMA Engine
//!
//! I/O dispatch and DMA transaction engine for ADMA-based PCIe accelerator
//! cards. Each open handle is bound to one hardware access path:
//!
//! - register windows (the `control`, `user` and `bypass` BARs), accessed
//!   synchronously after a bounds check
//! - scatter-gather DMA on an H2C or C2H engine, serialized through a
//!   per-engine FIFO
//! - a streaming ring filled by C2H streaming completions
//! - user event slots pulsed by hardware interrupts
//!
//! ## Transaction Lifecycle
//!
//! ```text
//! Idle -> Admitted -> Programming -> Executing -> Completed | Failed | Cancelled
//! ```
//!
//! An engine holds at most one transaction. Every transaction ends in
//! exactly one terminal state, the engine is back to `Idle` before the
//! outcome is reported, and a cancel racing a hardware completion produces
//! a single report.
//!
//! ## Platform Support
//!
//! | Backend            | Availability                                |
//! |--------------------|---------------------------------------------|
//! | `MappedWindow`     | Linux, maps a sysfs BAR resource file       |
//! | `MemoryWindow`     | All platforms                               |
//! | `LoopbackEngine`   | All platforms, software DMA for testing     |
//!
//! ## Example
//!
//! ```rust,no_run
//! use adma_rust::{AdmaError, Device, DeviceConfig};
//!
//! fn main() -> Result<(), AdmaError> {
//!     let (device, _hw) = Device::loopback(DeviceConfig::default())?;
//!
//!     let h2c = device.open("h2c_0")?;
//!     let c2h = device.open("c2h_0")?;
//!     h2c.write(b"Hello, ADMA!", 0x1000)?;
//!
//!     let mut back = [0u8; 12];
//!     c2h.read(&mut back, 0x1000)?;
//!     assert_eq!(&back, b"Hello, ADMA!");
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `async`: `EventSlot::wait_async` on top of tokio.

use std::sync::{Mutex, MutexGuard, PoisonError};

// Module declarations
pub mod config;
pub mod descriptor;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod ioctl;
pub mod loopback;
pub mod queue;
pub mod ring;
pub mod transaction;
pub mod window;

// Re-exports for convenient access
pub use config::DeviceConfig;
pub use descriptor::{AdmaDesc, DescriptorChain, DescriptorProgrammer, SgProgrammer};
pub use device::{lookup_node, Device, DeviceResources, LoopbackHardware, NodeType};
pub use dispatch::{FileHandle, NodeBinding};
pub use engine::{
    AddressMode, CompletionMode, Direction, Engine, EngineDescriptor, EngineHw, PerfData,
    StatusFlags, TransferMode,
};
pub use error::{AdmaError, AdmaResult, Failure};
pub use event::EventSlot;
pub use ioctl::{ControlCode, ControlRequest, ControlResponse};
pub use loopback::LoopbackEngine;
pub use queue::IoRequest;
pub use ring::{RingBuffer, RingRead, RingStatus};
pub use transaction::{Completion, DmaBuffer, Terminal, TransactionState};
pub use window::{MemoryWindow, RegisterWindow};

#[cfg(target_os = "linux")]
pub use window::MappedWindow;

/// Lock a mutex, recovering the data if a holder panicked. Every state
/// guarded here stays consistent between statements.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
