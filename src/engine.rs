// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DMA engine objects.
//!
//! An engine is one hardware transfer unit for one direction on one channel.
//! The device owns every engine; file handles and queues only hold `Arc`s.
//! Transaction state transitions live in [`crate::transaction`].

use crate::config::DeviceConfig;
use crate::descriptor::{DescriptorChain, DescriptorProgrammer};
use crate::error::{AdmaError, AdmaResult, Failure};
use crate::lock;
use crate::ring::RingBuffer;
use crate::transaction::{Transaction, TransactionState};
use bitflags::bitflags;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Transfer direction, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to card.
    H2C,
    /// Card to host.
    C2H,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::H2C => "h2c",
            Self::C2H => "c2h",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the engine moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Memory-mapped scatter-gather transfers bound to one request buffer.
    Block,
    /// AXI-stream; C2H data lands in a ring drained by readers.
    Streaming,
}

/// How the end of a block transfer is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// The engine raises an interrupt which calls `on_hardware_completion`.
    Interrupt,
    /// The submitting context polls the status register after programming.
    Poll,
}

/// Card-side address behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    /// Card address advances with every byte.
    #[default]
    Incrementing,
    /// Card address stays fixed (FIFO-style endpoint).
    Fixed,
}

impl AddressMode {
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::Incrementing => 0,
            Self::Fixed => 1,
        }
    }
}

impl From<u32> for AddressMode {
    fn from(raw: u32) -> Self {
        if raw == 0 {
            Self::Incrementing
        } else {
            Self::Fixed
        }
    }
}

bitflags! {
    /// Engine status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusFlags: u32 {
        const BUSY = 1 << 0;
        const DESC_STOPPED = 1 << 1;
        const DESC_COMPLETED = 1 << 2;
        const ALIGN_MISMATCH = 1 << 3;
        const MAGIC_STOPPED = 1 << 4;
        const INVALID_LENGTH = 1 << 5;
        const IDLE_STOPPED = 1 << 6;
        const READ_ERROR = 0x1F << 9;
        const DESC_ERROR = 0x1F << 19;
    }
}

impl StatusFlags {
    const ERROR_MASK: Self = Self::ALIGN_MISMATCH
        .union(Self::MAGIC_STOPPED)
        .union(Self::INVALID_LENGTH)
        .union(Self::READ_ERROR)
        .union(Self::DESC_ERROR);

    /// Returns true if any error bit is set.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.intersects(Self::ERROR_MASK)
    }

    /// Returns true once the engine has stopped after the last descriptor.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.contains(Self::DESC_STOPPED) && !self.contains(Self::BUSY)
    }
}

/// Snapshot of the engine status registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub flags: StatusFlags,
    /// Bytes moved by the descriptors that completed.
    pub completed_bytes: usize,
}

/// Callback invoked by the hardware layer when the engine interrupts.
pub type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

/// Register-level interface to one engine.
///
/// Implementations must not call back into the [`Engine`] from `start`,
/// `stop` or `status`; interrupts are delivered through the bound handler
/// from another context.
pub trait EngineHw: Send + Sync {
    /// Hand the descriptor chain to the engine and set the run bit.
    fn start(&self, chain: &DescriptorChain, buffer: &mut [u8]) -> Result<(), Failure>;

    /// Clear the run bit. Best effort.
    fn stop(&self);

    /// Read the status registers.
    fn status(&self) -> EngineStatus;

    fn set_interrupts(&self, enabled: bool);

    fn set_address_mode(&self, mode: AddressMode);

    /// Install the handler called when the engine raises its interrupt.
    fn bind_interrupt(&self, handler: InterruptHandler);
}

/// Engine configuration handed over at attach.
#[derive(Clone)]
pub struct EngineDescriptor {
    pub direction: Direction,
    pub channel: u32,
    pub transfer_mode: TransferMode,
    pub completion_mode: CompletionMode,
    pub enabled: bool,
    pub hw: Arc<dyn EngineHw>,
}

/// Performance counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerfData {
    /// Time since measurement started.
    pub elapsed: Duration,
    /// Bytes transferred since measurement started.
    pub bytes: u64,
    /// Completed transfers since measurement started.
    pub transfers: u64,
}

impl PerfData {
    /// Wire layout: elapsed ns, bytes, transfers; little-endian u64 each.
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        let nanos = u64::try_from(self.elapsed.as_nanos()).unwrap_or(u64::MAX);
        out[0..8].copy_from_slice(&nanos.to_le_bytes());
        out[8..16].copy_from_slice(&self.bytes.to_le_bytes());
        out[16..24].copy_from_slice(&self.transfers.to_le_bytes());
        out
    }
}

#[derive(Default)]
struct PerfCounters {
    started: Mutex<Option<Instant>>,
    bytes: AtomicU64,
    transfers: AtomicU64,
}

impl PerfCounters {
    fn start(&self) {
        *lock(&self.started) = Some(Instant::now());
        self.bytes.store(0, Ordering::Relaxed);
        self.transfers.store(0, Ordering::Relaxed);
    }

    fn record(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PerfData {
        let started = *lock(&self.started);
        let elapsed = started.map(|t| t.elapsed()).unwrap_or_default();
        PerfData {
            elapsed,
            bytes: self.bytes.load(Ordering::Relaxed),
            transfers: self.transfers.load(Ordering::Relaxed),
        }
    }
}

/// Poll-mode tuning.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollSettings {
    pub timeout: Duration,
    pub spin_iterations: u32,
}

/// One DMA engine.
pub struct Engine {
    direction: Direction,
    channel: u32,
    transfer_mode: TransferMode,
    completion_mode: CompletionMode,
    enabled: bool,
    address_mode: AtomicU32,
    interrupts_enabled: AtomicBool,
    pub(crate) hw: Arc<dyn EngineHw>,
    pub(crate) programmer: Arc<dyn DescriptorProgrammer>,
    pub(crate) poll: PollSettings,
    /// Mirrors the state of `inflight` for lock-free observation.
    state: AtomicU8,
    pub(crate) inflight: Mutex<Option<Transaction>>,
    next_id: AtomicU64,
    perf: PerfCounters,
    ring: Mutex<Option<Arc<RingBuffer>>>,
    ring_capacity: usize,
}

impl Engine {
    /// Create an engine from its attach-time descriptor.
    pub fn new(
        desc: EngineDescriptor,
        programmer: Arc<dyn DescriptorProgrammer>,
        config: &DeviceConfig,
    ) -> Self {
        Self {
            direction: desc.direction,
            channel: desc.channel,
            transfer_mode: desc.transfer_mode,
            completion_mode: desc.completion_mode,
            enabled: desc.enabled,
            address_mode: AtomicU32::new(AddressMode::Incrementing.as_u32()),
            interrupts_enabled: AtomicBool::new(false),
            hw: desc.hw,
            programmer,
            poll: PollSettings {
                timeout: config.poll_timeout,
                spin_iterations: config.poll_spin_iterations,
            },
            state: AtomicU8::new(TransactionState::Idle as u8),
            inflight: Mutex::new(None),
            next_id: AtomicU64::new(1),
            perf: PerfCounters::default(),
            ring: Mutex::new(None),
            ring_capacity: config.ring_capacity,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.transfer_mode
    }

    pub fn completion_mode(&self) -> CompletionMode {
        self.completion_mode
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Name in the `h2c_0` style used by device nodes and log lines.
    pub fn name(&self) -> String {
        format!("{}_{}", self.direction, self.channel)
    }

    /// Current transaction state. `Idle` when nothing is bound.
    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Enable interrupts in Interrupt mode, disable them in Poll mode.
    pub fn configure_interrupts(&self) {
        let enable = self.completion_mode == CompletionMode::Interrupt;
        log::trace!("{} poll mode: {}", self.name(), !enable);
        self.set_interrupts(enable);
    }

    pub fn set_interrupts(&self, enabled: bool) {
        self.hw.set_interrupts(enabled);
        self.interrupts_enabled.store(enabled, Ordering::Release);
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::Acquire)
    }

    pub fn address_mode(&self) -> AddressMode {
        AddressMode::from(self.address_mode.load(Ordering::Acquire))
    }

    pub fn set_address_mode(&self, mode: AddressMode) {
        self.hw.set_address_mode(mode);
        self.address_mode.store(mode.as_u32(), Ordering::Release);
        log::debug!("{} address mode {:?}", self.name(), mode);
    }

    pub fn start_perf(&self) {
        self.perf.start();
    }

    pub fn perf(&self) -> PerfData {
        self.perf.snapshot()
    }

    pub(crate) fn record_transfer(&self, bytes: usize) {
        self.perf.record(bytes);
    }

    /// Allocate the streaming ring for a C2H streaming engine.
    ///
    /// Reuses the existing ring if one is already attached.
    pub fn setup_ring(&self) -> AdmaResult<Arc<RingBuffer>> {
        if self.transfer_mode != TransferMode::Streaming || self.direction != Direction::C2H {
            return Err(AdmaError::InvalidParameter(format!(
                "{} is not a C2H streaming engine",
                self.name()
            )));
        }
        let mut slot = lock(&self.ring);
        let ring = slot
            .get_or_insert_with(|| {
                log::debug!("{} ring setup, {} bytes", self.name(), self.ring_capacity);
                Arc::new(RingBuffer::new(self.ring_capacity))
            })
            .clone();
        Ok(ring)
    }

    /// Detach and close the streaming ring, releasing blocked readers.
    pub fn teardown_ring(&self) {
        let ring = lock(&self.ring).take();
        if let Some(ring) = ring {
            ring.close();
            log::debug!("{} ring teardown", self.name());
        }
    }

    pub fn ring(&self) -> Option<Arc<RingBuffer>> {
        lock(&self.ring).clone()
    }

    /// Producer side of streaming: append freshly transferred bytes.
    ///
    /// Called from the completion context. Never blocks on readers.
    pub fn on_stream_data(&self, data: &[u8]) -> AdmaResult<()> {
        let ring = self.ring().ok_or_else(|| {
            AdmaError::InvalidParameter(format!("{} has no streaming ring", self.name()))
        })?;
        match ring.push(data) {
            Ok(()) => {
                self.record_transfer(data.len());
                Ok(())
            }
            Err(e) => {
                log::error!("{} stream append failed: {}", self.name(), e);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name())
            .field("transfer_mode", &self.transfer_mode)
            .field("completion_mode", &self.completion_mode)
            .field("enabled", &self.enabled)
            .field("state", &self.state())
            .finish()
    }
}
