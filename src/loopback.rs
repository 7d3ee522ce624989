// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Software loopback engine.
//!
//! Walks the descriptor chain in software against a block of simulated card
//! memory, so the full request path can run without ADMA hardware. H2C
//! descriptors copy host to card, C2H descriptors copy card to host. When
//! interrupts are enabled the completion interrupt is delivered from a
//! separate thread, as real hardware would deliver it outside the
//! submitting context.

use crate::descriptor::DescriptorChain;
use crate::engine::{
    AddressMode, Direction, EngineHw, EngineStatus, InterruptHandler, StatusFlags,
};
use crate::error::Failure;
use crate::lock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Simulated card memory, shared by the engines of one channel.
pub type CardMemory = Arc<Mutex<Vec<u8>>>;

struct LoopbackState {
    status: EngineStatus,
    /// Bytes of the last started chain, reported when a stall is released.
    pending_bytes: usize,
    injected: StatusFlags,
    stalled: bool,
    interrupts: bool,
    address_mode: AddressMode,
    handler: Option<InterruptHandler>,
}

/// Software stand-in for one engine's registers.
pub struct LoopbackEngine {
    direction: Direction,
    memory: CardMemory,
    state: Mutex<LoopbackState>,
    stops: AtomicUsize,
}

impl LoopbackEngine {
    /// Create a loopback engine backed by `memory_size` bytes of card memory.
    pub fn new(direction: Direction, memory_size: usize) -> Self {
        Self::with_memory(direction, Arc::new(Mutex::new(vec![0; memory_size])))
    }

    /// H2C and C2H engines over the same card memory, so data written by
    /// one can be read back by the other.
    pub fn pair(memory_size: usize) -> (Self, Self) {
        let memory: CardMemory = Arc::new(Mutex::new(vec![0; memory_size]));
        (
            Self::with_memory(Direction::H2C, memory.clone()),
            Self::with_memory(Direction::C2H, memory),
        )
    }

    pub fn with_memory(direction: Direction, memory: CardMemory) -> Self {
        Self {
            direction,
            memory,
            state: Mutex::new(LoopbackState {
                status: EngineStatus {
                    flags: StatusFlags::empty(),
                    completed_bytes: 0,
                },
                pending_bytes: 0,
                injected: StatusFlags::empty(),
                stalled: false,
                interrupts: false,
                address_mode: AddressMode::Incrementing,
                handler: None,
            }),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Report `flags` (plus stopped) for the next started chain.
    pub fn inject_error(&self, flags: StatusFlags) {
        lock(&self.state).injected = flags;
    }

    /// While stalled the engine stays busy. Releasing a stall completes the
    /// last chain and raises the interrupt if enabled.
    pub fn set_stalled(&self, stalled: bool) {
        let handler = {
            let mut state = lock(&self.state);
            let was_stalled = state.stalled;
            state.stalled = stalled;
            if was_stalled && !stalled && state.status.flags.contains(StatusFlags::BUSY) {
                state.status = EngineStatus {
                    flags: StatusFlags::DESC_STOPPED | StatusFlags::DESC_COMPLETED,
                    completed_bytes: state.pending_bytes,
                };
                state.handler.clone().filter(|_| state.interrupts)
            } else {
                None
            }
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::Acquire)
    }

    pub fn interrupts_enabled(&self) -> bool {
        lock(&self.state).interrupts
    }

    pub fn address_mode(&self) -> AddressMode {
        lock(&self.state).address_mode
    }

    /// Copy into simulated card memory. Out-of-range bytes are dropped.
    pub fn write_device_memory(&self, offset: usize, data: &[u8]) {
        let mut memory = lock(&self.memory);
        let end = (offset + data.len()).min(memory.len());
        if offset < end {
            memory[offset..end].copy_from_slice(&data[..end - offset]);
        }
    }

    /// Copy out of simulated card memory.
    pub fn read_device_memory(&self, offset: usize, len: usize) -> Vec<u8> {
        let memory = lock(&self.memory);
        let end = (offset + len).min(memory.len());
        memory.get(offset..end).map(<[u8]>::to_vec).unwrap_or_default()
    }

    /// Execute the chain. Returns the bytes moved or the error bits.
    fn walk(&self, chain: &DescriptorChain, buffer: &mut [u8]) -> Result<usize, StatusFlags> {
        let base = buffer.as_ptr() as u64;
        let mut memory = lock(&self.memory);
        let mut moved = 0usize;
        for desc in chain.descriptors() {
            let len = desc.bytes as usize;
            let (host, card) = match self.direction {
                Direction::H2C => (desc.src_addr, desc.dst_addr),
                Direction::C2H => (desc.dst_addr, desc.src_addr),
            };
            let host = host
                .checked_sub(base)
                .and_then(|h| usize::try_from(h).ok())
                .ok_or(StatusFlags::READ_ERROR)?;
            let host_end = host
                .checked_add(len)
                .filter(|&end| end <= buffer.len())
                .ok_or(StatusFlags::READ_ERROR)?;
            let card = usize::try_from(card).map_err(|_| StatusFlags::DESC_ERROR)?;
            let card_end = card
                .checked_add(len)
                .filter(|&end| end <= memory.len())
                .ok_or(StatusFlags::DESC_ERROR)?;
            match self.direction {
                Direction::H2C => memory[card..card_end].copy_from_slice(&buffer[host..host_end]),
                Direction::C2H => buffer[host..host_end].copy_from_slice(&memory[card..card_end]),
            }
            moved += len;
        }
        Ok(moved)
    }
}

impl EngineHw for LoopbackEngine {
    fn start(&self, chain: &DescriptorChain, buffer: &mut [u8]) -> Result<(), Failure> {
        if chain.is_empty() {
            return Err(Failure::StartFailed);
        }
        let result = self.walk(chain, buffer);

        let handler = {
            let mut state = lock(&self.state);
            let injected = std::mem::replace(&mut state.injected, StatusFlags::empty());
            state.pending_bytes = chain.total_bytes();
            state.status = match result {
                Err(bits) => EngineStatus {
                    flags: bits | StatusFlags::DESC_STOPPED,
                    completed_bytes: 0,
                },
                Ok(moved) if !injected.is_empty() => EngineStatus {
                    flags: injected | StatusFlags::DESC_STOPPED,
                    completed_bytes: moved,
                },
                Ok(_) if state.stalled => EngineStatus {
                    flags: StatusFlags::BUSY,
                    completed_bytes: 0,
                },
                Ok(moved) => EngineStatus {
                    flags: StatusFlags::DESC_STOPPED | StatusFlags::DESC_COMPLETED,
                    completed_bytes: moved,
                },
            };
            let busy = state.status.flags.contains(StatusFlags::BUSY);
            state.handler.clone().filter(|_| state.interrupts && !busy)
        };

        if let Some(handler) = handler {
            std::thread::spawn(move || handler());
        }
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::AcqRel);
        let mut state = lock(&self.state);
        state.status = EngineStatus {
            flags: StatusFlags::empty(),
            completed_bytes: 0,
        };
    }

    fn status(&self) -> EngineStatus {
        lock(&self.state).status
    }

    fn set_interrupts(&self, enabled: bool) {
        lock(&self.state).interrupts = enabled;
    }

    fn set_address_mode(&self, mode: AddressMode) {
        lock(&self.state).address_mode = mode;
    }

    fn bind_interrupt(&self, handler: InterruptHandler) {
        lock(&self.state).handler = Some(handler);
    }
}
