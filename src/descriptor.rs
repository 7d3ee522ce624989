// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! ADMA scatter-gather descriptor structures and chain construction.
//!
//! The descriptor layout matches the engine's 32-byte SGDMA descriptor:
//! a control word carrying the magic and flags, the byte count, and the
//! source, destination and next-descriptor bus addresses.

use crate::config::DeviceConfig;
use crate::engine::{AddressMode, Direction};
use crate::error::Failure;
use bitflags::bitflags;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Magic value in bits [31:16] of the control word.
pub const DESC_MAGIC: u32 = 0xAD4B;

bitflags! {
    /// Descriptor control flags (bits [7:0] of the control word).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescriptorControl: u32 {
        /// Stop the engine after this descriptor.
        const STOP = 1 << 0;
        /// Report completion (and interrupt if enabled) for this descriptor.
        const COMPLETED = 1 << 1;
        /// End of packet, streaming mode only.
        const EOP = 1 << 4;
    }
}

/// 32-byte ADMA hardware descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(32))]
pub struct AdmaDesc {
    /// Magic (bits [31:16]), adjacent count (bits [13:8]), flags (bits [7:0]).
    pub control: u32,

    /// Transfer size in bytes.
    pub bytes: u32,

    /// Source bus address.
    pub src_addr: u64,

    /// Destination bus address.
    pub dst_addr: u64,

    /// Next descriptor bus address, 0 for the last descriptor.
    pub next_addr: u64,
}

impl AdmaDesc {
    /// Create a descriptor with only the magic set.
    #[inline]
    pub const fn new() -> Self {
        Self {
            control: DESC_MAGIC << 16,
            bytes: 0,
            src_addr: 0,
            dst_addr: 0,
            next_addr: 0,
        }
    }

    /// Add control flags (OR with existing).
    #[inline]
    pub fn add_flags(&mut self, flags: DescriptorControl) {
        self.control |= flags.bits() & 0xFF;
    }

    #[inline]
    pub fn flags(&self) -> DescriptorControl {
        DescriptorControl::from_bits_truncate(self.control & 0xFF)
    }

    /// Number of contiguous descriptors following this one (max 63).
    #[inline]
    pub fn set_adjacent(&mut self, adjacent: u32) {
        self.control = (self.control & !0x3F00) | ((adjacent.min(0x3F)) << 8);
    }

    #[inline]
    pub fn magic(&self) -> u32 {
        self.control >> 16
    }
}

impl Default for AdmaDesc {
    fn default() -> Self {
        Self::new()
    }
}

/// A built descriptor chain, owned by the transaction while it executes.
#[derive(Debug, Clone, Default)]
pub struct DescriptorChain {
    descs: Vec<AdmaDesc>,
    total_bytes: usize,
}

impl DescriptorChain {
    pub fn descriptors(&self) -> &[AdmaDesc] {
        &self.descs
    }

    #[cfg(test)]
    pub(crate) fn descriptors_mut(&mut self) -> &mut [AdmaDesc] {
        &mut self.descs
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

/// What the descriptor builder needs to know about a transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest {
    pub direction: Direction,
    /// Host bus address of the request buffer.
    pub host_addr: usize,
    pub len: usize,
    /// Card-side start address.
    pub card_addr: u64,
    pub address_mode: AddressMode,
}

/// Translates a transfer into a hardware descriptor chain.
pub trait DescriptorProgrammer: Send + Sync {
    fn program(&self, request: &TransferRequest) -> Result<DescriptorChain, Failure>;

    /// Return a chain once the engine no longer reads it, either because it
    /// never started or because its transaction reached a terminal state.
    fn release(&self, chain: DescriptorChain) {
        drop(chain);
    }
}

/// Default programmer: splits the buffer into descriptors of at most
/// `max_desc_bytes` each and links them.
#[derive(Debug)]
pub struct SgProgrammer {
    max_desc_bytes: usize,
    ring_capacity: usize,
    alignment: usize,
    /// Descriptors handed out and not yet released.
    outstanding: AtomicUsize,
}

impl SgProgrammer {
    /// `max_desc_bytes` is clamped to what the 32-bit length field holds.
    pub fn new(max_desc_bytes: usize, ring_capacity: usize, alignment: usize) -> Self {
        let max_len = usize::try_from(u32::MAX).unwrap_or(usize::MAX);
        Self {
            max_desc_bytes: max_desc_bytes.clamp(1, max_len),
            ring_capacity,
            alignment: alignment.max(1),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Descriptors built and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(
            config.max_desc_bytes,
            config.descriptor_ring_capacity,
            config.buffer_alignment,
        )
    }
}

impl DescriptorProgrammer for SgProgrammer {
    fn program(&self, request: &TransferRequest) -> Result<DescriptorChain, Failure> {
        if request.host_addr % self.alignment != 0 {
            return Err(Failure::Misaligned {
                addr: request.host_addr,
                alignment: self.alignment,
            });
        }

        let needed = request.len.div_ceil(self.max_desc_bytes);
        if needed > self.ring_capacity {
            return Err(Failure::DescriptorOverflow {
                needed,
                capacity: self.ring_capacity,
            });
        }
        let overflow = Failure::CardAddressOverflow {
            addr: request.card_addr,
            len: request.len,
        };
        let span = u64::try_from(request.len).map_err(|_| overflow)?;
        request.card_addr.checked_add(span).ok_or(overflow)?;

        let mut descs = Vec::with_capacity(needed);
        let mut offset = 0usize;
        while offset < request.len {
            let chunk = (request.len - offset).min(self.max_desc_bytes);
            let host = (request.host_addr + offset) as u64;
            // In range: the whole span was checked above.
            let card = match request.address_mode {
                AddressMode::Incrementing => request.card_addr + offset as u64,
                AddressMode::Fixed => request.card_addr,
            };
            let mut desc = AdmaDesc::new();
            desc.bytes = u32::try_from(chunk).map_err(|_| overflow)?;
            (desc.src_addr, desc.dst_addr) = match request.direction {
                Direction::H2C => (host, card),
                Direction::C2H => (card, host),
            };
            descs.push(desc);
            offset += chunk;
        }

        // Link by index; the engine layer rebases onto the ring's bus address.
        let count = descs.len();
        for (i, desc) in descs.iter_mut().enumerate() {
            let remaining = (count - i - 1) as u32;
            desc.set_adjacent(remaining);
            if remaining == 0 {
                desc.add_flags(DescriptorControl::STOP | DescriptorControl::COMPLETED);
            } else {
                desc.next_addr = ((i + 1) * std::mem::size_of::<AdmaDesc>()) as u64;
            }
        }

        self.outstanding.fetch_add(descs.len(), Ordering::AcqRel);
        Ok(DescriptorChain {
            descs,
            total_bytes: request.len,
        })
    }

    fn release(&self, chain: DescriptorChain) {
        self.outstanding.fetch_sub(chain.len(), Ordering::AcqRel);
        log::trace!("released {} descriptors", chain.len());
    }
}

const _: () = assert!(std::mem::size_of::<AdmaDesc>() == 32);
const _: () = assert!(std::mem::align_of::<AdmaDesc>() == 32);
