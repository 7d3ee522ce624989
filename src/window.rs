// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Register windows (PCI BARs).
//!
//! A register window is a fixed-size memory-mapped region. Accesses are
//! validated against the window before any byte is touched. Concurrent
//! accesses to overlapping ranges from different handles are not
//! synchronized; ordering them is the caller's business.
//!
//! # Platform Support
//!
//! [`MappedWindow`] maps a sysfs BAR resource file (for example
//! `/sys/bus/pci/devices/0000:01:00.0/resource0`) and is Linux only.
//! [`MemoryWindow`] is a heap-backed window available everywhere.

use crate::error::{AdmaError, AdmaResult};
use crate::lock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[cfg(target_os = "linux")]
use std::fs::File;
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;
#[cfg(target_os = "linux")]
use std::path::Path;

/// Byte-addressable register window.
///
/// `read` and `write` are only called with ranges that passed
/// [`validate_access`].
pub trait RegisterWindow: Send + Sync {
    /// Window length in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, offset: usize, dst: &mut [u8]);

    fn write(&self, offset: usize, src: &[u8]);
}

/// Check a BAR access before touching the window.
///
/// The end of the access must lie strictly inside the BAR, so the last byte
/// of a BAR is never addressable through this path.
pub fn validate_access(
    bar: usize,
    num_bars: usize,
    bar_len: usize,
    offset: usize,
    length: usize,
) -> AdmaResult<()> {
    if length == 0 {
        log::error!("attempting to access 0 bytes");
        return Err(AdmaError::InvalidParameter(
            "zero-length BAR access".to_string(),
        ));
    }
    if bar >= num_bars {
        log::error!("attempting to access BAR {} but only {} exist", bar, num_bars);
        return Err(AdmaError::InvalidParameter(format!(
            "BAR {} out of range ({} BARs)",
            bar, num_bars
        )));
    }
    match offset.checked_add(length) {
        Some(end) if end < bar_len => Ok(()),
        _ => {
            log::error!(
                "attempting to access BAR {} offset={} size={}",
                bar,
                offset,
                length
            );
            Err(AdmaError::InvalidParameter(format!(
                "BAR {} access {}+{} exceeds length {}",
                bar, offset, length, bar_len
            )))
        }
    }
}

/// Heap-backed register window.
pub struct MemoryWindow {
    data: Mutex<Box<[u8]>>,
    accesses: AtomicUsize,
}

impl MemoryWindow {
    pub fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0; len].into_boxed_slice()),
            accesses: AtomicUsize::new(0),
        }
    }

    /// Number of reads and writes performed.
    pub fn access_count(&self) -> usize {
        self.accesses.load(Ordering::Acquire)
    }
}

impl RegisterWindow for MemoryWindow {
    fn len(&self) -> usize {
        lock(&self.data).len()
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        self.accesses.fetch_add(1, Ordering::AcqRel);
        let data = lock(&self.data);
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }

    fn write(&self, offset: usize, src: &[u8]) {
        self.accesses.fetch_add(1, Ordering::AcqRel);
        let mut data = lock(&self.data);
        data[offset..offset + src.len()].copy_from_slice(src);
    }
}

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;

    /// A BAR resource file mapped into this process.
    pub struct MappedWindow {
        /// Kept open for the lifetime of the mapping.
        #[allow(dead_code)]
        file: File,
        base: *mut u8,
        len: usize,
    }

    // SAFETY: MappedWindow can be sent between threads because:
    // - The file descriptor is owned and valid
    // - The mapping is valid until drop and never remapped
    unsafe impl Send for MappedWindow {}

    // SAFETY: all access goes through volatile reads/writes of validated
    // ranges; overlapping concurrent access is documented as unsynchronized.
    unsafe impl Sync for MappedWindow {}

    impl MappedWindow {
        /// Map a BAR resource file read/write.
        ///
        /// # Errors
        ///
        /// Returns an error if the file cannot be opened, is empty, or the
        /// mapping fails.
        pub fn open(path: &Path) -> Result<Self, AdmaError> {
            let file = File::options()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::PermissionDenied {
                        AdmaError::PermissionDenied(path.display().to_string())
                    } else {
                        AdmaError::Io(e)
                    }
                })?;
            let len = usize::try_from(file.metadata()?.len()).map_err(|_| {
                AdmaError::MmapFailed(format!("{} too large to map", path.display()))
            })?;
            if len == 0 {
                return Err(AdmaError::MmapFailed(format!(
                    "{} has zero length",
                    path.display()
                )));
            }

            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return Err(AdmaError::MmapFailed(format!(
                    "mmap failed for {}",
                    path.display()
                )));
            }
            log::info!("mapped {} ({} bytes)", path.display(), len);

            Ok(Self {
                file,
                base: base as *mut u8,
                len,
            })
        }
    }

    /// Access width: 32-bit when offset and length allow, else 16, else 8.
    fn width(offset: usize, len: usize) -> usize {
        if (offset | len) % 4 == 0 {
            4
        } else if (offset | len) % 2 == 0 {
            2
        } else {
            1
        }
    }

    impl RegisterWindow for MappedWindow {
        fn len(&self) -> usize {
            self.len
        }

        fn read(&self, offset: usize, dst: &mut [u8]) {
            let step = width(offset, dst.len());
            for (i, chunk) in dst.chunks_exact_mut(step).enumerate() {
                // SAFETY: offset + len was validated against the mapping and
                // the address is aligned to `step`.
                unsafe {
                    let addr = self.base.add(offset + i * step);
                    match step {
                        4 => chunk.copy_from_slice(
                            &std::ptr::read_volatile(addr as *const u32).to_ne_bytes(),
                        ),
                        2 => chunk.copy_from_slice(
                            &std::ptr::read_volatile(addr as *const u16).to_ne_bytes(),
                        ),
                        _ => chunk[0] = std::ptr::read_volatile(addr),
                    }
                }
            }
        }

        fn write(&self, offset: usize, src: &[u8]) {
            let step = width(offset, src.len());
            for (i, chunk) in src.chunks_exact(step).enumerate() {
                // SAFETY: as in `read`.
                unsafe {
                    let addr = self.base.add(offset + i * step);
                    match step {
                        4 => std::ptr::write_volatile(
                            addr as *mut u32,
                            u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                        ),
                        2 => std::ptr::write_volatile(
                            addr as *mut u16,
                            u16::from_ne_bytes([chunk[0], chunk[1]]),
                        ),
                        _ => std::ptr::write_volatile(addr, chunk[0]),
                    }
                }
            }
        }
    }

    impl Drop for MappedWindow {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            }
        }
    }

}

#[cfg(target_os = "linux")]
pub use linux_impl::MappedWindow;
