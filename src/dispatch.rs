// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Per-handle request dispatch.
//!
//! Every open handle carries exactly one [`NodeBinding`], chosen at open
//! time. Reads and writes are routed by matching on it:
//!
//! | Binding  | Path                                                  |
//! |----------|-------------------------------------------------------|
//! | `Window` | bounds-checked register copy in the calling thread    |
//! | `Dma`    | queued on the engine's serial queue                   |
//! | `Stream` | drained from the engine's streaming ring              |
//! | `Event`  | blocking wait on the event slot                       |

use crate::config::DeviceConfig;
use crate::device::NodeType;
use crate::engine::{Direction, Engine};
use crate::error::{AdmaError, AdmaResult};
use crate::event::EventSlot;
use crate::ioctl::{ControlRequest, ControlResponse};
use crate::lock;
use crate::queue::{EngineQueue, IoRequest};
use crate::ring::{RingBuffer, RingStatus};
use crate::transaction::DmaBuffer;
use crate::window::{validate_access, RegisterWindow};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// What a handle is bound to.
#[derive(Clone)]
pub enum NodeBinding {
    Window {
        bar: usize,
        window: Arc<dyn RegisterWindow>,
    },
    Dma {
        engine: Arc<Engine>,
        queue: Arc<EngineQueue>,
    },
    Stream {
        engine: Arc<Engine>,
        ring: Arc<RingBuffer>,
    },
    Event(Arc<EventSlot>),
}

impl std::fmt::Debug for NodeBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Window { bar, window } => f
                .debug_struct("Window")
                .field("bar", bar)
                .field("len", &window.len())
                .finish(),
            Self::Dma { engine, .. } => f.debug_tuple("Dma").field(&engine.name()).finish(),
            Self::Stream { engine, .. } => f.debug_tuple("Stream").field(&engine.name()).finish(),
            Self::Event(slot) => f.debug_tuple("Event").field(&slot.index()).finish(),
        }
    }
}

/// An open device node.
#[derive(Debug)]
pub struct FileHandle {
    name: String,
    node: NodeType,
    binding: NodeBinding,
    num_bars: usize,
    event_timeout: Duration,
    ring_timeout: Duration,
    /// DMA requests submitted through this handle and not yet known done.
    outstanding: Mutex<Vec<IoRequest>>,
}

impl FileHandle {
    pub(crate) fn new(
        name: &str,
        node: NodeType,
        binding: NodeBinding,
        num_bars: usize,
        config: &DeviceConfig,
    ) -> Self {
        Self {
            name: name.to_string(),
            node,
            binding,
            num_bars,
            event_timeout: config.event_timeout,
            ring_timeout: config.ring_timeout,
            outstanding: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_type(&self) -> NodeType {
        self.node
    }

    pub fn binding(&self) -> &NodeBinding {
        &self.binding
    }

    /// The engine behind a DMA or streaming handle.
    pub fn engine(&self) -> Option<&Arc<Engine>> {
        match &self.binding {
            NodeBinding::Dma { engine, .. } | NodeBinding::Stream { engine, .. } => Some(engine),
            _ => None,
        }
    }

    /// Read `dst.len()` bytes at `offset`.
    ///
    /// Returns the bytes transferred: exact for register windows, what the
    /// hardware reported for DMA, what was available for streaming, and 1
    /// for events (`dst[0]` is 1 if the event fired, 0 on timeout).
    ///
    /// # Errors
    ///
    /// `InvalidDeviceRequest` on a write-only node. A streaming read that
    /// times out with nothing copied returns `Timeout`.
    pub fn read(&self, dst: &mut [u8], offset: u64) -> AdmaResult<usize> {
        match &self.binding {
            NodeBinding::Window { bar, window } => {
                let offset = self.window_offset(offset)?;
                validate_access(*bar, self.num_bars, window.len(), offset, dst.len())?;
                window.read(offset, dst);
                log::trace!("{}: read {} bytes at {}", self.name, dst.len(), offset);
                Ok(dst.len())
            }
            NodeBinding::Dma { .. } => {
                let request = self.submit_read(dst.len(), offset)?;
                let result = self.finish_blocking(&request);
                let bytes = result?.min(dst.len());
                let data = request.buffer().to_vec();
                dst[..bytes].copy_from_slice(&data[..bytes]);
                Ok(bytes)
            }
            NodeBinding::Stream { engine, ring } => {
                log::info!("{} requesting {} bytes from ring buffer", engine.name(), dst.len());
                let read = ring.copy_bytes_to_memory(dst, self.ring_timeout)?;
                match read.status {
                    RingStatus::Success => Ok(read.copied),
                    RingStatus::Timeout => Err(AdmaError::Timeout),
                }
            }
            NodeBinding::Event(slot) => slot.read(dst, self.event_timeout),
        }
    }

    /// Write `src` at `offset`. Returns the bytes transferred.
    ///
    /// # Errors
    ///
    /// `InvalidDeviceRequest` on read-only nodes (C2H, streaming, events).
    pub fn write(&self, src: &[u8], offset: u64) -> AdmaResult<usize> {
        match &self.binding {
            NodeBinding::Window { bar, window } => {
                let offset = self.window_offset(offset)?;
                validate_access(*bar, self.num_bars, window.len(), offset, src.len())?;
                window.write(offset, src);
                log::trace!("{}: wrote {} bytes at {}", self.name, src.len(), offset);
                Ok(src.len())
            }
            NodeBinding::Dma { .. } => {
                let request = self.submit_write(src.to_vec(), offset)?;
                self.finish_blocking(&request)
            }
            NodeBinding::Stream { .. } | NodeBinding::Event(_) => Err(self.wrong_direction("write")),
        }
    }

    /// Queue a C2H transfer of `len` bytes from card address `offset`.
    pub fn submit_read(&self, len: usize, offset: u64) -> AdmaResult<IoRequest> {
        self.submit(Direction::C2H, DmaBuffer::new(len), offset)
    }

    /// Queue an H2C transfer of `data` to card address `offset`.
    pub fn submit_write(&self, data: Vec<u8>, offset: u64) -> AdmaResult<IoRequest> {
        self.submit(Direction::H2C, DmaBuffer::from_vec(data), offset)
    }

    fn submit(&self, direction: Direction, buffer: DmaBuffer, offset: u64) -> AdmaResult<IoRequest> {
        let NodeBinding::Dma { engine, queue } = &self.binding else {
            return Err(self.wrong_direction(direction.as_str()));
        };
        if engine.direction() != direction {
            return Err(self.wrong_direction(direction.as_str()));
        }
        let request = queue.submit(direction, offset, buffer)?;
        let mut outstanding = lock(&self.outstanding);
        outstanding.retain(|r| !r.is_done());
        outstanding.push(request.clone());
        Ok(request)
    }

    fn finish_blocking(&self, request: &IoRequest) -> AdmaResult<usize> {
        let result = request.wait();
        lock(&self.outstanding).retain(|r| r.id() != request.id());
        if let Err(e) = &result {
            log::error!("{}: request {} failed: {}", self.name, request.id(), e);
        }
        result
    }

    /// Out-of-band engine control.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` on handles without an engine.
    pub fn control(&self, request: ControlRequest) -> AdmaResult<ControlResponse> {
        let engine = self.dma_engine()?;
        log::info!("{}: {}", engine.name(), request.code());
        Ok(match request {
            ControlRequest::PerfStart => {
                engine.start_perf();
                ControlResponse::Done
            }
            ControlRequest::PerfGet => ControlResponse::Perf(engine.perf()),
            ControlRequest::AddrModeGet => ControlResponse::AddrMode(engine.address_mode()),
            ControlRequest::AddrModeSet(mode) => {
                engine.set_address_mode(mode);
                ControlResponse::Done
            }
        })
    }

    /// Raw control entry point: decode `code` and `input`, run the request,
    /// encode the response into `output`. Returns the bytes written.
    ///
    /// # Errors
    ///
    /// `InvalidParameter` on handles without an engine (checked first),
    /// `Unsupported` for unknown codes.
    pub fn ioctl(&self, code: u32, input: &[u8], output: &mut [u8]) -> AdmaResult<usize> {
        self.dma_engine()?;
        let request = ControlRequest::decode(code, input).inspect_err(|e| {
            log::error!("{}: control request failed: {}", self.name, e);
        })?;
        self.control(request)?.encode(output)
    }

    /// Withdraw whatever this handle is blocked on: outstanding DMA
    /// requests, a ring read, or an event wait.
    pub fn cancel_io(&self) {
        match &self.binding {
            NodeBinding::Window { .. } => {}
            NodeBinding::Dma { .. } => {
                let requests = std::mem::take(&mut *lock(&self.outstanding));
                for request in requests {
                    request.cancel();
                }
            }
            NodeBinding::Stream { ring, .. } => ring.cancel_reader(),
            NodeBinding::Event(slot) => slot.cancel_wait(),
        }
    }

    /// Close the handle. Same as dropping it.
    pub fn close(self) {}

    fn dma_engine(&self) -> AdmaResult<&Arc<Engine>> {
        self.engine().ok_or_else(|| {
            log::error!("{}: control request on a non-DMA handle", self.name);
            AdmaError::InvalidParameter(format!("{} is not a DMA node", self.name))
        })
    }

    fn window_offset(&self, offset: u64) -> AdmaResult<usize> {
        usize::try_from(offset).map_err(|_| {
            AdmaError::InvalidParameter(format!("offset {} out of range", offset))
        })
    }

    fn wrong_direction(&self, op: &str) -> AdmaError {
        log::error!("{}: {} not supported on this node", self.name, op);
        AdmaError::InvalidDeviceRequest(format!("{} not supported on {}", op, self.name))
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        match &self.binding {
            NodeBinding::Stream { engine, .. } => engine.teardown_ring(),
            NodeBinding::Dma { .. } => {
                for request in lock(&self.outstanding).drain(..) {
                    request.cancel();
                }
            }
            _ => {}
        }
        log::info!("closed {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, LoopbackHardware};
    use crate::engine::{AddressMode, StatusFlags};
    use crate::error::Failure;
    use crate::ioctl::ControlCode;
    use crate::transaction::TransactionState;
    use std::thread;
    use std::time::Instant;

    fn device() -> (Device, LoopbackHardware) {
        let config = DeviceConfig::default()
            .with_event_timeout(Duration::from_millis(50))
            .with_ring_timeout(Duration::from_millis(50))
            .with_ring_capacity(256);
        Device::loopback(config).unwrap()
    }

    #[test]
    fn test_register_window_read_write() {
        let (device, hw) = device();
        let user = device.open("user").unwrap();
        assert_eq!(user.write(&[0xDE, 0xAD, 0xBE, 0xEF], 0x100).unwrap(), 4);
        let mut out = [0u8; 4];
        assert_eq!(user.read(&mut out, 0x100).unwrap(), 4);
        assert_eq!(out, [0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(hw.user.access_count(), 2);
        assert_eq!(hw.control.access_count(), 0);
    }

    #[test]
    fn test_register_window_rejects_without_access() {
        let (device, hw) = device();
        let control = device.open("control").unwrap();
        let len = hw.control.len() as u64;

        let mut out = [0u8; 4];
        assert!(matches!(
            control.read(&mut out, len - 4),
            Err(AdmaError::InvalidParameter(_))
        ));
        assert!(matches!(
            control.write(&[1, 2, 3, 4], len),
            Err(AdmaError::InvalidParameter(_))
        ));
        assert!(matches!(
            control.read(&mut [], 0),
            Err(AdmaError::InvalidParameter(_))
        ));
        assert!(matches!(
            control.read(&mut out, u64::MAX),
            Err(AdmaError::InvalidParameter(_))
        ));
        assert_eq!(hw.control.access_count(), 0);
    }

    #[test]
    fn test_dma_write_then_read() {
        let (device, _hw) = device();
        let h2c = device.open("h2c_0").unwrap();
        let c2h = device.open("c2h_0").unwrap();

        let data: Vec<u8> = (0..4096u32).map(|i| (i * 7) as u8).collect();
        assert_eq!(h2c.write(&data, 0x2000).unwrap(), 4096);

        let mut back = vec![0u8; 4096];
        assert_eq!(c2h.read(&mut back, 0x2000).unwrap(), 4096);
        assert_eq!(back, data);

        let engine = device.engine(Direction::H2C, 0).unwrap();
        assert_eq!(engine.state(), TransactionState::Idle);
    }

    #[test]
    fn test_dma_direction_mismatch() {
        let (device, hw) = device();
        let h2c = device.open("h2c_0").unwrap();
        let c2h = device.open("ac2h_0").unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            h2c.read(&mut buf, 0),
            Err(AdmaError::InvalidDeviceRequest(_))
        ));
        assert!(matches!(
            c2h.write(&buf, 0),
            Err(AdmaError::InvalidDeviceRequest(_))
        ));
        assert!(matches!(
            h2c.write(&[], 0),
            Err(AdmaError::InvalidDeviceRequest(_))
        ));
        assert_eq!(hw.h2c[0].stop_count(), 0);
        assert_eq!(device.engine(Direction::H2C, 0).unwrap().perf().transfers, 0);
    }

    #[test]
    fn test_poll_mode_engine_through_handle() {
        let (device, hw) = device();
        let h2c = device.open("h2c_1").unwrap();
        assert!(!hw.h2c[1].interrupts_enabled());
        assert_eq!(h2c.write(b"polled", 8).unwrap(), 6);
        assert_eq!(hw.h2c[1].read_device_memory(8, 6), b"polled");
    }

    #[test]
    fn test_dma_hardware_error_surfaces() {
        let (device, hw) = device();
        let h2c = device.open("h2c_0").unwrap();
        hw.h2c[0].inject_error(StatusFlags::MAGIC_STOPPED);
        let err = h2c.write(&[0u8; 64], 0).unwrap_err();
        assert!(matches!(
            err,
            AdmaError::HardwareFailure(Failure::Device { .. })
        ));
        assert_eq!(
            device.engine(Direction::H2C, 0).unwrap().state(),
            TransactionState::Idle
        );
        // Next request succeeds.
        assert_eq!(h2c.write(&[0u8; 64], 0).unwrap(), 64);
    }

    #[test]
    fn test_card_offset_past_address_space() {
        let (device, hw) = device();
        let h2c = device.open("h2c_0").unwrap();
        let c2h = device.open("c2h_0").unwrap();

        let request = h2c.submit_write(vec![1; 16], u64::MAX - 4).unwrap();
        assert!(matches!(
            request.wait_timeout(Duration::from_secs(5)),
            Err(AdmaError::HardwareFailure(Failure::CardAddressOverflow { .. }))
        ));
        let mut buf = [0u8; 16];
        assert!(matches!(
            c2h.read(&mut buf, u64::MAX),
            Err(AdmaError::HardwareFailure(Failure::CardAddressOverflow { .. }))
        ));

        let engine = device.engine(Direction::H2C, 0).unwrap();
        assert_eq!(engine.state(), TransactionState::Idle);
        assert_eq!(hw.h2c[0].stop_count(), 0);
        // Queue worker still serves the engine.
        assert_eq!(h2c.write(&[9; 16], 0).unwrap(), 16);
        assert_eq!(hw.h2c[0].read_device_memory(0, 16), vec![9; 16]);
    }

    #[test]
    fn test_card_range_beyond_card_memory() {
        let (device, hw) = device();
        let h2c = device.open("h2c_0").unwrap();
        let end = 1024 * 1024u64;
        let err = h2c.write(&[3; 32], end - 16).unwrap_err();
        match err {
            AdmaError::HardwareFailure(Failure::Device { status, .. }) => {
                assert!(status.contains(StatusFlags::DESC_ERROR))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h2c.write(&[3; 16], end - 16).unwrap(), 16);
        assert_eq!(hw.h2c[0].read_device_memory(1024 * 1024 - 16, 16), vec![3; 16]);
    }

    #[test]
    fn test_cancel_io_on_dma_handle() {
        let (device, hw) = device();
        let h2c = device.open("h2c_0").unwrap();
        hw.h2c[0].set_stalled(true);
        let request = h2c.submit_write(vec![5; 32], 0).unwrap();
        let queued = h2c.submit_write(vec![6; 32], 0).unwrap();
        let engine = device.engine(Direction::H2C, 0).unwrap();
        while engine.state() != TransactionState::Executing {
            thread::yield_now();
        }
        h2c.cancel_io();
        assert!(matches!(request.wait(), Err(AdmaError::Cancelled)));
        assert!(matches!(queued.wait(), Err(AdmaError::Cancelled)));
        assert!(hw.h2c[0].stop_count() >= 1);
        assert_eq!(engine.perf().transfers, 0);
    }

    #[test]
    fn test_streaming_read_in_order() {
        let (device, _hw) = device();
        let stream = device.open("c2h_1").unwrap();
        assert!(matches!(stream.binding(), NodeBinding::Stream { .. }));

        device.stream_completion(1, b"hello ").unwrap();
        device.stream_completion(1, b"stream").unwrap();

        let mut out = [0u8; 4];
        let mut collected = Vec::new();
        while collected.len() < 12 {
            let n = stream.read(&mut out, 0).unwrap();
            collected.extend_from_slice(&out[..n]);
        }
        assert_eq!(collected, b"hello stream");
        assert_eq!(device.engine(Direction::C2H, 1).unwrap().perf().bytes, 12);
    }

    #[test]
    fn test_streaming_timeout_and_overrun() {
        let (device, _hw) = device();
        let stream = device.open("c2h_1").unwrap();

        let start = Instant::now();
        let mut out = [0u8; 8];
        assert!(matches!(stream.read(&mut out, 0), Err(AdmaError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(50));

        device.stream_completion(1, &[1u8; 200]).unwrap();
        assert!(matches!(
            device.stream_completion(1, &[2u8; 100]),
            Err(AdmaError::RingOverrun { requested: 100, available: 56 })
        ));
        assert!(matches!(
            stream.write(&[0u8; 4], 0),
            Err(AdmaError::InvalidDeviceRequest(_))
        ));
    }

    #[test]
    fn test_closing_stream_releases_reader() {
        let config = DeviceConfig::default().with_ring_timeout(Duration::from_secs(30));
        let (device, _hw) = Device::loopback(config).unwrap();
        let reader_handle = device.open("c2h_1").unwrap();
        let closer = device.open("c2h_1").unwrap();
        let engine = device.engine(Direction::C2H, 1).unwrap();

        let reader = thread::spawn(move || {
            let mut out = [0u8; 16];
            reader_handle.read(&mut out, 0)
        });
        // Closed before or during the read, the reader sees Cancelled.
        thread::sleep(Duration::from_millis(20));
        closer.close();
        assert!(matches!(reader.join().unwrap(), Err(AdmaError::Cancelled)));
        assert!(engine.ring().is_none());
    }

    #[test]
    fn test_event_read() {
        let (device, _hw) = device();
        let event = Arc::new(device.open("event_4").unwrap());

        let mut out = [0xFFu8; 1];
        assert_eq!(event.read(&mut out, 0).unwrap(), 1);
        assert_eq!(out[0], 0);

        let slot = device.event(4).unwrap();
        let reader = {
            let event = event.clone();
            thread::spawn(move || {
                let mut out = [0u8; 1];
                event.read(&mut out, 0).map(|_| out[0])
            })
        };
        // Keep pulsing until the waiter has observed one.
        while !reader.is_finished() {
            device.signal_user_event(4).unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(reader.join().unwrap().unwrap(), 1);
        assert!(slot.last_value());

        assert!(matches!(
            event.read(&mut [0u8; 2], 0),
            Err(AdmaError::InvalidParameter(_))
        ));
        assert!(matches!(
            event.write(&[1], 0),
            Err(AdmaError::InvalidDeviceRequest(_))
        ));
    }

    #[test]
    fn test_cancel_io_on_event_handle() {
        let config = DeviceConfig::default().with_event_timeout(Duration::from_secs(30));
        let (device, _hw) = Device::loopback(config).unwrap();
        let event = Arc::new(device.open("event_0").unwrap());
        let reader = {
            let event = event.clone();
            thread::spawn(move || event.read(&mut [0u8; 1], 0))
        };
        while !reader.is_finished() {
            event.cancel_io();
            thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(reader.join().unwrap(), Err(AdmaError::Cancelled)));
    }

    #[test]
    fn test_control_requests() {
        let (device, _hw) = device();
        let h2c = device.open("h2c_0").unwrap();

        assert_eq!(h2c.control(ControlRequest::PerfStart).unwrap(), ControlResponse::Done);
        h2c.write(&[9u8; 100], 0).unwrap();
        match h2c.control(ControlRequest::PerfGet).unwrap() {
            ControlResponse::Perf(perf) => {
                assert_eq!(perf.bytes, 100);
                assert_eq!(perf.transfers, 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut out = [0u8; 4];
        let set = ControlCode::AddrModeSet.as_u32();
        let get = ControlCode::AddrModeGet.as_u32();
        assert_eq!(h2c.ioctl(set, &AddressMode::Fixed.as_u32().to_le_bytes(), &mut []).unwrap(), 0);
        assert_eq!(h2c.ioctl(get, &[], &mut out).unwrap(), 4);
        assert_eq!(AddressMode::from(u32::from_le_bytes(out)), AddressMode::Fixed);

        let mut perf = [0u8; 24];
        assert_eq!(h2c.ioctl(ControlCode::PerfGet.as_u32(), &[], &mut perf).unwrap(), 24);

        assert!(matches!(
            h2c.ioctl(0x0022_2099, &[], &mut out),
            Err(AdmaError::Unsupported(_))
        ));
    }

    #[test]
    fn test_control_on_non_dma_handle() {
        let (device, _hw) = device();
        for name in ["user", "control", "bypass", "event_0"] {
            let handle = device.open(name).unwrap();
            assert!(matches!(
                handle.control(ControlRequest::PerfGet),
                Err(AdmaError::InvalidParameter(_))
            ));
            assert!(matches!(
                handle.ioctl(0xDEAD_BEEF, &[], &mut []),
                Err(AdmaError::InvalidParameter(_))
            ));
        }
        // Streaming handles have an engine.
        let stream = device.open("c2h_1").unwrap();
        assert!(stream.control(ControlRequest::AddrModeGet).is_ok());
    }
}
