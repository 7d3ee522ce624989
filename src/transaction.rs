// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! DMA transaction state machine.
//!
//! ```text
//! Idle -> Admitted -> Programming -> Executing -> { Completed | Failed | Cancelled }
//! ```
//!
//! Each engine carries at most one transaction. The transaction lives in
//! `Engine::inflight`; leaving that slot is the single point where a terminal
//! state is decided, so completion and cancellation can race freely and only
//! the context that takes the transaction out reports it. The engine is back
//! in `Idle` before the report reaches the caller.

use crate::descriptor::{DescriptorChain, TransferRequest};
use crate::engine::{CompletionMode, Direction, Engine};
use crate::error::{AdmaError, AdmaResult, Failure};
use crate::lock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransactionState {
    Idle = 0,
    Admitted = 1,
    Programming = 2,
    Executing = 3,
    Completed = 4,
    Failed = 5,
    Cancelled = 6,
}

impl TransactionState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Admitted,
            2 => Self::Programming,
            3 => Self::Executing,
            4 => Self::Completed,
            5 => Self::Failed,
            6 => Self::Cancelled,
            _ => Self::Idle,
        }
    }

    /// True while a transaction holds the engine.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Admitted | Self::Programming | Self::Executing)
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Completed { bytes: usize },
    Failed { failure: Failure },
    Cancelled,
}

impl Terminal {
    pub fn state(&self) -> TransactionState {
        match self {
            Self::Completed { .. } => TransactionState::Completed,
            Self::Failed { .. } => TransactionState::Failed,
            Self::Cancelled => TransactionState::Cancelled,
        }
    }

    /// Bytes on success, typed error otherwise.
    pub fn into_result(self) -> AdmaResult<usize> {
        match self {
            Self::Completed { bytes } => Ok(bytes),
            Self::Failed { failure } => Err(AdmaError::HardwareFailure(failure)),
            Self::Cancelled => Err(AdmaError::Cancelled),
        }
    }
}

/// One-shot report slot shared by a request's owner and the engine.
#[derive(Debug, Default)]
pub struct Completion {
    outcome: Mutex<Option<Terminal>>,
    done: Condvar,
    reports: AtomicUsize,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store the outcome and wake the waiter. Later calls are ignored.
    pub(crate) fn complete(&self, terminal: Terminal) -> bool {
        let mut outcome = lock(&self.outcome);
        if outcome.is_some() {
            log::warn!("dropping duplicate report {:?}", terminal);
            return false;
        }
        *outcome = Some(terminal);
        self.reports.fetch_add(1, Ordering::AcqRel);
        self.done.notify_all();
        true
    }

    /// Outcome if already reported.
    pub fn peek(&self) -> Option<Terminal> {
        *lock(&self.outcome)
    }

    /// Block until reported.
    pub fn wait(&self) -> Terminal {
        let mut outcome = lock(&self.outcome);
        loop {
            if let Some(terminal) = *outcome {
                return terminal;
            }
            outcome = self
                .done
                .wait(outcome)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Block until reported or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Terminal> {
        let deadline = Instant::now() + timeout;
        let mut outcome = lock(&self.outcome);
        loop {
            if let Some(terminal) = *outcome {
                return Some(terminal);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            outcome = self
                .done
                .wait_timeout(outcome, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// How many times an outcome was accepted (0 or 1).
    pub fn report_count(&self) -> usize {
        self.reports.load(Ordering::Acquire)
    }
}

/// Caller-owned transfer buffer. The engine holds a clone while a
/// transaction is bound to it and never resizes it.
#[derive(Debug, Clone, Default)]
pub struct DmaBuffer(Arc<Mutex<Vec<u8>>>);

impl DmaBuffer {
    /// Zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(data)))
    }

    pub fn len(&self) -> usize {
        lock(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        lock(&self.0).clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        lock(&self.0)
    }
}

/// A transfer bound to an engine.
pub(crate) struct Transaction {
    id: u64,
    state: TransactionState,
    direction: Direction,
    len: usize,
    card_addr: u64,
    buffer: DmaBuffer,
    /// Owned by the engine while it executes; returned to the programmer
    /// when the transaction ends.
    chain: Option<DescriptorChain>,
    reply: Arc<Completion>,
}

impl Engine {
    /// Bind a caller buffer to this idle engine.
    ///
    /// Returns the transaction id used by `program`, `cancel` and
    /// `poll_transfer`. Never blocks: a busy engine fails with `Busy`.
    pub fn admit(
        &self,
        buffer: DmaBuffer,
        direction: Direction,
        card_addr: u64,
        reply: Arc<Completion>,
    ) -> AdmaResult<u64> {
        if !self.is_enabled() {
            return Err(AdmaError::DeviceNotEnabled);
        }
        if direction != self.direction() {
            return Err(AdmaError::InvalidParameter(format!(
                "{} engine cannot serve a {} transfer",
                self.name(),
                direction
            )));
        }
        let len = buffer.len();
        if len == 0 {
            return Err(AdmaError::InvalidDeviceRequest(
                "zero-length transfer".to_string(),
            ));
        }

        let mut inflight = lock(&self.inflight);
        if inflight.is_some() {
            log::debug!("{} busy, rejecting {} byte transfer", self.name(), len);
            return Err(AdmaError::Busy);
        }
        let id = self.allocate_id();
        *inflight = Some(Transaction {
            id,
            state: TransactionState::Admitted,
            direction,
            len,
            card_addr,
            buffer,
            chain: None,
            reply,
        });
        self.set_state(TransactionState::Admitted);
        log::trace!("{} admitted transaction {} ({} bytes)", self.name(), id, len);
        Ok(id)
    }

    /// Build the descriptor chain and start the engine.
    ///
    /// A programming failure drives the transaction to `Failed`, releases the
    /// engine and reports to the caller before this returns the error.
    pub fn program(&self, id: u64) -> AdmaResult<()> {
        let mut inflight = lock(&self.inflight);
        let txn = match inflight.as_mut() {
            Some(txn) if txn.id == id && txn.state == TransactionState::Admitted => txn,
            Some(txn) if txn.id == id => {
                return Err(AdmaError::InvalidParameter(format!(
                    "transaction {} is {:?}, not Admitted",
                    id, txn.state
                )))
            }
            // Withdrawn (or never admitted) before programming began.
            _ => return Err(AdmaError::Cancelled),
        };
        txn.state = TransactionState::Programming;
        self.set_state(TransactionState::Programming);

        let started = {
            let mut data = txn.buffer.lock();
            let request = TransferRequest {
                direction: txn.direction,
                host_addr: data.as_ptr() as usize,
                len: txn.len,
                card_addr: txn.card_addr,
                address_mode: self.address_mode(),
            };
            self.programmer.program(&request).and_then(|chain| {
                // Returned to the programmer unless the engine started on it.
                let chain = scopeguard::guard(chain, |chain| self.programmer.release(chain));
                self.hw.start(&chain, &mut data)?;
                Ok(scopeguard::ScopeGuard::into_inner(chain))
            })
        };

        match started {
            Ok(chain) => {
                let chain_len = chain.len();
                txn.chain = Some(chain);
                txn.state = TransactionState::Executing;
                self.set_state(TransactionState::Executing);
                log::trace!(
                    "{} transaction {} executing, {} descriptors",
                    self.name(),
                    id,
                    chain_len
                );
                Ok(())
            }
            Err(failure) => {
                log::error!("{} programming failed: {}", self.name(), failure);
                self.finish(inflight, Terminal::Failed { failure });
                Err(AdmaError::HardwareFailure(failure))
            }
        }
    }

    /// Program and, for Poll engines, wait for completion in this context.
    pub fn execute(&self, id: u64) -> AdmaResult<()> {
        self.program(id)?;
        match self.completion_mode() {
            CompletionMode::Interrupt => Ok(()),
            CompletionMode::Poll => self.poll_transfer(id).map(|_| ()),
        }
    }

    /// Interrupt (or poll) path: read the status register and finish the
    /// executing transaction if the engine reports done or error.
    ///
    /// Returns the terminal outcome this call decided, `None` if there was
    /// nothing to finish. O(1), never blocks on callers.
    pub fn on_hardware_completion(&self) -> Option<Terminal> {
        let inflight = lock(&self.inflight);
        match inflight.as_ref() {
            Some(txn) if txn.state == TransactionState::Executing => {}
            _ => {
                log::trace!("{} spurious completion", self.name());
                return None;
            }
        }
        let status = self.hw.status();
        let terminal = if status.flags.is_error() {
            Terminal::Failed {
                failure: Failure::Device {
                    status: status.flags,
                    bytes_completed: status.completed_bytes,
                },
            }
        } else if status.flags.is_done() {
            Terminal::Completed {
                bytes: status.completed_bytes,
            }
        } else {
            return None;
        };
        self.finish(inflight, terminal);
        Some(terminal)
    }

    /// Withdraw transaction `id`. Whichever of cancel and completion takes
    /// the transaction first decides its outcome; the loser returns false.
    pub fn cancel(&self, id: u64) -> bool {
        let inflight = lock(&self.inflight);
        let state = match inflight.as_ref() {
            Some(txn) if txn.id == id && txn.state.is_active() => txn.state,
            _ => return false,
        };
        if state != TransactionState::Admitted {
            self.hw.stop();
        }
        log::info!("{} transaction {} cancelled in {:?}", self.name(), id, state);
        self.finish(inflight, Terminal::Cancelled);
        true
    }

    /// Poll-mode completion: spin, then back off, until the status register
    /// reports done or error. On timeout the transaction is failed here.
    pub fn poll_transfer(&self, id: u64) -> AdmaResult<usize> {
        let deadline = Instant::now() + self.poll.timeout;
        let mut spins = 0u32;
        let mut backoff = Duration::from_micros(1);
        loop {
            if self.inflight_id() != Some(id) {
                return Err(AdmaError::Cancelled);
            }
            let status = self.hw.status();
            if status.flags.is_error() || status.flags.is_done() {
                return match self.on_hardware_completion() {
                    Some(terminal) => terminal.into_result(),
                    None => Err(AdmaError::Cancelled),
                };
            }
            if Instant::now() >= deadline {
                let failure = Failure::PollTimeout {
                    millis: u64::try_from(self.poll.timeout.as_millis()).unwrap_or(u64::MAX),
                };
                log::error!("{} {}", self.name(), failure);
                self.fail(id, failure);
                return Err(AdmaError::HardwareFailure(failure));
            }
            if spins < self.poll.spin_iterations {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_millis(1));
            }
        }
    }

    /// Id of the bound transaction, if any.
    pub fn inflight_id(&self) -> Option<u64> {
        lock(&self.inflight).as_ref().map(|txn| txn.id)
    }

    /// Stop the engine and fail transaction `id` if it is still bound.
    pub(crate) fn fail(&self, id: u64, failure: Failure) {
        let inflight = lock(&self.inflight);
        if inflight.as_ref().is_some_and(|txn| txn.id == id) {
            self.hw.stop();
            self.finish(inflight, Terminal::Failed { failure });
        }
    }

    /// Take the transaction, release the engine, then report.
    fn finish(&self, mut inflight: MutexGuard<'_, Option<Transaction>>, terminal: Terminal) {
        let Some(mut txn) = inflight.take() else {
            return;
        };
        self.set_state(terminal.state());
        self.set_state(TransactionState::Idle);
        drop(inflight);

        let chain_len = txn.chain.as_ref().map_or(0, DescriptorChain::len);
        if let Some(chain) = txn.chain.take() {
            self.programmer.release(chain);
        }

        if let Terminal::Completed { bytes } = terminal {
            self.record_transfer(bytes);
        }
        log::debug!(
            "{} transaction {} ({} of {} bytes, {} descriptors) -> {:?}",
            self.name(),
            txn.id,
            match terminal {
                Terminal::Completed { bytes } => bytes,
                _ => 0,
            },
            txn.len,
            chain_len,
            terminal.state()
        );
        txn.reply.complete(terminal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::descriptor::SgProgrammer;
    use crate::engine::{EngineDescriptor, StatusFlags, TransferMode};
    use crate::loopback::LoopbackEngine;
    use std::sync::Barrier;
    use std::thread;

    fn engine_with(
        direction: Direction,
        completion_mode: CompletionMode,
        config: &DeviceConfig,
    ) -> (Arc<Engine>, Arc<LoopbackEngine>) {
        let hw = Arc::new(LoopbackEngine::new(direction, 64 * 1024));
        let engine = Engine::new(
            EngineDescriptor {
                direction,
                channel: 0,
                transfer_mode: TransferMode::Block,
                completion_mode,
                enabled: true,
                hw: hw.clone(),
            },
            Arc::new(SgProgrammer::from_config(config)),
            config,
        );
        (Arc::new(engine), hw)
    }

    fn h2c() -> (Arc<Engine>, Arc<LoopbackEngine>) {
        engine_with(
            Direction::H2C,
            CompletionMode::Interrupt,
            &DeviceConfig::default(),
        )
    }

    #[test]
    fn test_h2c_4096_completes() {
        let (engine, hw) = h2c();
        let reply = Completion::new();
        let buffer = DmaBuffer::from_vec(vec![0x5A; 4096]);

        let id = engine
            .admit(buffer, Direction::H2C, 0, reply.clone())
            .unwrap();
        assert_eq!(engine.state(), TransactionState::Admitted);
        engine.program(id).unwrap();
        assert_eq!(engine.state(), TransactionState::Executing);

        let terminal = engine.on_hardware_completion().unwrap();
        assert_eq!(terminal.state(), TransactionState::Completed);
        assert_eq!(reply.wait(), Terminal::Completed { bytes: 4096 });
        assert_eq!(engine.state(), TransactionState::Idle);
        assert_eq!(hw.read_device_memory(0, 4), vec![0x5A; 4]);
        assert_eq!(engine.perf().bytes, 4096);
    }

    #[test]
    fn test_busy_leaves_first_transaction_alone() {
        let (engine, _hw) = h2c();
        let first = Completion::new();
        let id = engine
            .admit(DmaBuffer::new(64), Direction::H2C, 0, first.clone())
            .unwrap();
        engine.program(id).unwrap();

        let second = Completion::new();
        let err = engine
            .admit(DmaBuffer::new(64), Direction::H2C, 0, second.clone())
            .unwrap_err();
        assert!(matches!(err, AdmaError::Busy));
        assert_eq!(second.report_count(), 0);
        assert_eq!(engine.state(), TransactionState::Executing);
        assert_eq!(engine.inflight_id(), Some(id));

        engine.on_hardware_completion();
        assert_eq!(first.wait(), Terminal::Completed { bytes: 64 });
        // Released: the next admission succeeds.
        engine
            .admit(DmaBuffer::new(8), Direction::H2C, 0, second)
            .unwrap();
    }

    #[test]
    fn test_admission_validation() {
        let (engine, _hw) = h2c();
        let reply = Completion::new();
        assert!(matches!(
            engine.admit(DmaBuffer::new(0), Direction::H2C, 0, reply.clone()),
            Err(AdmaError::InvalidDeviceRequest(_))
        ));
        assert!(matches!(
            engine.admit(DmaBuffer::new(16), Direction::C2H, 0, reply.clone()),
            Err(AdmaError::InvalidParameter(_))
        ));
        assert_eq!(engine.state(), TransactionState::Idle);
        assert_eq!(reply.report_count(), 0);
    }

    #[test]
    fn test_concurrent_admission_one_wins() {
        let (engine, _hw) = h2c();
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    engine.admit(DmaBuffer::new(32), Direction::H2C, 0, Completion::new())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, AdmaError::Busy)));
    }

    #[test]
    fn test_programming_failure_releases_engine() {
        let config = DeviceConfig::default()
            .with_max_desc_bytes(1024)
            .with_descriptor_ring_capacity(2);
        let (engine, _hw) = engine_with(Direction::H2C, CompletionMode::Interrupt, &config);
        let reply = Completion::new();
        let id = engine
            .admit(DmaBuffer::new(4096), Direction::H2C, 0, reply.clone())
            .unwrap();

        let err = engine.program(id).unwrap_err();
        assert!(matches!(
            err,
            AdmaError::HardwareFailure(Failure::DescriptorOverflow { needed: 4, .. })
        ));
        assert_eq!(reply.peek().unwrap().state(), TransactionState::Failed);
        assert_eq!(engine.state(), TransactionState::Idle);
        assert!(engine.on_hardware_completion().is_none());
    }

    #[test]
    fn test_device_error_fails_transaction() {
        let (engine, hw) = h2c();
        hw.inject_error(StatusFlags::MAGIC_STOPPED);
        let reply = Completion::new();
        let id = engine
            .admit(DmaBuffer::new(128), Direction::H2C, 0, reply.clone())
            .unwrap();
        engine.program(id).unwrap();
        engine.on_hardware_completion();

        match reply.wait() {
            Terminal::Failed {
                failure: Failure::Device { status, .. },
            } => assert!(status.contains(StatusFlags::MAGIC_STOPPED)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.state(), TransactionState::Idle);
    }

    #[test]
    fn test_cancel_executing_stops_engine() {
        let (engine, hw) = h2c();
        hw.set_stalled(true);
        let reply = Completion::new();
        let id = engine
            .admit(DmaBuffer::new(256), Direction::H2C, 0, reply.clone())
            .unwrap();
        engine.program(id).unwrap();
        assert!(engine.on_hardware_completion().is_none());

        assert!(engine.cancel(id));
        assert!(hw.stop_count() >= 1);
        assert_eq!(reply.wait(), Terminal::Cancelled);
        assert!(!engine.cancel(id));
        assert!(engine.on_hardware_completion().is_none());
        assert_eq!(reply.report_count(), 1);
        assert_eq!(engine.state(), TransactionState::Idle);
    }

    #[test]
    fn test_cancel_before_program() {
        let (engine, hw) = h2c();
        let reply = Completion::new();
        let id = engine
            .admit(DmaBuffer::new(16), Direction::H2C, 0, reply.clone())
            .unwrap();
        assert!(engine.cancel(id));
        assert_eq!(hw.stop_count(), 0);
        assert!(matches!(engine.program(id), Err(AdmaError::Cancelled)));
        assert_eq!(reply.wait(), Terminal::Cancelled);
    }

    #[test]
    fn test_stale_cancel_ignores_next_transaction() {
        let (engine, _hw) = h2c();
        let id = engine
            .admit(DmaBuffer::new(16), Direction::H2C, 0, Completion::new())
            .unwrap();
        engine.program(id).unwrap();
        engine.on_hardware_completion();

        let next = Completion::new();
        let next_id = engine
            .admit(DmaBuffer::new(16), Direction::H2C, 0, next.clone())
            .unwrap();
        assert!(!engine.cancel(id));
        assert_eq!(engine.inflight_id(), Some(next_id));
        assert_eq!(next.report_count(), 0);
    }

    #[test]
    fn test_cancel_completion_race_reports_once() {
        let (engine, _hw) = h2c();
        for _ in 0..200 {
            let reply = Completion::new();
            let id = engine
                .admit(DmaBuffer::new(512), Direction::H2C, 0, reply.clone())
                .unwrap();
            engine.program(id).unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let canceller = {
                let engine = engine.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    engine.cancel(id)
                })
            };
            barrier.wait();
            let completed = engine.on_hardware_completion().is_some();
            let cancelled = canceller.join().unwrap();

            assert!(completed ^ cancelled);
            assert_eq!(reply.report_count(), 1);
            let expected = if cancelled {
                TransactionState::Cancelled
            } else {
                TransactionState::Completed
            };
            assert_eq!(reply.wait().state(), expected);
            assert_eq!(engine.state(), TransactionState::Idle);
        }
    }

    #[test]
    fn test_descriptors_returned_on_every_exit() {
        let config = DeviceConfig::default().with_max_desc_bytes(1024);
        let programmer = Arc::new(SgProgrammer::from_config(&config));
        let hw = Arc::new(LoopbackEngine::new(Direction::H2C, 64 * 1024));
        let engine = Engine::new(
            EngineDescriptor {
                direction: Direction::H2C,
                channel: 0,
                transfer_mode: TransferMode::Block,
                completion_mode: CompletionMode::Interrupt,
                enabled: true,
                hw: hw.clone(),
            },
            programmer.clone(),
            &config,
        );

        // Completed: held while executing, returned at the terminal state.
        let id = engine
            .admit(DmaBuffer::new(3000), Direction::H2C, 0, Completion::new())
            .unwrap();
        engine.program(id).unwrap();
        assert_eq!(programmer.outstanding(), 3);
        engine.on_hardware_completion();
        assert_eq!(programmer.outstanding(), 0);

        // Cancelled while executing.
        hw.set_stalled(true);
        let id = engine
            .admit(DmaBuffer::new(2048), Direction::H2C, 0, Completion::new())
            .unwrap();
        engine.program(id).unwrap();
        assert_eq!(programmer.outstanding(), 2);
        assert!(engine.cancel(id));
        assert_eq!(programmer.outstanding(), 0);

        // Rejected by the programmer: nothing was handed out.
        let id = engine
            .admit(DmaBuffer::new(16), Direction::H2C, u64::MAX, Completion::new())
            .unwrap();
        assert!(engine.program(id).is_err());
        assert_eq!(programmer.outstanding(), 0);
    }

    #[test]
    fn test_poll_mode_completes_in_execute() {
        let (engine, hw) = engine_with(
            Direction::C2H,
            CompletionMode::Poll,
            &DeviceConfig::default(),
        );
        hw.write_device_memory(0x100, b"polled");
        let reply = Completion::new();
        let buffer = DmaBuffer::new(6);
        let id = engine
            .admit(buffer.clone(), Direction::C2H, 0x100, reply.clone())
            .unwrap();
        engine.execute(id).unwrap();
        assert_eq!(reply.peek(), Some(Terminal::Completed { bytes: 6 }));
        assert_eq!(buffer.to_vec(), b"polled");
        assert_eq!(engine.state(), TransactionState::Idle);
    }

    #[test]
    fn test_poll_timeout_fails_and_reports() {
        let config = DeviceConfig::default()
            .with_poll_timeout(Duration::from_millis(20))
            .with_poll_spin_iterations(10);
        let (engine, hw) = engine_with(Direction::H2C, CompletionMode::Poll, &config);
        hw.set_stalled(true);
        let reply = Completion::new();
        let id = engine
            .admit(DmaBuffer::new(64), Direction::H2C, 0, reply.clone())
            .unwrap();

        let err = engine.execute(id).unwrap_err();
        assert!(matches!(
            err,
            AdmaError::HardwareFailure(Failure::PollTimeout { millis: 20 })
        ));
        assert_eq!(reply.peek().unwrap().state(), TransactionState::Failed);
        assert_eq!(engine.state(), TransactionState::Idle);
        assert!(hw.stop_count() >= 1);
    }

    #[test]
    fn test_completion_wait_timeout() {
        let reply = Completion::new();
        assert!(reply.wait_timeout(Duration::from_millis(10)).is_none());
        assert!(reply.complete(Terminal::Cancelled));
        assert!(!reply.complete(Terminal::Completed { bytes: 1 }));
        assert_eq!(
            reply.wait_timeout(Duration::from_millis(10)),
            Some(Terminal::Cancelled)
        );
        assert_eq!(reply.report_count(), 1);
    }
}
