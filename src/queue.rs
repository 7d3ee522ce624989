// ADMA PCIe DMA Engine Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Per-engine serial request queues.
//!
//! Every DMA engine gets one FIFO with a single worker thread. The worker
//! admits a request, programs the engine, and does not look at the next
//! request until the current transaction has reached a terminal state. That
//! ordering is what keeps at most one transaction on the engine; the queue
//! itself takes no engine lock.

use crate::engine::{Direction, Engine};
use crate::error::{AdmaError, AdmaResult, Failure};
use crate::lock;
use crate::transaction::{Completion, DmaBuffer, Terminal};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
enum Stage {
    Queued,
    Admitted { engine: Arc<Engine>, txn: u64 },
    Withdrawn,
    Done,
}

#[derive(Debug)]
struct RequestInner {
    id: u64,
    direction: Direction,
    card_addr: u64,
    buffer: DmaBuffer,
    completion: Arc<Completion>,
    stage: Mutex<Stage>,
}

/// Handle to a queued DMA request. Clones refer to the same request.
#[derive(Debug, Clone)]
pub struct IoRequest {
    inner: Arc<RequestInner>,
}

impl IoRequest {
    fn new(direction: Direction, card_addr: u64, buffer: DmaBuffer) -> Self {
        Self {
            inner: Arc::new(RequestInner {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                direction,
                card_addr,
                buffer,
                completion: Completion::new(),
                stage: Mutex::new(Stage::Queued),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// The transfer buffer. For C2H requests it holds the data once
    /// the request completed.
    pub fn buffer(&self) -> &DmaBuffer {
        &self.inner.buffer
    }

    /// Block until the request reaches a terminal state.
    pub fn wait(&self) -> AdmaResult<usize> {
        self.inner.completion.wait().into_result()
    }

    /// As [`wait`](Self::wait), but gives up with `Timeout` after `timeout`.
    /// The request itself stays pending.
    pub fn wait_timeout(&self, timeout: Duration) -> AdmaResult<usize> {
        self.inner
            .completion
            .wait_timeout(timeout)
            .ok_or(AdmaError::Timeout)?
            .into_result()
    }

    /// Terminal outcome, if reached.
    pub fn report(&self) -> Option<Terminal> {
        self.inner.completion.peek()
    }

    pub fn is_done(&self) -> bool {
        self.report().is_some()
    }

    /// Withdraw the request. A queued request completes `Cancelled` without
    /// reaching the engine; an admitted one is cancelled on the engine,
    /// racing its hardware completion. Returns false if it was too late.
    pub fn cancel(&self) -> bool {
        let mut stage = lock(&self.inner.stage);
        match &*stage {
            Stage::Queued => {
                *stage = Stage::Withdrawn;
                drop(stage);
                log::debug!("request {} withdrawn while queued", self.inner.id);
                self.inner.completion.complete(Terminal::Cancelled)
            }
            Stage::Admitted { engine, txn } => {
                let (engine, txn) = (engine.clone(), *txn);
                drop(stage);
                engine.cancel(txn)
            }
            Stage::Withdrawn | Stage::Done => false,
        }
    }
}

/// FIFO of DMA requests for one engine.
pub struct EngineQueue {
    engine: Arc<Engine>,
    tx: Mutex<Option<Sender<IoRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
}

impl EngineQueue {
    /// Start the worker thread for `engine`.
    pub fn spawn(engine: Arc<Engine>) -> AdmaResult<Self> {
        let (tx, rx) = mpsc::channel();
        let closing = Arc::new(AtomicBool::new(false));
        let worker = {
            let engine = engine.clone();
            let closing = closing.clone();
            std::thread::Builder::new()
                .name(format!("adma-{}", engine.name()))
                .spawn(move || Self::run(&engine, rx, &closing))?
        };
        Ok(Self {
            engine,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            closing,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Queue a transfer. Validation happens here, before anything is queued.
    pub fn submit(
        &self,
        direction: Direction,
        card_addr: u64,
        buffer: DmaBuffer,
    ) -> AdmaResult<IoRequest> {
        if buffer.is_empty() {
            log::error!("{}: zero-length request", self.engine.name());
            return Err(AdmaError::InvalidDeviceRequest(
                "zero-length request".to_string(),
            ));
        }
        if direction != self.engine.direction() {
            return Err(AdmaError::InvalidDeviceRequest(format!(
                "{} transfer on {} queue",
                direction,
                self.engine.name()
            )));
        }
        if !self.engine.is_enabled() {
            return Err(AdmaError::DeviceNotEnabled);
        }

        let request = IoRequest::new(direction, card_addr, buffer);
        let tx = lock(&self.tx);
        let sender = tx.as_ref().ok_or(AdmaError::DeviceNotEnabled)?;
        sender
            .send(request.clone())
            .map_err(|_| AdmaError::DeviceNotEnabled)?;
        log::info!(
            "{} queued request {} ({} bytes)",
            self.engine.name(),
            request.id(),
            request.buffer().len()
        );
        Ok(request)
    }

    fn run(engine: &Arc<Engine>, rx: Receiver<IoRequest>, closing: &AtomicBool) {
        for request in rx {
            if closing.load(Ordering::Acquire) {
                request.cancel();
                continue;
            }
            Self::process(engine, &request);
        }
        log::debug!("{} queue worker exiting", engine.name());
    }

    fn process(engine: &Arc<Engine>, request: &IoRequest) {
        let inner = &request.inner;
        let mut stage = lock(&inner.stage);
        if !matches!(*stage, Stage::Queued) {
            return;
        }
        let admitted = engine.admit(
            inner.buffer.clone(),
            inner.direction,
            inner.card_addr,
            inner.completion.clone(),
        );
        let txn = match admitted {
            Ok(txn) => txn,
            Err(e) => {
                *stage = Stage::Done;
                drop(stage);
                log::error!("{} admission of request {} failed: {}", engine.name(), inner.id, e);
                inner.completion.complete(Terminal::Failed {
                    failure: Failure::StartFailed,
                });
                return;
            }
        };
        *stage = Stage::Admitted {
            engine: engine.clone(),
            txn,
        };
        drop(stage);

        // A panic below the engine must not take the worker down with the
        // engine still bound.
        match panic::catch_unwind(AssertUnwindSafe(|| engine.execute(txn))) {
            Ok(Ok(())) => {}
            // Already reported to the request by the state machine.
            Ok(Err(e)) => log::debug!("{} request {} ended early: {}", engine.name(), inner.id, e),
            Err(_) => {
                log::error!("{} request {} panicked while executing", engine.name(), inner.id);
                engine.fail(txn, Failure::StartFailed);
            }
        }
        inner.completion.wait();
        *lock(&inner.stage) = Stage::Done;
    }

    /// Stop accepting requests, cancel whatever is queued or executing, and
    /// join the worker.
    pub fn shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        lock(&self.tx).take();
        if let Some(txn) = self.engine.inflight_id() {
            self.engine.cancel(txn);
        }
        if let Some(worker) = lock(&self.worker).take() {
            // Cancel once more in case the worker admitted between the two.
            while !worker.is_finished() {
                if let Some(txn) = self.engine.inflight_id() {
                    self.engine.cancel(txn);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            if worker.join().is_err() {
                log::error!("{} queue worker panicked", self.engine.name());
            }
        }
    }
}

impl Drop for EngineQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
