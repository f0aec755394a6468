//! Per-stream ordered send queue.
//!
//! Each stream owns one queue backed by a worker task. Messages are
//! dispatched to the transport strictly one at a time, in submission order:
//! message N+1 is not handed to the transport before message N's send has
//! resolved. Submission order is fixed the moment [`SendQueue::push`]
//! returns, so callers may enqueue from synchronous code (frame handlers,
//! `destroy`) and still get FIFO delivery.
//!
//! While the transport is connecting, the message at the head of the queue
//! waits for the open notification; everything behind it waits on the same
//! queue position.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::transport::{wait_until_open, Transport, TransportError};

/// One queued message and its completion slot.
#[derive(Debug)]
struct Job {
    message: Value,
    done: oneshot::Sender<Result<(), TransportError>>,
}

/// Outcome of a queued send. Dropping it does not cancel the send.
#[derive(Debug)]
pub(crate) enum PendingSend {
    /// Waiting in the queue or on the transport.
    Queued(oneshot::Receiver<Result<(), TransportError>>),
    /// Resolved without touching the queue.
    Ready(Result<(), TransportError>),
}

impl PendingSend {
    /// Wait for the send to resolve.
    pub(crate) async fn resolved(self) -> Result<(), TransportError> {
        match self {
            Self::Queued(rx) => rx.await.unwrap_or(Err(TransportError::Closed)),
            Self::Ready(result) => result,
        }
    }
}

/// FIFO send queue feeding a single transport.
#[derive(Debug)]
pub(crate) struct SendQueue {
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
}

impl SendQueue {
    /// Start a queue and its worker. Must be called inside a tokio runtime.
    pub(crate) fn start(transport: Arc<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_queue(transport, rx));
        Self {
            jobs: Mutex::new(Some(tx)),
        }
    }

    /// A queue that rejects everything (for streams born destroyed).
    pub(crate) fn closed() -> Self {
        Self {
            jobs: Mutex::new(None),
        }
    }

    /// Enqueue `message` behind everything already submitted.
    pub(crate) fn push(&self, message: Value) -> PendingSend {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = jobs.as_ref() else {
            return PendingSend::Ready(Err(TransportError::Closed));
        };
        let (done, rx) = oneshot::channel();
        if tx.send(Job { message, done }).is_err() {
            return PendingSend::Ready(Err(TransportError::Closed));
        }
        PendingSend::Queued(rx)
    }

    /// Stop accepting messages. Already queued messages are still sent,
    /// then the worker exits and releases the transport.
    pub(crate) fn close(&self) {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

async fn run_queue(transport: Arc<dyn Transport>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    let mut state = transport.watch_state();
    while let Some(Job { message, done }) = jobs.recv().await {
        let result = match wait_until_open(&mut state).await {
            Ok(()) => transport.send(message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            log::debug!("[MuxStream] Send failed: {e}");
        }
        let _ = done.send(result);
    }
}
