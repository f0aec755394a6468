//! Multiplexed duplex byte-stream.
//!
//! A [`MuxStream`] is one logical stream riding on a shared transport. It
//! emits and consumes frames tagged with its own key and keeps its state in
//! three parts: a readable buffer, a write credit gate, and the write-side
//! lifecycle.
//!
//! # Lifecycle
//!
//! ```text
//!              finish()                       peer End + read to EOF
//!   Open ───────────────► Ending ──► Finished ─────────────────────┐
//!    │                                                             ▼
//!    └── destroy() / peer Destroy / transport close / send error ► Destroyed
//! ```
//!
//! A stream whose write side is finished and whose read side has been read
//! to end-of-data destroys itself.
//!
//! # Flow control
//!
//! Each direction carries a single-bit credit. When the readable buffer
//! reaches the high-water mark the stream sends `canPushNext: false`; when a
//! read drains it below the mark it sends `canPushNext: true`. On the writing
//! side, a write whose frame was sent completes immediately while credit is
//! granted, otherwise its completion is held until the peer grants credit
//! again, and held completions are released in submission order.
//!
//! # Concurrency
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`. Frames are enqueued on the stream's [`SendQueue`] while the lock
//! is held, so the frame order always matches the order of state changes.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::MuxConfig;
use crate::duplex::{Pulled, Pushed, ReadBuffer, WriteGate, WriteState};
use crate::error::StreamError;
use crate::id::StreamId;
use crate::protocol::{concat_chunks, Control, Frame, FrameBody};
use crate::queue::{PendingSend, SendQueue};
use crate::transport::{wait_closed, Transport, TransportState};

/// Which side opened the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Created by this endpoint; a Create frame was sent.
    Local,
    /// Created by the peer's Create frame.
    Remote,
}

#[derive(Debug)]
struct StreamState {
    read: ReadBuffer,
    gate: WriteGate,
    write: WriteState,
    destroyed: bool,
}

#[derive(Debug)]
struct StreamInner {
    key: StreamId,
    direction: Direction,
    init_data: Option<Value>,
    tag: String,
    transport: Arc<dyn Transport>,
    queue: SendQueue,
    state: Mutex<StreamState>,
    /// Woken on new data, end-of-data and destroy.
    readable: Notify,
    /// Cancelled once the stream is destroyed.
    destroyed: CancellationToken,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.destroyed {
            return;
        }
        state.destroyed = true;
        // Last handle gone without destroy(): still tell the peer
        if self.transport.state().is_reachable() {
            let frame = Frame::control(self.key.clone(), Control::Destroy);
            drop(self.queue.push(frame.encode(&self.tag)));
        }
        self.destroyed.cancel();
    }
}

/// One logical duplex byte-stream multiplexed over a shared transport.
///
/// Cloning yields another handle to the same stream.
#[derive(Debug, Clone)]
pub struct MuxStream {
    inner: Arc<StreamInner>,
}

impl MuxStream {
    /// Build a stream over `transport`. Must be called inside a tokio runtime.
    ///
    /// On a closed transport the stream is born destroyed: it subscribes to
    /// nothing and sends nothing. Otherwise it starts watching for transport
    /// close and, for [`Direction::Local`], enqueues the Create frame.
    pub(crate) fn open(
        key: StreamId,
        direction: Direction,
        init_data: Option<Value>,
        transport: Arc<dyn Transport>,
        config: &MuxConfig,
    ) -> Self {
        let closed = transport.state() == TransportState::Closed;
        let queue = if closed {
            SendQueue::closed()
        } else {
            SendQueue::start(Arc::clone(&transport))
        };

        let stream = Self {
            inner: Arc::new(StreamInner {
                key,
                direction,
                init_data,
                tag: config.protocol_tag.clone(),
                transport,
                queue,
                state: Mutex::new(StreamState {
                    read: ReadBuffer::new(config.high_water_mark),
                    gate: WriteGate::default(),
                    write: WriteState::Open,
                    destroyed: closed,
                }),
                readable: Notify::new(),
                destroyed: CancellationToken::new(),
            }),
        };

        if closed {
            log::debug!("[MuxStream] {} created on closed transport", stream.inner.key);
            stream.inner.destroyed.cancel();
            return stream;
        }

        stream.watch_transport_close();
        if direction == Direction::Local {
            let create = Control::Create {
                value: stream.inner.init_data.clone(),
            };
            drop(stream.send_control(create));
        }
        log::debug!("[MuxStream] {} opened ({:?})", stream.inner.key, direction);
        stream
    }

    /// Destroy the stream when the transport closes.
    fn watch_transport_close(&self) {
        let mut state = self.inner.transport.watch_state();
        let destroyed = self.inner.destroyed.clone();
        let weak: Weak<StreamInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                () = wait_closed(&mut state) => {
                    if let Some(inner) = weak.upgrade() {
                        log::debug!("[MuxStream] {} transport closed", inner.key);
                        Self { inner }.shut_down_remotely();
                    }
                }
                () = destroyed.cancelled() => {}
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a control frame. Skipped (and reported as sent) once the
    /// transport is closed.
    fn send_control(&self, control: Control) -> PendingSend {
        if !self.inner.transport.state().is_reachable() {
            return PendingSend::Ready(Ok(()));
        }
        log::trace!("[MuxStream] {} -> {}", self.inner.key, control.name());
        let frame = Frame::control(self.inner.key.clone(), control);
        self.inner.queue.push(frame.encode(&self.inner.tag))
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    /// Stream identifier.
    pub fn id(&self) -> &StreamId {
        &self.inner.key
    }

    /// Which side opened the stream.
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Init data carried by the Create frame, if any.
    pub fn init_data(&self) -> Option<&Value> {
        self.inner.init_data.as_ref()
    }

    /// True once the stream reached its terminal state.
    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Whether the peer currently grants write credit.
    pub fn is_write_allowed(&self) -> bool {
        self.lock().gate.is_allowed()
    }

    /// Writes whose frames were sent but which wait for credit.
    pub fn pending_writes(&self) -> usize {
        self.lock().gate.pending_len()
    }

    /// Bytes received but not read yet.
    pub fn buffered_len(&self) -> usize {
        self.lock().read.buffered()
    }

    /// Resolve once the stream is destroyed.
    pub async fn closed(&self) {
        self.inner.destroyed.cancelled().await;
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.inner.destroyed.clone()
    }

    // ── Inbound frames ───────────────────────────────────────────────────────

    /// Apply a frame received from the peer. Frames for other keys are ignored.
    pub(crate) fn handle_frame(&self, frame: &Frame) {
        if frame.key != self.inner.key {
            return;
        }
        match &frame.body {
            FrameBody::Data(data) => self.handle_data(data.clone()),
            FrameBody::Control(control) => self.handle_control(control),
        }
    }

    fn handle_data(&self, data: Bytes) {
        {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            match state.read.push(data) {
                Pushed::Buffered => {}
                Pushed::Saturated => {
                    drop(self.send_control(Control::CanPushNext { value: false }));
                }
                Pushed::AfterEnd => {
                    log::warn!("[MuxStream] {} dropping data received after end", self.inner.key);
                    return;
                }
            }
        }
        self.inner.readable.notify_waiters();
    }

    fn handle_control(&self, control: &Control) {
        match control {
            Control::CanPushNext { value } => {
                let released = {
                    let mut state = self.lock();
                    if state.destroyed {
                        return;
                    }
                    state.gate.set_allowed(*value)
                };
                for completion in released {
                    let _ = completion.send(Ok(()));
                }
            }
            Control::End => {
                {
                    let mut state = self.lock();
                    if state.destroyed {
                        return;
                    }
                    state.read.end();
                }
                self.inner.readable.notify_waiters();
            }
            Control::Destroy => {
                if !self.is_destroyed() {
                    log::debug!("[MuxStream] {} destroyed by peer", self.inner.key);
                    self.shut_down_remotely();
                }
            }
            Control::Create { .. } => {}
        }
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    /// Write one chunk. See [`MuxStream::write_chunks`].
    pub async fn write<B: AsRef<[u8]>>(&self, chunk: B) -> Result<(), StreamError> {
        self.write_chunks(std::iter::once(chunk)).await
    }

    /// Write several chunks as one data frame.
    ///
    /// Resolves once the frame was sent and the peer grants write credit.
    /// A send failure is returned to this call and destroys the stream.
    pub async fn write_chunks<I, B>(&self, chunks: I) -> Result<(), StreamError>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let payload = concat_chunks(chunks);
        let pending = {
            let state = self.lock();
            if state.destroyed {
                return Err(StreamError::Destroyed);
            }
            if state.write != WriteState::Open {
                return Err(StreamError::WriteAfterEnd);
            }
            let frame = Frame::data(self.inner.key.clone(), payload);
            self.inner.queue.push(frame.encode(&self.inner.tag))
        };

        if let Err(e) = pending.resolved().await {
            self.destroy();
            return Err(e.into());
        }

        let held = {
            let mut state = self.lock();
            if state.destroyed {
                return Err(StreamError::Destroyed);
            }
            if state.gate.is_allowed() {
                return Ok(());
            }
            let (completion, held) = oneshot::channel();
            state.gate.hold(completion);
            held
        };
        held.await.unwrap_or(Err(StreamError::Destroyed))
    }

    /// Half-close: send End and stop accepting writes.
    ///
    /// Resolves when the End frame's send resolves. Reading continues until
    /// the peer ends its side.
    pub async fn finish(&self) -> Result<(), StreamError> {
        let pending = {
            let mut state = self.lock();
            if state.destroyed {
                return Err(StreamError::Destroyed);
            }
            if state.write != WriteState::Open {
                return Err(StreamError::WriteAfterEnd);
            }
            state.write = WriteState::Ending;
            self.send_control(Control::End)
        };

        if let Err(e) = pending.resolved().await {
            self.destroy();
            return Err(e.into());
        }

        let done = {
            let mut state = self.lock();
            if state.destroyed {
                return Ok(());
            }
            state.write = WriteState::Finished;
            state.read.is_drained()
        };
        if done {
            self.destroy();
        }
        Ok(())
    }

    // ── Reading ──────────────────────────────────────────────────────────────

    /// Read the next chunk, or `None` once the peer ended and everything was
    /// read.
    pub async fn read(&self) -> Result<Option<Bytes>, StreamError> {
        loop {
            let notified = self.inner.readable.notified();
            let (pulled, write_finished) = {
                let mut state = self.lock();
                if state.read.is_drained() {
                    return Ok(None);
                }
                // Data the peer sent before ending stays readable unless a
                // local destroy discarded it
                if state.destroyed && (!state.read.is_ended() || state.read.is_discarded()) {
                    return Err(StreamError::Destroyed);
                }
                let pulled = state.read.pull();
                if let Pulled::Chunk { resume: true, .. } = pulled {
                    drop(self.send_control(Control::CanPushNext { value: true }));
                }
                (pulled, state.write == WriteState::Finished)
            };

            match pulled {
                Pulled::Chunk { data, .. } => return Ok(Some(data)),
                Pulled::Eof => {
                    if write_finished {
                        self.destroy();
                    }
                    return Ok(None);
                }
                Pulled::Empty => notified.await,
            }
        }
    }

    /// Read until end-of-data and return everything.
    pub async fn read_to_end(&self) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Destroy the stream.
    ///
    /// Takes effect immediately: buffered data is dropped, waiting writes and
    /// reads fail with [`StreamError::Destroyed`], and later I/O fails fast.
    /// A Destroy frame is sent to the peer on a best-effort basis; its
    /// outcome is never awaited or reported.
    pub fn destroy(&self) {
        self.shut_down(false);
    }

    /// Destroy on behalf of the peer or the transport. Data the peer sent
    /// before its End stays readable.
    pub(crate) fn shut_down_remotely(&self) {
        self.shut_down(true);
    }

    fn shut_down(&self, keep_ended_data: bool) {
        let released = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            if !(keep_ended_data && state.read.is_ended()) {
                state.read.clear();
            }
            drop(self.send_control(Control::Destroy));
            self.inner.queue.close();
            state.gate.take_pending()
        };
        log::debug!("[MuxStream] {} destroyed", self.inner.key);

        for completion in released {
            let _ = completion.send(Err(StreamError::Destroyed));
        }
        self.inner.readable.notify_waiters();
        self.inner.destroyed.cancel();
    }
}
