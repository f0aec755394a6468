//! WebSocket transport.
//!
//! Thin adapter around `tokio-tungstenite` carrying one JSON message per
//! text frame. Works for both sides of a connection:
//!
//! - [`WsTransport::connect`] builds the request (URL + headers), performs
//!   the handshake and wraps the client socket.
//! - [`WsTransport::from_stream`] wraps a socket accepted by a server
//!   (`tokio_tungstenite::accept_async`).
//!
//! # Architecture
//!
//! ```text
//! WsTransport ──outgoing mpsc──► writer task ──► SplitSink
//!      ▲
//!      └── listeners / state ◄── reader task ◄── SplitStream
//! ```
//!
//! The reader task publishes every text frame that parses as JSON and flips
//! the state to `Closed` when the peer closes or the socket errors. Binary
//! frames and non-JSON text are ignored. The writer task owns the sink and
//! acknowledges each send through a oneshot.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{tungstenite, WebSocketStream};

use super::{wait_closed, MessageListeners, Transport, TransportError, TransportState};

/// Command for the writer task.
#[derive(Debug)]
enum Outgoing {
    /// Send a UTF-8 text frame and report the outcome.
    Text(String, oneshot::Sender<Result<(), TransportError>>),
    /// Send a close frame.
    Close,
}

/// State shared between the handle and its background tasks.
#[derive(Debug)]
struct Shared {
    state: watch::Sender<TransportState>,
    listeners: MessageListeners,
}

impl Shared {
    fn mark_closed(&self) {
        if *self.state.borrow() != TransportState::Closed {
            log::debug!("[WsTransport] Connection closed");
            self.state.send_replace(TransportState::Closed);
        }
    }
}

/// JSON-over-WebSocket transport.
#[derive(Debug)]
pub struct WsTransport {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl WsTransport {
    /// Connect to a WebSocket URL with optional headers.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, header values are malformed,
    /// or the WebSocket handshake fails.
    pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<Arc<Self>> {
        use tungstenite::client::IntoClientRequest;

        let mut request = url
            .into_client_request()
            .with_context(|| format!("invalid WebSocket URL: {url}"))?;

        for &(name, value) in headers {
            let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid header name: {name}"))?;
            let header_value = tungstenite::http::HeaderValue::from_str(value)
                .with_context(|| format!("invalid header value for {name}"))?;
            request.headers_mut().insert(header_name, header_value);
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .context("WebSocket connect failed")?;

        log::info!("[WsTransport] Connected to {url}");
        Ok(Self::from_stream(ws_stream))
    }

    /// Wrap an established WebSocket. Must be called inside a tokio runtime.
    pub fn from_stream<S>(ws_stream: WebSocketStream<S>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (state, _) = watch::channel(TransportState::Open);
        let shared = Arc::new(Shared {
            state,
            listeners: MessageListeners::new(),
        });
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (sink, stream) = ws_stream.split();

        tokio::spawn(run_reader(stream, Arc::clone(&shared)));
        tokio::spawn(run_writer(sink, outgoing_rx, Arc::clone(&shared)));

        Arc::new(Self { shared, outgoing })
    }

    /// Send a close frame. The state becomes `Closed` once the peer answers
    /// or the socket drops.
    pub fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, message: Value) -> Result<(), TransportError> {
        match self.state() {
            TransportState::Open => {}
            TransportState::Connecting => return Err(TransportError::NotOpen),
            TransportState::Closed => return Err(TransportError::Closed),
        }

        let (done_tx, done_rx) = oneshot::channel();
        if self
            .outgoing
            .send(Outgoing::Text(message.to_string(), done_tx))
            .is_err()
        {
            return Err(TransportError::Closed);
        }
        done_rx.await.unwrap_or(Err(TransportError::Closed))
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        self.shared.listeners.subscribe()
    }

    fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.shared.state.subscribe()
    }

    fn state(&self) -> TransportState {
        *self.shared.state.borrow()
    }
}

/// Publish inbound JSON messages until the socket ends.
async fn run_reader<S>(
    mut stream: futures_util::stream::SplitStream<WebSocketStream<S>>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(tungstenite::Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(value) => shared.listeners.emit(&value),
                Err(e) => log::trace!("[WsTransport] Ignoring non-JSON text frame: {e}"),
            },
            Ok(tungstenite::Message::Close(close_frame)) => {
                let (code, reason) = close_frame
                    .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                    .unwrap_or((1005, String::new()));
                log::debug!("[WsTransport] Peer closed: {code} {reason}");
                break;
            }
            // Ping/pong are answered by tungstenite; binary frames are not ours
            Ok(_) => continue,
            Err(e) => {
                log::warn!("[WsTransport] Read error: {e}");
                break;
            }
        }
    }
    shared.mark_closed();
}

/// Drain outgoing commands into the sink until closed.
async fn run_writer<S>(
    mut sink: futures_util::stream::SplitSink<WebSocketStream<S>, tungstenite::Message>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = shared.state.subscribe();
    loop {
        let command = tokio::select! {
            command = outgoing.recv() => command,
            () = wait_closed(&mut state) => None,
        };
        match command {
            Some(Outgoing::Text(text, done)) => {
                let result = sink
                    .send(tungstenite::Message::Text(text))
                    .await
                    .map_err(|e| TransportError::SendFailed(e.to_string()));
                let _ = done.send(result);
            }
            Some(Outgoing::Close) => {
                if let Err(e) = sink.send(tungstenite::Message::Close(None)).await {
                    log::debug!("[WsTransport] Close frame not sent: {e}");
                }
            }
            None => break,
        }
    }

    // Fail anything still queued
    outgoing.close();
    while let Ok(command) = outgoing.try_recv() {
        if let Outgoing::Text(_, done) = command {
            let _ = done.send(Err(TransportError::Closed));
        }
    }
    let _ = sink.close().await;
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replace("https://", "wss://")
            .replace("http://", "ws://")
    }
}
