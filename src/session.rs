//! Stream session: one transport, many streams.
//!
//! A [`Session`] owns the `StreamId -> MuxStream` map for one transport. It
//! creates local streams, accepts streams the peer creates, and routes every
//! inbound frame to the stream registered under the frame's key.
//!
//! # Architecture
//!
//! ```text
//! Transport ──messages──► dispatcher task ──decode/filter──► MuxStream::handle_frame
//!                               │
//!                               └── unknown key + create ──► new remote stream
//!                                                            └─► Session::accept()
//! ```
//!
//! The dispatcher is the only subscriber to inbound messages, so a remote
//! stream sees every frame that follows its Create. It stops when the
//! transport closes or the session is dropped, releasing its subscription.
//! Streams watch the transport state themselves. Dropping the session
//! destroys every stream it still holds, since nothing would route their
//! frames any more.
//!
//! Remote streams wait in a bounded accept backlog. A Create that arrives
//! while the backlog is full is refused with a Destroy.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::MuxConfig;
use crate::id::{KeyGenerator, RandomKeys, StreamId};
use crate::protocol::{Control, Frame, FrameBody};
use crate::stream::{Direction, MuxStream};
use crate::transport::{wait_closed, Transport, TransportState};

/// A stream opened by the peer, with the init data from its Create frame.
#[derive(Debug)]
pub struct IncomingStream {
    /// The new stream.
    pub stream: MuxStream,
    /// Init data sent by the peer, if any.
    pub init_data: Option<Value>,
}

impl IncomingStream {
    /// Deserialize the init data (absent data reads as `null`).
    pub fn init_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.init_data.clone().unwrap_or(Value::Null))
    }
}

#[derive(Debug)]
struct SessionInner {
    transport: Arc<dyn Transport>,
    config: MuxConfig,
    keys: Box<dyn KeyGenerator>,
    streams: Mutex<HashMap<StreamId, MuxStream>>,
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<StreamId, MuxStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_stream(&self, key: StreamId, direction: Direction, init_data: Option<Value>) -> MuxStream {
        MuxStream::open(key, direction, init_data, Arc::clone(&self.transport), &self.config)
    }

    /// Remove the stream's entry once it is destroyed.
    fn watch_stream(self: &Arc<Self>, stream: &MuxStream) {
        let closed = stream.closed_token();
        let key = stream.id().clone();
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            closed.cancelled().await;
            let Some(session) = session.upgrade() else {
                return;
            };
            let mut streams = session.lock();
            // The key may have been reused by a newer stream
            if streams.get(&key).is_some_and(MuxStream::is_destroyed) {
                streams.remove(&key);
                log::debug!("[Mux] Removed stream {} ({} open)", key, streams.len());
            }
        });
    }

    /// Apply one inbound transport message.
    fn dispatch(self: &Arc<Self>, message: &Value, incoming: &mpsc::Sender<IncomingStream>) {
        let Some(frame) = Frame::decode(message, &self.config.protocol_tag) else {
            return;
        };

        let existing = self.lock().get(&frame.key).cloned();
        if let Some(stream) = existing {
            stream.handle_frame(&frame);
            return;
        }

        match frame.body {
            FrameBody::Control(Control::Create { value }) => {
                let stream = {
                    let mut streams = self.lock();
                    // Lost a race with create_stream for the same key
                    if streams.contains_key(&frame.key) {
                        return;
                    }
                    let stream = self.open_stream(frame.key.clone(), Direction::Remote, value.clone());
                    streams.insert(frame.key.clone(), stream.clone());
                    stream
                };
                self.watch_stream(&stream);

                let accepted = IncomingStream {
                    stream: stream.clone(),
                    init_data: value,
                };
                match incoming.try_send(accepted) {
                    Ok(()) => log::info!("[Mux] Accepted stream {}", frame.key),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::warn!("[Mux] Accept backlog full, refusing stream {}", frame.key);
                        stream.destroy();
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        log::debug!("[Mux] Session gone, refusing stream {}", frame.key);
                        stream.destroy();
                    }
                }
            }
            FrameBody::Control(control) => {
                log::trace!("[Mux] Dropping {} for unknown stream {}", control.name(), frame.key);
            }
            FrameBody::Data(_) => {
                log::trace!("[Mux] Dropping data for unknown stream {}", frame.key);
            }
        }
    }
}

/// Multiplexes streams over one transport.
///
/// Must be created inside a tokio runtime. Dropping the session stops its
/// dispatcher and destroys every stream it still holds; the peer receives a
/// Destroy for each. Data the peer sent before ending stays readable on
/// handles that outlive the session.
#[derive(Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<IncomingStream>>,
    _dispatcher: DropGuard,
}

impl Session {
    /// Session with the default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, MuxConfig::default())
    }

    /// Session with an explicit configuration.
    pub fn with_config(transport: Arc<dyn Transport>, config: MuxConfig) -> Self {
        Self::with_key_generator(transport, config, Box::new(RandomKeys))
    }

    /// Session with an explicit configuration and key source.
    pub fn with_key_generator(
        transport: Arc<dyn Transport>,
        config: MuxConfig,
        keys: Box<dyn KeyGenerator>,
    ) -> Self {
        let inner = Arc::new(SessionInner {
            transport,
            config: config.normalized(),
            keys,
            streams: Mutex::new(HashMap::new()),
        });
        let (incoming_tx, incoming_rx) = mpsc::channel(inner.config.accept_backlog);
        let shutdown = CancellationToken::new();

        if inner.transport.state() == TransportState::Closed {
            log::debug!("[Mux] Transport already closed; session is inert");
        } else {
            let messages = inner.transport.subscribe();
            let state = inner.transport.watch_state();
            tokio::spawn(run_dispatcher(
                Arc::downgrade(&inner),
                messages,
                state,
                incoming_tx,
                shutdown.clone(),
            ));
        }

        Self {
            inner,
            incoming: tokio::sync::Mutex::new(incoming_rx),
            _dispatcher: shutdown.drop_guard(),
        }
    }

    /// Open a new local stream, optionally carrying init data to the peer.
    ///
    /// Returns immediately; the Create frame goes out through the stream's
    /// send queue. On a closed transport the stream is returned already
    /// destroyed and is not registered.
    pub fn create_stream(&self, init_data: Option<Value>) -> MuxStream {
        let stream = {
            let mut streams = self.inner.lock();
            let key = loop {
                let key = self.inner.keys.generate();
                if !streams.contains_key(&key) {
                    break key;
                }
                log::debug!("[Mux] Key {} already in use, regenerating", key);
            };
            let stream = self.inner.open_stream(key.clone(), Direction::Local, init_data);
            if stream.is_destroyed() {
                return stream;
            }
            streams.insert(key, stream.clone());
            stream
        };
        self.inner.watch_stream(&stream);
        stream
    }

    /// Next stream opened by the peer, or `None` once the session stopped
    /// dispatching (transport closed) and every accepted stream was taken.
    pub async fn accept(&self) -> Option<IncomingStream> {
        self.incoming.lock().await.recv().await
    }

    /// Stream registered under `key`.
    pub fn stream(&self, key: &StreamId) -> Option<MuxStream> {
        self.inner.lock().get(key).cloned()
    }

    /// Number of registered (not yet destroyed) streams.
    pub fn stream_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// The session's configuration.
    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let orphaned: Vec<MuxStream> = self.inner.lock().drain().map(|(_, stream)| stream).collect();
        if !orphaned.is_empty() {
            log::debug!("[Mux] Session dropped, destroying {} stream(s)", orphaned.len());
        }
        for stream in orphaned {
            stream.shut_down_remotely();
        }
    }
}

/// Route inbound messages until the transport closes or the session drops.
async fn run_dispatcher(
    session: Weak<SessionInner>,
    mut messages: mpsc::UnboundedReceiver<Value>,
    mut state: tokio::sync::watch::Receiver<TransportState>,
    incoming: mpsc::Sender<IncomingStream>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
            () = wait_closed(&mut state) => {
                log::debug!("[Mux] Transport closed, detaching session");
                break;
            }
        };
        let Some(session) = session.upgrade() else {
            break;
        };
        session.dispatch(&message, &incoming);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::transport::MemoryTransport;
    use bytes::Bytes;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn accept(session: &Session) -> IncomingStream {
        tokio::time::timeout(Duration::from_secs(1), session.accept())
            .await
            .expect("no stream accepted")
            .expect("session stopped")
    }

    fn create_message(key: &str) -> Value {
        Frame::control(StreamId::from(key), Control::Create { value: None })
            .encode("ws-send-stream")
    }

    /// Hands out keys from a fixed list.
    #[derive(Debug)]
    struct ScriptedKeys(Mutex<VecDeque<&'static str>>);

    impl KeyGenerator for ScriptedKeys {
        fn generate(&self) -> StreamId {
            StreamId::from(self.0.lock().unwrap().pop_front().unwrap())
        }
    }

    #[tokio::test]
    async fn test_create_and_accept_with_init_data() {
        let (a, b) = MemoryTransport::pair();
        let client = Session::new(a.clone());
        let server = Session::new(b.clone());

        let local = client.create_stream(Some(json!({"room": "x"})));
        assert_eq!(local.id().0.len(), 32);
        assert_eq!(client.stream_count(), 1);

        let incoming = accept(&server).await;
        assert_eq!(incoming.stream.id(), local.id());
        assert_eq!(incoming.stream.direction(), Direction::Remote);
        assert_eq!(incoming.init_data, Some(json!({"room": "x"})));
        assert_eq!(server.stream_count(), 1);

        #[derive(serde::Deserialize)]
        struct Init {
            room: String,
        }
        assert_eq!(incoming.init_as::<Init>().unwrap().room, "x");
    }

    #[tokio::test]
    async fn test_data_flows_both_ways() {
        let (a, b) = MemoryTransport::pair();
        let client = Session::new(a.clone());
        let server = Session::new(b.clone());

        let local = client.create_stream(None);
        local.write("ping").await.unwrap();
        let remote = accept(&server).await.stream;
        assert_eq!(remote.read().await, Ok(Some(Bytes::from_static(b"ping"))));

        remote.write("pong").await.unwrap();
        assert_eq!(local.read().await, Ok(Some(Bytes::from_static(b"pong"))));
    }

    #[tokio::test]
    async fn test_duplicate_create_ignored() {
        let (_a, b) = MemoryTransport::pair();
        let server = Session::new(b.clone());

        b.inject(create_message("dup"));
        b.inject(create_message("dup"));
        let first = accept(&server).await;
        assert_eq!(first.stream.id(), &StreamId::from("dup"));

        let second = tokio::time::timeout(Duration::from_millis(50), server.accept()).await;
        assert!(second.is_err(), "duplicate create must not yield a second stream");
        assert_eq!(server.stream_count(), 1);
        // Remote streams never answer with their own Create
        assert!(b.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_traffic_ignored() {
        let (_a, b) = MemoryTransport::pair();
        let server = Session::new(b.clone());

        b.inject(json!("hello"));
        b.inject(json!(null));
        b.inject(json!({"type": "stream.control", "key": "k", "payload": {"type": "create"}}));
        b.inject(json!({"source": "other", "type": "stream.control", "key": "k",
                        "payload": {"type": "create"}}));
        b.inject(json!({"source": "ws-send-stream", "type": "stream.control", "key": "k"}));
        b.inject(Frame::data(StreamId::from("nobody"), Bytes::from_static(b"x")).encode("ws-send-stream"));

        b.inject(create_message("real"));
        let incoming = accept(&server).await;
        assert_eq!(incoming.stream.id(), &StreamId::from("real"));
        assert_eq!(server.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_sessions_with_different_tags_share_transport() {
        let (a, b) = MemoryTransport::pair();
        let room = MuxConfig {
            protocol_tag: "room-mux".into(),
            ..MuxConfig::default()
        };
        let client = Session::with_config(a.clone(), room.clone());
        let server_default = Session::new(b.clone());
        let server_room = Session::with_config(b.clone(), room);

        let local = client.create_stream(None);
        let incoming = accept(&server_room).await;
        assert_eq!(incoming.stream.id(), local.id());

        let other = tokio::time::timeout(Duration::from_millis(50), server_default.accept()).await;
        assert!(other.is_err());
        assert_eq!(server_default.stream_count(), 0);
    }

    #[tokio::test]
    async fn test_destroy_propagates_and_purges_both_maps() {
        let (a, b) = MemoryTransport::pair();
        let client = Session::new(a.clone());
        let server = Session::new(b.clone());

        let local = client.create_stream(None);
        let remote = accept(&server).await.stream;

        local.destroy();
        wait_until(|| remote.is_destroyed()).await;
        wait_until(|| client.stream_count() == 0 && server.stream_count() == 0).await;
        assert!(client.stream(local.id()).is_none());
    }

    #[tokio::test]
    async fn test_finish_both_sides_purges_streams() {
        let (a, b) = MemoryTransport::pair();
        let client = Session::new(a.clone());
        let server = Session::new(b.clone());

        let local = client.create_stream(None);
        let remote = accept(&server).await.stream;

        local.finish().await.unwrap();
        remote.finish().await.unwrap();
        assert_eq!(remote.read_to_end().await, Ok(Vec::new()));
        assert_eq!(local.read_to_end().await, Ok(Vec::new()));

        assert!(local.is_destroyed());
        assert!(remote.is_destroyed());
        wait_until(|| client.stream_count() == 0 && server.stream_count() == 0).await;
    }

    #[tokio::test]
    async fn test_key_collision_regenerates() {
        let (a, _b) = MemoryTransport::pair();
        let keys = ScriptedKeys(Mutex::new(VecDeque::from(["k1", "k1", "k2"])));
        let session = Session::with_key_generator(a.clone(), MuxConfig::default(), Box::new(keys));

        let first = session.create_stream(None);
        let second = session.create_stream(None);

        assert_eq!(first.id(), &StreamId::from("k1"));
        assert_eq!(second.id(), &StreamId::from("k2"));
        assert_eq!(session.stream_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_transport_session_is_inert() {
        let (a, _b) = MemoryTransport::pair();
        a.close();

        let session = Session::new(a.clone());
        assert_eq!(a.message_listener_count(), 0);
        assert_eq!(a.state_listener_count(), 0);

        let stream = session.create_stream(Some(json!(1)));
        assert!(stream.is_destroyed());
        assert_eq!(session.stream_count(), 0);
        assert!(session.accept().await.is_none());
        assert!(a.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_transport_close_detaches_session_and_streams() {
        let (a, b) = MemoryTransport::pair();
        let client = Session::new(a.clone());
        let _server = Session::new(b.clone());
        let local = client.create_stream(None);
        wait_until(|| a.message_listener_count() == 1).await;

        a.close();
        assert!(client.accept().await.is_none());
        tokio::time::timeout(Duration::from_secs(1), local.closed())
            .await
            .expect("stream should close with the transport");
        wait_until(|| a.message_listener_count() == 0 && a.state_listener_count() == 0).await;
    }

    #[tokio::test]
    async fn test_dropping_session_destroys_its_streams() {
        let (a, b) = MemoryTransport::pair();
        let client = Session::new(a.clone());
        let server = Session::new(b.clone());

        let local = client.create_stream(None);
        let remote = accept(&server).await.stream;
        drop(client);

        assert!(local.is_destroyed());
        // May race the Destroy on its way to the peer
        let _ = remote.write("x").await;
        let read = tokio::time::timeout(Duration::from_millis(500), local.read())
            .await
            .expect("read must not hang after the session is gone");
        assert_eq!(read, Err(StreamError::Destroyed));

        wait_until(|| remote.is_destroyed()).await;
        wait_until(|| server.stream_count() == 0).await;
    }

    #[tokio::test]
    async fn test_full_accept_backlog_refuses_stream() {
        let (_a, b) = MemoryTransport::pair();
        let config = MuxConfig {
            accept_backlog: 1,
            ..MuxConfig::default()
        };
        let server = Session::with_config(b.clone(), config);

        b.inject(create_message("first"));
        b.inject(create_message("second"));

        let destroy = Frame::control(StreamId::from("second"), Control::Destroy).encode("ws-send-stream");
        wait_until(|| b.sent_frames().contains(&destroy)).await;
        wait_until(|| server.stream_count() == 1).await;
        assert!(server.stream(&StreamId::from("second")).is_none());

        let first = accept(&server).await;
        assert_eq!(first.stream.id(), &StreamId::from("first"));
        assert!(!first.stream.is_destroyed());
    }

    #[tokio::test]
    async fn test_dropping_session_releases_subscription() {
        let (a, _b) = MemoryTransport::pair();
        let session = Session::new(a.clone());
        assert_eq!(a.message_listener_count(), 1);

        drop(session);
        wait_until(|| a.message_listener_count() == 0).await;
    }
}
