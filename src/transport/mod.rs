//! Transport abstraction shared by the session and its streams.
//!
//! A transport is an already-connected, message-framed, bidirectional
//! channel. The multiplexer never opens, reconnects or closes it; it only
//! sends messages, subscribes to inbound ones, and watches the connection
//! state.
//!
//! # Architecture
//!
//! ```text
//! Transport (trait)
//!     │
//!     ├── MemoryTransport   in-process linked pair (tests, demos)
//!     │
//!     └── WsTransport       JSON text frames over tokio-tungstenite
//! ```
//!
//! Inbound messages are fanned out to every subscriber through unbounded
//! channels, so a slow subscriber never makes the transport drop messages.
//! Connection state is published through a `watch` channel: a receiver
//! always sees the latest state, which is how a stream created late still
//! observes a close that happened earlier.

// Rust guideline compliant 2026-02

pub mod memory;
pub mod ws;

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

pub use crate::error::TransportError;
pub use memory::MemoryTransport;
pub use ws::WsTransport;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Connection is being established; sends must wait.
    Connecting,
    /// Connected and ready.
    Open,
    /// Closed for good.
    Closed,
}

impl TransportState {
    /// True while frames can still reach the peer (now or after opening).
    pub fn is_reachable(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }
}

/// A message-framed connection carrying JSON messages.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send one message, resolving once the adapter accepted it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] or [`TransportError::NotOpen`] when
    /// the connection is not usable, or [`TransportError::SendFailed`] when
    /// the underlying write fails.
    async fn send(&self, message: Value) -> Result<(), TransportError>;

    /// Subscribe to inbound messages. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value>;

    /// Watch the connection state. Dropping the receiver unsubscribes.
    fn watch_state(&self) -> watch::Receiver<TransportState>;

    /// Current connection state.
    fn state(&self) -> TransportState {
        *self.watch_state().borrow()
    }
}

/// Wait until the transport leaves `Connecting`.
///
/// # Errors
///
/// Returns [`TransportError::Closed`] if it closed instead of opening, or if
/// the transport itself went away.
pub async fn wait_until_open(
    state: &mut watch::Receiver<TransportState>,
) -> Result<(), TransportError> {
    match state.wait_for(|s| *s != TransportState::Connecting).await {
        Ok(s) if *s == TransportState::Open => Ok(()),
        _ => Err(TransportError::Closed),
    }
}

/// Resolve once the transport is closed (or dropped).
pub async fn wait_closed(state: &mut watch::Receiver<TransportState>) {
    let _ = state.wait_for(|s| *s == TransportState::Closed).await;
}

/// Fan-out registry of inbound-message subscribers.
///
/// Used by transport adapters to implement [`Transport::subscribe`].
/// Subscribers whose receiver was dropped are pruned on the next emit.
#[derive(Debug, Default)]
pub struct MessageListeners {
    senders: Mutex<Vec<mpsc::UnboundedSender<Value>>>,
}

impl MessageListeners {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `message` to every live subscriber.
    pub fn emit(&self, message: &Value) {
        self.lock().retain(|tx| tx.send(message.clone()).is_ok());
    }

    /// Drop every subscriber, ending their receive loops.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        let mut senders = self.lock();
        senders.retain(|tx| !tx.is_closed());
        senders.len()
    }

    /// True when nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<Value>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reachable_states() {
        assert!(TransportState::Connecting.is_reachable());
        assert!(TransportState::Open.is_reachable());
        assert!(!TransportState::Closed.is_reachable());
    }

    #[tokio::test]
    async fn test_listeners_fan_out_and_prune() {
        let listeners = MessageListeners::new();
        let mut a = listeners.subscribe();
        let b = listeners.subscribe();
        assert_eq!(listeners.len(), 2);

        drop(b);
        listeners.emit(&json!({"n": 1}));
        assert_eq!(listeners.len(), 1);
        assert_eq!(a.recv().await, Some(json!({"n": 1})));

        listeners.clear();
        assert!(listeners.is_empty());
        assert_eq!(a.recv().await, None);
    }

    #[tokio::test]
    async fn test_wait_until_open() {
        let (tx, mut rx) = watch::channel(TransportState::Connecting);
        let waiter = tokio::spawn(async move { wait_until_open(&mut rx).await });
        tx.send_replace(TransportState::Open);
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_wait_until_open_fails_on_close() {
        let (tx, mut rx) = watch::channel(TransportState::Connecting);
        let waiter = tokio::spawn(async move { wait_until_open(&mut rx).await });
        tx.send_replace(TransportState::Closed);
        assert_eq!(waiter.await.unwrap(), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_wait_closed_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(TransportState::Open);
        drop(tx);
        wait_closed(&mut rx).await;
    }
}
