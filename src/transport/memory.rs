//! In-process transport pair.
//!
//! Two linked [`MemoryTransport`] ends deliver every sent message to the
//! other end's subscribers. The pair exposes the knobs tests need: state
//! changes, raw message injection, a log of sent messages, send-failure
//! injection, and subscriber counts.
//!
//! ```ignore
//! let (a, b) = MemoryTransport::pair();
//! let client = Session::new(a);
//! let server = Session::new(b);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::{MessageListeners, Transport, TransportError, TransportState};

/// One end of an in-process transport pair.
#[derive(Debug)]
pub struct MemoryTransport {
    state: watch::Sender<TransportState>,
    listeners: MessageListeners,
    peer: Mutex<Weak<MemoryTransport>>,
    sent: Mutex<Vec<Value>>,
    fail_sends: AtomicBool,
}

impl MemoryTransport {
    fn new(state: TransportState) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            state,
            listeners: MessageListeners::new(),
            peer: Mutex::new(Weak::new()),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        }
    }

    /// Create an open, linked pair.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        Self::pair_with_state(TransportState::Open)
    }

    /// Create a linked pair starting in `state`.
    pub fn pair_with_state(state: TransportState) -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::new(state));
        let b = Arc::new(Self::new(state));
        *a.peer.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(&b);
        *b.peer.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(&a);
        (a, b)
    }

    fn peer(&self) -> Option<Arc<Self>> {
        self.peer.lock().unwrap_or_else(PoisonError::into_inner).upgrade()
    }

    fn set_state_both(&self, state: TransportState) {
        self.state.send_replace(state);
        if let Some(peer) = self.peer() {
            peer.state.send_replace(state);
        }
    }

    /// Finish connecting: both ends become `Open`. No-op once closed.
    pub fn open(&self) {
        if self.state() != TransportState::Closed {
            self.set_state_both(TransportState::Open);
        }
    }

    /// Close both ends.
    pub fn close(&self) {
        self.set_state_both(TransportState::Closed);
    }

    /// Deliver a raw message to this end's subscribers, as if the peer sent it.
    pub fn inject(&self, message: Value) {
        self.listeners.emit(&message);
    }

    /// Make subsequent sends from this end fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Messages successfully sent from this end, oldest first.
    pub fn sent_frames(&self) -> Vec<Value> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Forget the sent-message log.
    pub fn clear_sent(&self) {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Live inbound-message subscribers on this end.
    pub fn message_listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Live state watchers on this end.
    pub fn state_listener_count(&self) -> usize {
        self.state.receiver_count()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: Value) -> Result<(), TransportError> {
        match self.state() {
            TransportState::Open => {}
            TransportState::Connecting => return Err(TransportError::NotOpen),
            TransportState::Closed => return Err(TransportError::Closed),
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("injected failure".into()));
        }

        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(message.clone());
        if let Some(peer) = self.peer() {
            peer.listeners.emit(&message);
        }

        // Resolve asynchronously, like a socket write would
        tokio::task::yield_now().await;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Value> {
        self.listeners.subscribe()
    }

    fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    fn state(&self) -> TransportState {
        *self.state.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_delivers_to_peer() {
        let (a, b) = MemoryTransport::pair();
        let mut rx = b.subscribe();

        a.send(json!({"hello": 1})).await.unwrap();

        assert_eq!(rx.recv().await, Some(json!({"hello": 1})));
        assert_eq!(a.sent_frames(), vec![json!({"hello": 1})]);
        assert!(b.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn test_send_respects_state() {
        let (a, _b) = MemoryTransport::pair_with_state(TransportState::Connecting);
        assert_eq!(a.send(json!(1)).await, Err(TransportError::NotOpen));

        a.open();
        assert_eq!(a.send(json!(1)).await, Ok(()));

        a.close();
        assert_eq!(a.send(json!(1)).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_close_reaches_both_ends() {
        let (a, b) = MemoryTransport::pair();
        let mut watch_b = b.watch_state();
        a.close();
        watch_b.changed().await.unwrap();
        assert_eq!(*watch_b.borrow(), TransportState::Closed);
        assert_eq!(b.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_open_after_close_is_noop() {
        let (a, b) = MemoryTransport::pair_with_state(TransportState::Connecting);
        b.close();
        a.open();
        assert_eq!(a.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_fail_sends() {
        let (a, b) = MemoryTransport::pair();
        let mut rx = b.subscribe();
        a.fail_sends(true);
        assert!(matches!(a.send(json!(1)).await, Err(TransportError::SendFailed(_))));
        a.fail_sends(false);
        a.send(json!(2)).await.unwrap();
        assert_eq!(rx.recv().await, Some(json!(2)));
    }

    #[test]
    fn test_listener_counts() {
        let (a, _b) = MemoryTransport::pair();
        assert_eq!(a.message_listener_count(), 0);
        assert_eq!(a.state_listener_count(), 0);

        let rx = a.subscribe();
        let watch = a.watch_state();
        assert_eq!(a.message_listener_count(), 1);
        assert_eq!(a.state_listener_count(), 1);

        drop(rx);
        drop(watch);
        assert_eq!(a.message_listener_count(), 0);
        assert_eq!(a.state_listener_count(), 0);
    }
}
