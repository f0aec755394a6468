//! Error types for transports and multiplexed streams.
//!
//! Failures stay local: a [`TransportError`] is reported only to the stream
//! operation whose frame failed to send, and a [`StreamError`] never reaches
//! the session or sibling streams.

// Rust guideline compliant 2026-02

use thiserror::Error;

/// Errors raised by a [`Transport`](crate::transport::Transport) send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport is closed (or closed while a send waited for it to open).
    #[error("transport closed")]
    Closed,
    /// The transport is not open yet and the adapter cannot buffer.
    #[error("transport not open")]
    NotOpen,
    /// The underlying connection rejected the message.
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Errors surfaced by [`MuxStream`](crate::stream::MuxStream) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The stream was destroyed before or during the operation.
    #[error("stream destroyed")]
    Destroyed,
    /// A write or finish was attempted after `finish()`.
    #[error("write after end")]
    WriteAfterEnd,
    /// The frame carrying this operation could not be sent.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_converts_into_stream_error() {
        let err: StreamError = TransportError::SendFailed("boom".into()).into();
        assert_eq!(err, StreamError::Transport(TransportError::SendFailed("boom".into())));
        assert_eq!(err.to_string(), "send failed: boom");
    }

    #[test]
    fn test_destroyed_message() {
        assert_eq!(StreamError::Destroyed.to_string(), "stream destroyed");
    }
}
