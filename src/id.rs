//! Stream identifiers and their generation.

use serde::{Deserialize, Serialize};

/// Opaque stream identifier, unique within one session's namespace.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub String);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Truncate for display; remote keys may not be ASCII
        match self.0.get(..8) {
            Some(prefix) if self.0.len() > 8 => write!(f, "{prefix}..."),
            _ => write!(f, "{}", self.0),
        }
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Source of fresh identifiers for locally-initiated streams.
///
/// Implementations only need to be random enough; the session retries when a
/// generated key collides with one it already holds.
pub trait KeyGenerator: Send + Sync + std::fmt::Debug {
    /// Produce a new identifier.
    fn generate(&self) -> StreamId;
}

/// Default generator: a v4 UUID rendered as 32 lowercase hex characters.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomKeys;

impl KeyGenerator for RandomKeys {
    fn generate(&self) -> StreamId {
        StreamId(uuid::Uuid::new_v4().simple().to_string())
    }
}
