//! Botster Mux - multiplexed duplex byte-streams over one connection.
//!
//! Many independent, ordered byte-streams share a single message-framed
//! transport (typically one WebSocket). Each stream has its own
//! create/end/destroy lifecycle and its own flow control in each direction.
//!
//! # Architecture
//!
//! - **Session** - Owns the stream map for one transport, opens local
//!   streams and accepts the peer's
//! - **MuxStream** - One logical duplex byte-stream with credit-based
//!   backpressure and in-order frame dispatch
//! - **Transport** - Message-framed connection the session rides on
//!   (in-memory pair or WebSocket)
//!
//! # Modules
//!
//! - [`session`] - Stream map, inbound dispatch, stream acceptance
//! - [`stream`] - The multiplexed stream
//! - [`protocol`] - Wire frames
//! - [`transport`] - Transport trait and adapters
//! - [`config`] - Configuration loading
//!
//! ```ignore
//! let (a, b) = MemoryTransport::pair();
//! let client = Session::new(a);
//! let server = Session::new(b);
//!
//! let stream = client.create_stream(Some(json!({"room": "x"})));
//! stream.write("hello").await?;
//!
//! let incoming = server.accept().await.unwrap();
//! assert_eq!(incoming.stream.read().await?.as_deref(), Some(&b"hello"[..]));
//! ```

// Library modules
pub mod config;
pub mod error;
pub mod id;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod transport;

mod duplex;
mod queue;

// Re-export commonly used types
pub use config::MuxConfig;
pub use error::{StreamError, TransportError};
pub use id::{KeyGenerator, RandomKeys, StreamId};
pub use session::{IncomingStream, Session};
pub use stream::{Direction, MuxStream};
pub use transport::{MemoryTransport, Transport, TransportState, WsTransport};
