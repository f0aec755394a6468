//! Wire frames for the stream multiplexer.
//!
//! Every frame is a JSON object carrying the protocol tag in `source`, a
//! frame kind in `type`, and the owning stream's `key`:
//!
//! ```text
//! { "source": TAG, "type": "stream.data",    "key": KEY, "payload": "<base64>" }
//! { "source": TAG, "type": "stream.control", "key": KEY, "payload": CONTROL }
//!
//! CONTROL := {"type":"create","value"?:any}
//!          | {"type":"canPushNext","value":bool}
//!          | {"type":"end"}
//!          | {"type":"destroy"}
//! ```
//!
//! Decoding is deliberately forgiving about *which* messages it sees: the
//! transport may carry unrelated traffic, so anything without the tag, not
//! shaped like an object, or failing to decode yields `None` rather than an
//! error.
//!
//! Data payloads are written as standard base64. On input, an array of
//! octets and a Node.js `Buffer` JSON object (`{"type":"Buffer","data":[..]}`)
//! are accepted as well.

// Rust guideline compliant 2026-02

use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::id::StreamId;

/// Default protocol tag placed in every frame's `source` field.
pub const DEFAULT_PROTOCOL_TAG: &str = "ws-send-stream";

/// `type` value of data frames.
const DATA_TYPE: &str = "stream.data";

/// `type` value of control frames.
const CONTROL_TYPE: &str = "stream.control";

/// Control payload carried by a `stream.control` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Control {
    /// Open a stream on the peer, optionally carrying init data.
    Create {
        /// Application-defined init payload.
        #[serde(default)]
        value: Option<Value>,
    },
    /// Grant (`true`) or revoke (`false`) the peer's write credit.
    CanPushNext {
        /// Whether the peer may keep writing.
        value: bool,
    },
    /// The sender finished writing; no more data follows.
    End,
    /// The sender destroyed its end of the stream.
    Destroy,
}

impl Control {
    fn to_value(&self) -> Value {
        match self {
            Self::Create { value: Some(v) } => json!({ "type": "create", "value": v }),
            Self::Create { value: None } => json!({ "type": "create" }),
            Self::CanPushNext { value } => json!({ "type": "canPushNext", "value": value }),
            Self::End => json!({ "type": "end" }),
            Self::Destroy => json!({ "type": "destroy" }),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::CanPushNext { .. } => "canPushNext",
            Self::End => "end",
            Self::Destroy => "destroy",
        }
    }
}

/// Frame body: stream bytes or a control message.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// Stream payload bytes.
    Data(Bytes),
    /// Lifecycle or flow-control message.
    Control(Control),
}

/// A decoded frame addressed to one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Owning stream.
    pub key: StreamId,
    /// Frame contents.
    pub body: FrameBody,
}

/// Data payload encodings accepted on input.
#[derive(Deserialize)]
#[serde(untagged)]
enum WirePayload {
    Base64(String),
    Octets(Vec<u8>),
    NodeBuffer { data: Vec<u8> },
}

impl WirePayload {
    fn into_bytes(self) -> Option<Bytes> {
        match self {
            Self::Base64(s) => base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .ok()
                .map(Bytes::from),
            Self::Octets(v) | Self::NodeBuffer { data: v } => Some(Bytes::from(v)),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum Envelope {
    #[serde(rename = "stream.data")]
    Data { key: String, payload: WirePayload },
    #[serde(rename = "stream.control")]
    Control { key: String, payload: Control },
}

impl Frame {
    /// Build a data frame.
    pub fn data(key: StreamId, payload: Bytes) -> Self {
        Self { key, body: FrameBody::Data(payload) }
    }

    /// Build a control frame.
    pub fn control(key: StreamId, control: Control) -> Self {
        Self { key, body: FrameBody::Control(control) }
    }

    /// Encode into a wire message tagged with `tag`.
    pub fn encode(&self, tag: &str) -> Value {
        match &self.body {
            FrameBody::Data(bytes) => json!({
                "source": tag,
                "type": DATA_TYPE,
                "key": self.key.0,
                "payload": base64::engine::general_purpose::STANDARD.encode(bytes),
            }),
            FrameBody::Control(control) => json!({
                "source": tag,
                "type": CONTROL_TYPE,
                "key": self.key.0,
                "payload": control.to_value(),
            }),
        }
    }

    /// Decode a wire message, returning `None` for anything that is not a
    /// well-formed frame carrying `tag`.
    pub fn decode(message: &Value, tag: &str) -> Option<Self> {
        let object = message.as_object()?;
        if object.get("source").and_then(Value::as_str) != Some(tag) {
            return None;
        }
        let envelope = match Envelope::deserialize(message) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::trace!("[Mux] Dropping malformed frame: {e}");
                return None;
            }
        };
        match envelope {
            Envelope::Data { key, payload } => {
                let Some(bytes) = payload.into_bytes() else {
                    log::trace!("[Mux] Dropping data frame with undecodable payload");
                    return None;
                };
                Some(Self::data(StreamId(key), bytes))
            }
            Envelope::Control { key, payload } => Some(Self::control(StreamId(key), payload)),
        }
    }
}

/// Concatenate written chunks into one payload buffer.
///
/// A single chunk is copied once; several are packed into one contiguous
/// allocation so each write maps to exactly one data frame.
pub fn concat_chunks<I, B>(chunks: I) -> Bytes
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    let mut buf = BytesMut::new();
    for chunk in chunks {
        buf.extend_from_slice(chunk.as_ref());
    }
    buf.freeze()
}
