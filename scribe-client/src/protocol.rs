//! Wire codec for the ShareDB JSON protocol.
//!
//! Every frame is a UTF-8 JSON text message discriminated by `a`:
//!
//! ```text
//! ┌────┬──────────────────┬──────────────────────────────────────────┐
//! │ a  │ frame            │ payload                                  │
//! ├────┼──────────────────┼──────────────────────────────────────────┤
//! │ hs │ handshake        │ id, protocol, protocolMinor, type        │
//! │ s  │ subscribe        │ c, d, v?  /  reply adds data{v,data,type}│
//! │ op │ operation        │ c, d, src, seq, v + create | op | del    │
//! │ qs │ query subscribe  │ id, c, q  /  reply adds data[…]          │
//! │ q  │ query diff       │ id, diff[…]                              │
//! └────┴──────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The short field names (`c`, `d`, `v`, `src`, `seq`, `id`) are
//! wire-mandatory; Rust-side structs use descriptive names and rename.
//! String offsets inside `op` payloads count UTF-16 code units (see
//! `scribe_ot::text0`). Error replies carry the triggering action's
//! fields plus `error: {code, message}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use scribe_ot::JsonOp;

/// Protocol revision sent in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MINOR: u32 = 1;

/// The default OT type URL ShareDB uses for JSON0.
pub const JSON0_TYPE_URL: &str = "http://sharejs.org/types/JSONv0";
/// Short alias some servers send instead of the full URL.
pub const JSON0_TYPE_NAME: &str = "json0";

/// True when the tag names the one OT type this client implements.
pub fn is_json0_type(tag: &str) -> bool {
    tag == JSON0_TYPE_URL || tag == JSON0_TYPE_NAME
}

/// Codec failures. Encode failures are internal bugs; decode failures of
/// inbound frames are logged and dropped by the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("unknown action {0:?}")]
    UnknownAction(String),
}

/// `error: {code, message}` attached to a reply frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// The closed set of server error codes this client reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorCode {
    OpSubmitRejected,
    PendingOpRemovedByOpSubmitRejected,
    OpAlreadySubmitted,
    SubmitTransformOpsNotFound,
    MaxSubmitRetriesExceeded,
    DocAlreadyCreated,
    DocWasDeleted,
    DocTypeNotRecognized,
    DefaultTypeMismatch,
    OpNotAllowedInProjection,
    TypeCannotBeProjected,
}

impl ServerErrorCode {
    pub fn parse(code: &str) -> Option<Self> {
        use ServerErrorCode::*;
        Some(match code {
            "ERR_OP_SUBMIT_REJECTED" => OpSubmitRejected,
            "ERR_PENDING_OP_REMOVED_BY_OP_SUBMIT_REJECTED" => PendingOpRemovedByOpSubmitRejected,
            "ERR_OP_ALREADY_SUBMITTED" => OpAlreadySubmitted,
            "ERR_SUBMIT_TRANSFORM_OPS_NOT_FOUND" => SubmitTransformOpsNotFound,
            "ERR_MAX_SUBMIT_RETRIES_EXCEEDED" => MaxSubmitRetriesExceeded,
            "ERR_DOC_ALREADY_CREATED" => DocAlreadyCreated,
            "ERR_DOC_WAS_DELETED" => DocWasDeleted,
            "ERR_DOC_TYPE_NOT_RECOGNIZED" => DocTypeNotRecognized,
            "ERR_DEFAULT_TYPE_MISMATCH" => DefaultTypeMismatch,
            "ERR_OP_NOT_ALLOWED_IN_PROJECTION" => OpNotAllowedInProjection,
            "ERR_TYPE_CANNOT_BE_PROJECTED" => TypeCannotBeProjected,
            _ => return None,
        })
    }
}

/// Handshake, both directions. The client sends `id` only when it retains
/// one from a previous session (reconnect); the server assigns or echoes
/// it, and may name a default OT type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HandshakeMessage {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub protocol: Option<u32>,
    #[serde(
        rename = "protocolMinor",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub protocol_minor: Option<u32>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub type_url: Option<String>,
}

/// Subscribe request and reply. The reply carries `data`; a present
/// envelope with neither snapshot data nor a type means the document does
/// not exist upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeMessage {
    #[serde(rename = "c")]
    pub collection: String,
    #[serde(rename = "d")]
    pub document: String,
    #[serde(rename = "v", skip_serializing_if = "Option::is_none", default)]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<SubscribeSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeSnapshot {
    #[serde(rename = "v", skip_serializing_if = "Option::is_none", default)]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub type_url: Option<String>,
}

/// The payload of an operation frame: exactly one of `create`, `op`,
/// `del`. Serde's external tagging produces precisely that wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationData {
    #[serde(rename = "create")]
    Create(CreateData),
    #[serde(rename = "op")]
    Update(Vec<JsonOp>),
    #[serde(rename = "del")]
    Delete(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateData {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub type_url: Option<String>,
    pub data: Value,
}

/// Operation frame. Outbound frames leave `sequence` at 0; the connection
/// stamps the real value while it holds the sink, so on-wire `seq` is
/// strictly increasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMessage {
    #[serde(rename = "c")]
    pub collection: String,
    #[serde(rename = "d")]
    pub document: String,
    #[serde(rename = "src", skip_serializing_if = "Option::is_none", default)]
    pub source: Option<String>,
    #[serde(rename = "seq", default)]
    pub sequence: u64,
    #[serde(rename = "v", skip_serializing_if = "Option::is_none", default)]
    pub version: Option<u64>,
    #[serde(flatten)]
    pub data: Option<OperationData>,
}

/// Query subscribe request and reply. `id` is the client-allocated query
/// id; the reply's `data` is the initial result list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySubscribeMessage {
    #[serde(rename = "id")]
    pub query_id: u64,
    #[serde(rename = "c")]
    pub collection: String,
    #[serde(rename = "q", skip_serializing_if = "Option::is_none", default)]
    pub query: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Vec<QueryResultEntry>>,
}

/// One document in a query result list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResultEntry {
    #[serde(rename = "d")]
    pub document: String,
    #[serde(rename = "v")]
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
    pub type_url: Option<String>,
}

/// Query diff frame: ordered edits to the published result sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDiffMessage {
    #[serde(rename = "id")]
    pub query_id: u64,
    pub diff: Vec<QueryDiff>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueryDiff {
    Move {
        from: usize,
        to: usize,
        #[serde(rename = "howMany")]
        how_many: usize,
    },
    Insert {
        index: usize,
        values: Vec<QueryResultEntry>,
    },
    Remove {
        index: usize,
        #[serde(rename = "howMany")]
        how_many: usize,
    },
}

/// A protocol frame, tagged by action.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(HandshakeMessage),
    Subscribe(SubscribeMessage),
    Operation(OperationMessage),
    QuerySubscribe(QuerySubscribeMessage),
    QueryDiff(QueryDiffMessage),
}

/// A decoded inbound frame: the message plus any server error envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub error: Option<ErrorInfo>,
    pub message: Message,
}

impl Message {
    pub fn action(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "hs",
            Message::Subscribe(_) => "s",
            Message::Operation(_) => "op",
            Message::QuerySubscribe(_) => "qs",
            Message::QueryDiff(_) => "q",
        }
    }

    /// Serialize to a wire frame, inserting the action discriminator.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let body = match self {
            Message::Handshake(m) => serde_json::to_value(m),
            Message::Subscribe(m) => serde_json::to_value(m),
            Message::Operation(m) => serde_json::to_value(m),
            Message::QuerySubscribe(m) => serde_json::to_value(m),
            Message::QueryDiff(m) => serde_json::to_value(m),
        }
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;

        let Value::Object(mut map) = body else {
            return Err(ProtocolError::Encode("frame body must be an object".into()));
        };
        map.insert("a".to_string(), Value::String(self.action().to_string()));
        serde_json::to_string(&Value::Object(map)).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// Decode an inbound text frame.
pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    let Value::Object(mut map) = value else {
        return Err(ProtocolError::Decode("frame is not an object".into()));
    };

    let action = match map.remove("a") {
        Some(Value::String(a)) => a,
        _ => return Err(ProtocolError::Decode("frame has no action".into())),
    };
    let error = match map.remove("error") {
        Some(v) => Some(
            serde_json::from_value::<ErrorInfo>(v)
                .map_err(|e| ProtocolError::Decode(e.to_string()))?,
        ),
        None => None,
    };

    let body = Value::Object(map);
    let message = match action.as_str() {
        "hs" => Message::Handshake(decode_body(body)?),
        "s" => Message::Subscribe(decode_body(body)?),
        "op" => Message::Operation(decode_body(body)?),
        "qs" => Message::QuerySubscribe(decode_body(body)?),
        "q" => Message::QueryDiff(decode_body(body)?),
        other => return Err(ProtocolError::UnknownAction(other.to_string())),
    };
    Ok(Frame { error, message })
}

fn decode_body<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(body).map_err(|e| ProtocolError::Decode(e.to_string()))
}
