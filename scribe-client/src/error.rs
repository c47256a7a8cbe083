//! Client error taxonomy.
//!
//! Transport and codec problems, protocol violations, illegal document
//! state transitions, and OT failures all funnel into [`ClientError`].
//! Errors raised while dispatching inbound frames are logged and dropped
//! by the reader task; errors on caller-initiated operations propagate.

use thiserror::Error;

use scribe_ot::OtError;

use crate::document::StateError;
use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket-level failure. Triggers reconnect when configured.
    #[error("transport error: {0}")]
    Transport(String),

    /// Wire codec failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A JSON0/TEXT0 operation failed; the document was left untouched.
    #[error(transparent)]
    Ot(#[from] OtError),

    /// An illegal document state transition; nothing was mutated.
    #[error(transparent)]
    State(#[from] StateError),

    /// No socket is installed (never connected, or mid-reconnect).
    #[error("not connected")]
    NotConnected,

    /// The outbound sequence counter wrapped; the connection was forced
    /// closed rather than reusing sequence numbers.
    #[error("outbound sequence exhausted")]
    SequenceExhausted,

    /// The document is already registered under a different entity type.
    #[error("document {collection}/{key} is registered with entity type {registered}")]
    DocumentEntityType {
        collection: String,
        key: String,
        registered: &'static str,
    },

    /// `subscribe` on a document that already left the Blank state.
    #[error("document already subscribed")]
    AlreadySubscribed,

    /// `change` on a document with no snapshot installed yet.
    #[error("document has no snapshot to change")]
    MissingValue,

    /// An ack or remote op landed at the wrong version.
    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u64, got: u64 },

    /// The handshake offered a default OT type this client cannot speak.
    #[error("unsupported OT type {0:?}")]
    UnsupportedType(String),

    /// An inbound frame routed to a document this connection never
    /// registered.
    #[error("unknown document {collection}/{key}")]
    UnknownDocument { collection: String, key: String },

    /// An inbound frame routed to a query id this connection never
    /// allocated.
    #[error("unknown query {0}")]
    UnknownQuery(u64),

    /// A well-formed frame that makes no sense here: ack with nothing in
    /// flight, op without data.
    #[error("protocol violation: {0}")]
    Violation(String),

    /// Snapshot data does not decode to the registered entity type.
    #[error("entity decode failed: {0}")]
    EntityDecode(String),

    /// The caller's entity does not encode to JSON.
    #[error("entity encode failed: {0}")]
    EntityEncode(String),
}
