//! Error taxonomy for the transformation engine.

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by path walking, `apply`, and `invert`.
///
/// `apply` is all-or-nothing: when any of these comes back, the input
/// value was left untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OtError {
    /// A parent along the path is missing or is the wrong container kind,
    /// or the path itself cannot address the operation (empty path, key
    /// into a sequence, index into a mapping).
    #[error("invalid path {0}")]
    InvalidPath(String),

    /// The pre-image carried by a delete/replace does not match what the
    /// document holds.
    #[error("stale data at {path}: op expected {expected}, document holds {found}")]
    OldDataMismatch {
        path: String,
        expected: Value,
        found: Value,
    },

    /// A sequence or string offset is out of range.
    #[error("index {index} out of range at {path} (len {len})")]
    IndexOutOfRange {
        path: String,
        index: usize,
        len: usize,
    },

    /// Payload is not valid for the target: numeric kind mismatch,
    /// overflow, or a malformed subtype body.
    #[error("invalid JSON data: {0}")]
    InvalidJsonData(String),

    /// The operation carries no recognized keyed form, or more than one.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The `t` tag names a subtype this engine does not implement.
    #[error("unsupported subtype {0:?}")]
    UnsupportedSubtype(String),
}
