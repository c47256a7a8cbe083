//! # scribe-ot — JSON0/TEXT0 operational transformation
//!
//! The pure transformation layer under the scribe client: applies,
//! inverts, and compacts JSON0 operation lists against in-memory
//! [`serde_json::Value`] trees, with the TEXT0 string subtype embedded at
//! string leaves.
//!
//! ## Modules
//!
//! - [`path`] — path segments and lookup/write over JSON values
//! - [`op`] — the operation model and its wire shape
//! - [`json0`] — apply / invert / append
//! - [`text0`] — the embedded string subtype (UTF-16 offsets)
//!
//! No I/O and no async here; the networked client layers on top.

pub mod error;
pub mod json0;
pub mod op;
pub mod path;
pub mod text0;

pub use error::OtError;
pub use op::{JsonOp, OpKind};
pub use path::{format_path, lookup, write, Path, PathSegment};
pub use text0::{TextEdit, TextOp};
