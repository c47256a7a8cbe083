//! # scribe-client — real-time collaborative documents over ShareDB
//!
//! A WebSocket client that mirrors JSON documents whose authoritative
//! state lives on a ShareDB-protocol coordination server, reconciling
//! concurrent edits through JSON0 operational transformation
//! (see the `scribe-ot` crate).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ws text frames    ┌──────────────┐
//! │ Connection │ ◄─────────────────► │ ShareDB      │
//! │ (1 socket) │   JSON protocol     │ server       │
//! └─────┬──────┘                     └──────────────┘
//!       │ routes by (collection, key) / query id
//!       ▼
//! ┌────────────┐  one inflight op, FIFO queue
//! │ Document   │  version-checked acks and remote ops
//! │ (per key)  │ ──► watch stream of decoded entities
//! └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — wire codec (`hs`/`s`/`op`/`qs`/`q` frames)
//! - [`connection`] — socket lifecycle, handshake, routing, reconnect
//! - [`document`] — per-document state machine and inflight/queue
//! - [`transaction`] — the change proxy collecting JSON0 ops
//! - [`query`] — server-driven document lists
//!
//! ## Example
//!
//! ```no_run
//! use scribe_client::{connect, ClientConfig};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Counter {
//!     #[serde(rename = "numClicks")]
//!     num_clicks: i64,
//! }
//!
//! # async fn run() -> Result<(), scribe_client::ClientError> {
//! let conn = connect("ws://localhost:8080", ClientConfig::default()).await?;
//! let doc = conn.subscribe_document::<Counter>("examples", "counter").await?;
//! doc.change(|c| c.key("numClicks").set(6)).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod document;
pub mod error;
pub mod protocol;
pub mod query;
pub mod transaction;

pub use connection::{connect, ClientConfig, Connection, ConnectionState};
pub use document::{DocEvent, DocState, Document, EntityWatch, StateError};
pub use error::ClientError;
pub use query::QueryCollection;
pub use transaction::{ChangeContext, Slot};

// The OT layer is part of the public surface: ops appear in protocol
// frames and the proxy emits them.
pub use scribe_ot;
