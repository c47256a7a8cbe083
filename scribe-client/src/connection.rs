//! Connection lifecycle, inbound routing, and registries.
//!
//! One connection owns one WebSocket. A single reader task is the
//! serialization point for every inbound frame; outbound frames go
//! through a mutex-held sink so sequence stamping and the byte write are
//! atomic with respect to each other, which is what makes on-wire `seq`
//! strictly increasing.
//!
//! ```text
//! caller tasks ──┐                         ┌── reader task
//!                ▼                         ▼
//!        ┌──────────────┐   frames   ┌───────────┐
//!        │ send (sink   │ ─────────► │ dispatch  │
//!        │ lock + seq)  │ ◄───────── │ by action │
//!        └──────┬───────┘  WebSocket └─────┬─────┘
//!               │                          │
//!        ┌──────▼──────────────────────────▼─────┐
//!        │ registries: (collection, key) → Doc   │
//!        │             query id → QueryCollection│
//!        └───────────────────────────────────────┘
//! ```
//!
//! On socket close with reconnect configured: every document is paused,
//! the socket reopens, the handshake replays with the retained client id
//! (the server resumes the session), and documents resume, draining
//! their queues.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::document::{deriver_for, DocShared, Deriver, Document};
use crate::error::ClientError;
use crate::protocol::{
    self, is_json0_type, ErrorInfo, HandshakeMessage, Message, QuerySubscribeMessage,
    PROTOCOL_MINOR, PROTOCOL_VERSION,
};
use crate::query::{QueryCollection, QueryShared};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Reopen the socket and resume documents after a close.
    pub reconnect: bool,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Give up after this many failed attempts.
    pub max_reconnect_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }
}

/// Connection state, readable from any handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

struct Outbound {
    sink: Option<WsSink>,
    /// Next op sequence number. Starts at 1; survives reconnects because
    /// the server resumes the session under the retained client id.
    op_seq: u64,
}

pub(crate) struct ConnectionInner {
    url: String,
    config: ClientConfig,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    client_id: RwLock<Option<String>>,
    default_type: RwLock<Option<String>>,
    documents: RwLock<HashMap<(String, String), Arc<DocShared>>>,
    queries: RwLock<HashMap<u64, Arc<QueryShared>>>,
    outbound: Mutex<Outbound>,
    query_seq: AtomicU64,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionInner {
    pub(crate) fn new(url: String, config: ClientConfig) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        Arc::new(ConnectionInner {
            url,
            config,
            state_tx,
            state_rx,
            client_id: RwLock::new(None),
            default_type: RwLock::new(None),
            documents: RwLock::new(HashMap::new()),
            queries: RwLock::new(HashMap::new()),
            outbound: Mutex::new(Outbound {
                sink: None,
                op_seq: 1,
            }),
            query_seq: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    pub(crate) async fn client_id(&self) -> Option<String> {
        self.client_id.read().await.clone()
    }

    /// Dial the socket, spawn the reader, send the handshake.
    async fn open_socket(self: &Arc<Self>) -> Result<(), ClientError> {
        self.set_state(ConnectionState::Connecting);
        let (ws, _) = tokio_tungstenite::connect_async(&self.url)
            .await
            .map_err(|e| {
                self.set_state(ConnectionState::Disconnected);
                ClientError::Transport(e.to_string())
            })?;
        let (sink, source) = ws.split();
        {
            let mut out = self.outbound.lock().await;
            out.sink = Some(sink);
        }

        let reader = tokio::spawn(spawn_read_loop(Arc::clone(self), source));
        self.tasks.lock().await.push(reader);

        let retained = self.client_id().await;
        self.send(Message::Handshake(HandshakeMessage {
            id: retained,
            protocol: Some(PROTOCOL_VERSION),
            protocol_minor: Some(PROTOCOL_MINOR),
            type_url: None,
        }))
        .await
    }

    /// Serialize a frame and write it, stamping operation frames with the
    /// next sequence number under the sink lock. Suspends until the
    /// socket accepts the bytes.
    pub(crate) async fn send(&self, msg: Message) -> Result<(), ClientError> {
        let mut out = self.outbound.lock().await;
        if out.sink.is_none() {
            return Err(ClientError::NotConnected);
        }
        let msg = match msg {
            Message::Operation(mut op) => {
                // The server assumes seq monotonicity for the whole client
                // session; on wrap the only safe move is to drop the link.
                let Some(next) = out.op_seq.checked_add(1) else {
                    out.sink = None;
                    self.set_state(ConnectionState::Disconnected);
                    log::error!("outbound sequence exhausted; forcing disconnect");
                    return Err(ClientError::SequenceExhausted);
                };
                op.sequence = out.op_seq;
                out.op_seq = next;
                Message::Operation(op)
            }
            other => other,
        };
        let text = msg.encode()?;
        let sink = out.sink.as_mut().ok_or(ClientError::NotConnected)?;
        sink.send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    pub(crate) async fn find_document(
        &self,
        collection: &str,
        key: &str,
    ) -> Option<Arc<DocShared>> {
        self.documents
            .read()
            .await
            .get(&(collection.to_string(), key.to_string()))
            .cloned()
    }

    /// Look up or register a document. The registry holds exactly one
    /// entry per id; a second caller with a different entity type gets
    /// `DocumentEntityType` instead of a second document.
    pub(crate) async fn get_or_create_shared(
        self: &Arc<Self>,
        collection: &str,
        key: &str,
        entity_type: TypeId,
        entity_type_name: &'static str,
        derive: impl FnOnce() -> Deriver,
    ) -> Result<Arc<DocShared>, ClientError> {
        let id = (collection.to_string(), key.to_string());
        if let Some(existing) = self.documents.read().await.get(&id) {
            return check_entity_type(existing, entity_type);
        }
        let mut docs = self.documents.write().await;
        match docs.entry(id) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                check_entity_type(entry.get(), entity_type)
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let shared = DocShared::new(
                    collection,
                    key,
                    Arc::downgrade(self),
                    entity_type,
                    entity_type_name,
                    derive(),
                );
                entry.insert(Arc::clone(&shared));
                Ok(shared)
            }
        }
    }

    async fn find_query(&self, id: u64) -> Option<Arc<QueryShared>> {
        self.queries.read().await.get(&id).cloned()
    }

    async fn pause_all(&self) {
        let docs: Vec<_> = self.documents.read().await.values().cloned().collect();
        for doc in docs {
            if let Err(e) = doc.pause().await {
                log::debug!("pause skipped: {e}");
            }
        }
    }

    async fn resume_all(&self) {
        let docs: Vec<_> = self.documents.read().await.values().cloned().collect();
        for doc in docs {
            if let Err(e) = doc.resume().await {
                log::debug!("resume skipped: {e}");
            }
        }
    }

    async fn close_socket(&self) {
        let mut out = self.outbound.lock().await;
        if let Some(mut sink) = out.sink.take() {
            let _ = sink.close().await;
        }
    }
}

fn check_entity_type(
    existing: &Arc<DocShared>,
    entity_type: TypeId,
) -> Result<Arc<DocShared>, ClientError> {
    if existing.entity_type != entity_type {
        return Err(ClientError::DocumentEntityType {
            collection: existing.collection.clone(),
            key: existing.key.clone(),
            registered: existing.entity_type_name,
        });
    }
    Ok(Arc::clone(existing))
}

/// Open a connection and send the handshake. Returns once the handshake
/// frame is written; the assigned client id arrives on the reader task
/// (await [`Connection::wait_state`] to observe it).
pub async fn connect(
    url: impl Into<String>,
    config: ClientConfig,
) -> Result<Connection, ClientError> {
    let inner = ConnectionInner::new(url.into(), config);
    inner.open_socket().await?;
    Ok(Connection { inner })
}

/// Handle onto a live connection. Cheap to clone; the last handle
/// dropping does not close the socket — call [`Connection::shutdown`].
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_state(&self, target: ConnectionState) {
        let mut rx = self.inner.state_rx.clone();
        loop {
            if *rx.borrow() == target {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The server-assigned client identity, once the handshake reply has
    /// been processed.
    pub async fn client_id(&self) -> Option<String> {
        self.inner.client_id().await
    }

    /// The default OT type the server offered in the handshake.
    pub async fn default_type(&self) -> Option<String> {
        self.inner.default_type.read().await.clone()
    }

    /// Look up or register a document without subscribing it.
    pub async fn get_document<E>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Document<E>, ClientError>
    where
        E: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let shared = self
            .inner
            .get_or_create_shared(
                collection,
                key,
                TypeId::of::<E>(),
                std::any::type_name::<E>(),
                deriver_for::<E>,
            )
            .await?;
        Ok(Document::from_shared(shared))
    }

    /// Register a document and send its subscribe frame. Returns once the
    /// frame is written; the snapshot arrives on the value stream.
    pub async fn subscribe_document<E>(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Document<E>, ClientError>
    where
        E: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let doc = self.get_document::<E>(collection, key).await?;
        doc.subscribe().await?;
        Ok(doc)
    }

    /// Create a document under a freshly generated key.
    pub async fn create<E>(&self, entity: &E, collection: &str) -> Result<Document<E>, ClientError>
    where
        E: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let key = Uuid::new_v4().to_string();
        let doc = self.get_document::<E>(collection, &key).await?;
        doc.create(entity).await?;
        Ok(doc)
    }

    /// Subscribe a query: allocate an id, register the collection, send
    /// `qs`. Results and diffs stream onto the collection's watch channel.
    pub async fn subscribe_query<E>(
        &self,
        query: Value,
        collection: &str,
    ) -> Result<QueryCollection<E>, ClientError>
    where
        E: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let id = self.inner.query_seq.fetch_add(1, Ordering::SeqCst);
        let shared = QueryShared::new(
            id,
            collection,
            Arc::downgrade(&self.inner),
            TypeId::of::<E>(),
            std::any::type_name::<E>(),
            Box::new(deriver_for::<E>),
        );
        self.inner
            .queries
            .write()
            .await
            .insert(id, Arc::clone(&shared));

        let msg = Message::QuerySubscribe(QuerySubscribeMessage {
            query_id: id,
            collection: collection.to_string(),
            query: Some(query),
            data: None,
        });
        if let Err(e) = self.inner.send(msg).await {
            self.inner.queries.write().await.remove(&id);
            return Err(e);
        }
        Ok(QueryCollection::from_shared(shared))
    }

    /// Pause every registered document and close the socket. No automatic
    /// reconnect follows an explicit disconnect.
    pub async fn disconnect(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.pause_all().await;
        self.inner.close_socket().await;
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Disconnect and abort the background tasks.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }
    }
}

/// The reader task: decode and dispatch until the socket closes, then
/// hand off to the reconnect path.
/// Boxes the reader future so its opaque type doesn't structurally embed
/// `open_socket`'s (which it may itself spawn on reconnect), breaking the
/// cyclic `Send` inference that direct recursion between the two triggers.
fn spawn_read_loop(
    inner: Arc<ConnectionInner>,
    source: WsSource,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(read_loop(inner, source))
}

async fn read_loop(inner: Arc<ConnectionInner>, mut source: WsSource) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                if let Err(e) = dispatch(&inner, text.as_str()).await {
                    // A bad frame never takes the connection down.
                    log::warn!("inbound frame dropped: {e}");
                }
            }
            Ok(WsMessage::Close(_)) => {
                log::info!("server closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("websocket error: {e}");
                break;
            }
        }
    }
    on_disconnect(inner).await;
}

/// Route one inbound frame.
async fn dispatch(inner: &Arc<ConnectionInner>, text: &str) -> Result<(), ClientError> {
    let frame = protocol::decode(text)?;
    if let Some(error) = frame.error {
        return handle_error_frame(inner, error, frame.message).await;
    }

    match frame.message {
        Message::Handshake(hs) => {
            if let Some(id) = hs.id {
                log::debug!("handshake complete, client id {id}");
                *inner.client_id.write().await = Some(id);
            }
            let unsupported = match hs.type_url {
                Some(t) if is_json0_type(&t) => {
                    *inner.default_type.write().await = Some(t);
                    None
                }
                Some(t) => Some(t),
                None => None,
            };
            inner.set_state(ConnectionState::Connected);
            match unsupported {
                Some(t) => Err(ClientError::UnsupportedType(t)),
                None => Ok(()),
            }
        }
        Message::Subscribe(sub) => {
            let doc = inner
                .find_document(&sub.collection, &sub.document)
                .await
                .ok_or_else(|| ClientError::UnknownDocument {
                    collection: sub.collection.clone(),
                    key: sub.document.clone(),
                })?;
            match sub.data {
                Some(snap) => match (snap.data, snap.version) {
                    (Some(data), Some(v)) => doc.put(data, v, snap.type_url).await,
                    (Some(_), None) => {
                        Err(ClientError::Violation("snapshot without version".into()))
                    }
                    (None, _) => doc.set_not_created().await,
                },
                None => {
                    log::debug!(
                        "subscribe ack without snapshot for {}/{}",
                        sub.collection,
                        sub.document
                    );
                    Ok(())
                }
            }
        }
        Message::Operation(op) => {
            let doc = inner
                .find_document(&op.collection, &op.document)
                .await
                .ok_or_else(|| ClientError::UnknownDocument {
                    collection: op.collection.clone(),
                    key: op.document.clone(),
                })?;
            let ours = {
                let id = inner.client_id.read().await;
                id.is_some() && *id == op.source
            };
            if ours {
                let v = op
                    .version
                    .ok_or_else(|| ClientError::Violation("ack without version".into()))?;
                doc.ack(v, op.sequence).await
            } else {
                let data = op
                    .data
                    .ok_or_else(|| ClientError::Violation("remote op without data".into()))?;
                doc.sync(data, op.version).await
            }
        }
        Message::QuerySubscribe(qs) => {
            let query = inner
                .find_query(qs.query_id)
                .await
                .ok_or(ClientError::UnknownQuery(qs.query_id))?;
            query.put(qs.data.unwrap_or_default()).await
        }
        Message::QueryDiff(qd) => {
            let query = inner
                .find_query(qd.query_id)
                .await
                .ok_or(ClientError::UnknownQuery(qd.query_id))?;
            query.sync(qd.diff).await
        }
    }
}

/// An error frame: re-dispatch on the operation it refers to.
async fn handle_error_frame(
    inner: &Arc<ConnectionInner>,
    error: ErrorInfo,
    message: Message,
) -> Result<(), ClientError> {
    match message {
        Message::Operation(op) => {
            let doc = inner
                .find_document(&op.collection, &op.document)
                .await
                .ok_or_else(|| ClientError::UnknownDocument {
                    collection: op.collection.clone(),
                    key: op.document.clone(),
                })?;
            doc.handle_server_error(&error).await
        }
        other => {
            log::warn!(
                "server error on {} frame: {}: {}",
                other.action(),
                error.code,
                error.message
            );
            Ok(())
        }
    }
}

/// Socket closed: pause everything, then either stop (explicit shutdown,
/// reconnect disabled) or loop reopening the socket. A successful reopen
/// replays the handshake with the retained client id and resumes every
/// document, draining queued ops.
async fn on_disconnect(inner: Arc<ConnectionInner>) {
    {
        let mut out = inner.outbound.lock().await;
        out.sink = None;
    }
    if inner.shutting_down.load(Ordering::SeqCst) || !inner.config.reconnect {
        inner.set_state(ConnectionState::Disconnected);
        return;
    }
    inner.pause_all().await;
    inner.set_state(ConnectionState::Reconnecting);

    for attempt in 1..=inner.config.max_reconnect_attempts {
        tokio::time::sleep(inner.config.reconnect_delay).await;
        log::info!(
            "reconnect attempt {attempt}/{}",
            inner.config.max_reconnect_attempts
        );
        match inner.open_socket().await {
            Ok(()) => {
                inner.resume_all().await;
                return;
            }
            Err(e) => log::warn!("reconnect failed: {e}"),
        }
    }
    log::error!(
        "giving up after {} reconnect attempts",
        inner.config.max_reconnect_attempts
    );
    inner.set_state(ConnectionState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        #[serde(rename = "numClicks")]
        num_clicks: i64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        body: String,
    }

    fn detached() -> Connection {
        Connection {
            inner: ConnectionInner::new("ws://127.0.0.1:1".into(), ClientConfig::default()),
        }
    }

    #[tokio::test]
    async fn registry_returns_the_same_document() {
        let conn = detached();
        let a = conn.get_document::<Counter>("examples", "counter").await.unwrap();
        let b = conn.get_document::<Counter>("examples", "counter").await.unwrap();
        assert!(Arc::ptr_eq(&a.shared, &b.shared));
    }

    #[tokio::test]
    async fn registry_rejects_entity_type_mismatch() {
        let conn = detached();
        conn.get_document::<Counter>("examples", "counter").await.unwrap();
        let err = conn.get_document::<Note>("examples", "counter").await;
        assert!(matches!(
            err,
            Err(ClientError::DocumentEntityType { .. })
        ));
    }

    #[tokio::test]
    async fn send_without_socket_is_not_connected() {
        let conn = detached();
        let err = conn
            .inner
            .send(Message::Handshake(HandshakeMessage::default()))
            .await;
        assert!(matches!(err, Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn query_ids_are_allocated_monotonically() {
        let conn = detached();
        assert_eq!(conn.inner.query_seq.fetch_add(1, Ordering::SeqCst), 1);
        assert_eq!(conn.inner.query_seq.fetch_add(1, Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dispatch_handshake_records_identity_and_type() {
        let conn = detached();
        let text = json!({
            "a": "hs",
            "id": "c1",
            "type": crate::protocol::JSON0_TYPE_URL,
        })
        .to_string();
        dispatch(&conn.inner, &text).await.unwrap();
        assert_eq!(conn.client_id().await.as_deref(), Some("c1"));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.default_type().await.is_some());
    }

    #[tokio::test]
    async fn dispatch_unknown_default_type_errors_but_connects() {
        let conn = detached();
        let text = json!({"a": "hs", "id": "c1", "type": "rich-text"}).to_string();
        let err = dispatch(&conn.inner, &text).await;
        assert!(matches!(err, Err(ClientError::UnsupportedType(_))));
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.default_type().await.is_none());
    }

    #[tokio::test]
    async fn dispatch_subscribe_for_unknown_document_is_a_violation() {
        let conn = detached();
        let text = json!({"a": "s", "c": "examples", "d": "ghost", "data": {"v": 1, "data": {}}})
            .to_string();
        assert!(matches!(
            dispatch(&conn.inner, &text).await,
            Err(ClientError::UnknownDocument { .. })
        ));
    }

    #[tokio::test]
    async fn dispatch_routes_snapshot_and_not_created() {
        let conn = detached();
        let doc = conn.get_document::<Counter>("examples", "counter").await.unwrap();
        doc.subscribe().await.unwrap_err(); // no socket; Blank -> FetchError

        let doc2 = conn.get_document::<Counter>("examples", "other").await.unwrap();
        let text = json!({
            "a": "s", "c": "examples", "d": "other",
            "data": {"v": 3, "data": {"numClicks": 5}},
        })
        .to_string();
        dispatch(&conn.inner, &text).await.unwrap();
        assert_eq!(doc2.version().await, Some(3));
        assert_eq!(doc2.entity().await.unwrap().num_clicks, 5);

        let doc3 = conn.get_document::<Counter>("examples", "missing").await.unwrap();
        {
            // Force Pending so the not-created signal is legal.
            let mut core = doc3.shared.core.lock().await;
            core.state = crate::document::DocState::Pending;
        }
        let text = json!({"a": "s", "c": "examples", "d": "missing", "data": {"v": 0}}).to_string();
        dispatch(&conn.inner, &text).await.unwrap();
        assert_eq!(doc3.state().await, crate::document::DocState::NotCreated);
    }
}
