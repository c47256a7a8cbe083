//! Per-document state machine and inflight/queue discipline.
//!
//! A document mirrors one `(collection, key)` pair on the server. Local
//! edits go out with exactly one operation in flight at a time; further
//! ops wait in a FIFO queue and drain as acks come back. Remote ops apply
//! directly at the version they carry; the server transforms around our
//! inflight op and the ack brings the adjusted version.
//!
//! State machine (anything off this table is a [`StateError`] and
//! mutates nothing; Deleted, NotCreated, and FetchError are terminal):
//!
//! ```text
//!             fetch      put      apply   pause   resume   delete   fail       setNotCreated
//! Blank       Pending    Ready    —       —       —        —        FetchError —
//! Pending     —          Ready    —       —       —        —        FetchError NotCreated
//! Ready       —          Ready    Ready   Paused  Ready    Deleted  —          —
//! Paused      —          —        Paused  —       Ready    Deleted  —          —
//! ```

use std::any::{Any, TypeId};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

use scribe_ot::json0;

use crate::connection::ConnectionInner;
use crate::error::ClientError;
use crate::protocol::{
    CreateData, ErrorInfo, Message, OperationData, OperationMessage, ServerErrorCode,
    SubscribeMessage, JSON0_TYPE_URL,
};
use crate::transaction::ChangeContext;

/// Lifecycle states of a document mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocState {
    Blank,
    Pending,
    Ready,
    Paused,
    Deleted,
    FetchError,
    NotCreated,
}

/// Events the state machine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocEvent {
    Fetch,
    Put,
    Apply,
    Pause,
    Resume,
    Delete,
    Fail,
    SetNotCreated,
}

/// An illegal state transition. Nothing was mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal {event:?} transition from {from:?}")]
pub struct StateError {
    pub from: DocState,
    pub event: DocEvent,
}

pub(crate) fn transition(from: DocState, event: DocEvent) -> Result<DocState, StateError> {
    use DocEvent::*;
    use DocState::*;
    let next = match (from, event) {
        (Blank, Fetch) => Pending,
        (Blank, Put) => Ready,
        (Blank, Fail) => FetchError,
        (Pending, Put) => Ready,
        (Pending, Fail) => FetchError,
        (Pending, SetNotCreated) => NotCreated,
        (Ready, Put) => Ready,
        (Ready, Apply) => Ready,
        (Ready, Pause) => Paused,
        (Ready, Resume) => Ready,
        (Ready, Delete) => Deleted,
        (Paused, Apply) => Paused,
        (Paused, Resume) => Ready,
        (Paused, Delete) => Deleted,
        _ => return Err(StateError { from, event }),
    };
    Ok(next)
}

/// Type-erased decoded entity, downcast by typed handles.
pub(crate) type Entity = Arc<dyn Any + Send + Sync>;

/// Derives the decoded entity from a snapshot; installed by the first
/// typed handle so untyped paths (inbound routing, queries) re-derive on
/// every update.
pub(crate) type Deriver = Box<dyn Fn(&Value) -> Result<Entity, ClientError> + Send + Sync>;

pub(crate) fn deriver_for<E>() -> Deriver
where
    E: DeserializeOwned + Send + Sync + 'static,
{
    Box::new(|value: &Value| {
        serde_json::from_value::<E>(value.clone())
            .map(|entity| Arc::new(entity) as Entity)
            .map_err(|e| ClientError::EntityDecode(e.to_string()))
    })
}

pub(crate) struct DocCore {
    pub(crate) state: DocState,
    pub(crate) type_url: Option<String>,
    pub(crate) version: Option<u64>,
    pub(crate) value: Option<Value>,
    pub(crate) inflight: Option<OperationData>,
    pub(crate) queue: VecDeque<OperationData>,
}

impl DocCore {
    fn new() -> Self {
        DocCore {
            state: DocState::Blank,
            type_url: None,
            version: None,
            value: None,
            inflight: None,
            queue: VecDeque::new(),
        }
    }
}

/// The untyped document core, uniquely owned by the connection registry.
/// Typed [`Document`] handles and watchers hold references back to it but
/// the registry is the owner.
pub(crate) struct DocShared {
    pub(crate) collection: String,
    pub(crate) key: String,
    pub(crate) connection: Weak<ConnectionInner>,
    pub(crate) entity_type: TypeId,
    pub(crate) entity_type_name: &'static str,
    derive: Deriver,
    pub(crate) core: Mutex<DocCore>,
    entity_tx: watch::Sender<Option<Entity>>,
    entity_rx: watch::Receiver<Option<Entity>>,
}

impl DocShared {
    pub(crate) fn new(
        collection: &str,
        key: &str,
        connection: Weak<ConnectionInner>,
        entity_type: TypeId,
        entity_type_name: &'static str,
        derive: Deriver,
    ) -> Arc<Self> {
        let (entity_tx, entity_rx) = watch::channel(None);
        Arc::new(DocShared {
            collection: collection.to_string(),
            key: key.to_string(),
            connection,
            entity_type,
            entity_type_name,
            derive,
            core: Mutex::new(DocCore::new()),
            entity_tx,
            entity_rx,
        })
    }

    fn derived(&self, value: &Value) -> Result<Entity, ClientError> {
        (self.derive)(value)
    }

    fn notify(&self, entity: Option<Entity>) {
        self.entity_tx.send_replace(entity);
    }

    pub(crate) fn watch_entity(&self) -> watch::Receiver<Option<Entity>> {
        self.entity_rx.clone()
    }

    /// Send the subscribe frame. Blank documents only; the state advances
    /// on write success and fails terminally on write failure.
    pub(crate) async fn subscribe(&self) -> Result<(), ClientError> {
        let mut core = self.core.lock().await;
        if core.state != DocState::Blank {
            return Err(ClientError::AlreadySubscribed);
        }
        let Some(conn) = self.connection.upgrade() else {
            return Err(ClientError::NotConnected);
        };
        let msg = Message::Subscribe(SubscribeMessage {
            collection: self.collection.clone(),
            document: self.key.clone(),
            version: core.version,
            data: None,
        });
        match conn.send(msg).await {
            Ok(()) => {
                core.state = transition(core.state, DocEvent::Fetch)?;
                Ok(())
            }
            Err(e) => {
                core.state = transition(core.state, DocEvent::Fail)?;
                Err(e)
            }
        }
    }

    /// Install a server snapshot. May reset the version without the
    /// monotonicity check that applies to updates.
    pub(crate) async fn put(
        &self,
        data: Value,
        version: u64,
        type_url: Option<String>,
    ) -> Result<(), ClientError> {
        let mut core = self.core.lock().await;
        let next = transition(core.state, DocEvent::Put)?;
        let entity = self.derived(&data)?;
        core.state = next;
        core.version = Some(version);
        core.value = Some(data);
        if type_url.is_some() {
            core.type_url = type_url;
        }
        self.notify(Some(entity));
        Ok(())
    }

    /// The subscribe reply carried an empty snapshot: the document does
    /// not exist upstream.
    pub(crate) async fn set_not_created(&self) -> Result<(), ClientError> {
        let mut core = self.core.lock().await;
        core.state = transition(core.state, DocEvent::SetNotCreated)?;
        Ok(())
    }

    /// Acknowledge our inflight op: the server applied it at `version`,
    /// so the document advances to `version + 1` and the queue drains.
    pub(crate) async fn ack(&self, version: u64, seq: u64) -> Result<(), ClientError> {
        let mut core = self.core.lock().await;
        if core.inflight.is_none() {
            return Err(ClientError::Violation(format!(
                "ack (seq {seq}) with no operation in flight"
            )));
        }
        match core.version {
            Some(current) if current == version => {}
            other => {
                return Err(ClientError::VersionMismatch {
                    expected: other.unwrap_or(0),
                    got: version,
                })
            }
        }
        core.version = Some(version + 1);
        core.inflight = None;
        log::trace!(
            "{}/{}: acked seq {seq}, now at v{}",
            self.collection,
            self.key,
            version + 1
        );
        self.drain(&mut core).await
    }

    /// Apply a server broadcast from another client.
    pub(crate) async fn sync(
        &self,
        data: OperationData,
        version: Option<u64>,
    ) -> Result<(), ClientError> {
        match data {
            OperationData::Update(ops) => {
                let version = version
                    .ok_or_else(|| ClientError::Violation("remote update without version".into()))?;
                let mut core = self.core.lock().await;
                let next = transition(core.state, DocEvent::Apply)?;
                match core.version {
                    Some(current) if current == version => {}
                    other => {
                        return Err(ClientError::VersionMismatch {
                            expected: other.unwrap_or(0),
                            got: version,
                        })
                    }
                }
                let value = core.value.as_ref().ok_or(ClientError::MissingValue)?;
                let new_value = json0::apply(value, &ops)?;
                let entity = self.derived(&new_value)?;
                core.state = next;
                core.version = Some(version + 1);
                core.value = Some(new_value);
                self.notify(Some(entity));
                Ok(())
            }
            OperationData::Create(create) => {
                let version = version
                    .ok_or_else(|| ClientError::Violation("remote create without version".into()))?;
                self.put(create.data, version, create.type_url).await
            }
            OperationData::Delete(_) => self.deleted_upstream().await,
        }
    }

    async fn deleted_upstream(&self) -> Result<(), ClientError> {
        let mut core = self.core.lock().await;
        let next = transition(core.state, DocEvent::Delete)?;
        core.state = next;
        core.value = None;
        core.inflight = None;
        core.queue.clear();
        self.notify(None);
        Ok(())
    }

    /// Park the document across a reconnect. The inflight op goes back to
    /// the queue head — it was next in line.
    pub(crate) async fn pause(&self) -> Result<(), ClientError> {
        let mut core = self.core.lock().await;
        let next = transition(core.state, DocEvent::Pause)?;
        core.state = next;
        if let Some(op) = core.inflight.take() {
            core.queue.push_front(op);
        }
        Ok(())
    }

    /// Wake the document after reconnect and drain the queue head.
    pub(crate) async fn resume(&self) -> Result<(), ClientError> {
        let mut core = self.core.lock().await;
        let next = transition(core.state, DocEvent::Resume)?;
        core.state = next;
        self.drain(&mut core).await
    }

    /// Local create: encode already done by the typed handle. A NotCreated
    /// document restarts as a fresh Blank lifecycle first.
    pub(crate) async fn create_value(
        &self,
        value: Value,
        type_url: Option<String>,
    ) -> Result<(), ClientError> {
        let mut core = self.core.lock().await;
        match core.state {
            DocState::Blank => {}
            DocState::NotCreated => *core = DocCore::new(),
            other => {
                return Err(StateError {
                    from: other,
                    event: DocEvent::Put,
                }
                .into())
            }
        }
        let next = transition(core.state, DocEvent::Put)?;
        let entity = self.derived(&value)?;
        let type_url = type_url.or_else(|| Some(JSON0_TYPE_URL.to_string()));
        core.state = next;
        core.version = Some(0);
        core.value = Some(value.clone());
        core.type_url = type_url.clone();
        self.notify(Some(entity));
        self.submit(&mut core, OperationData::Create(CreateData { type_url, data: value }))
            .await
    }

    /// Local delete: terminal transition, then the Delete op goes through
    /// the same inflight discipline as everything else.
    pub(crate) async fn delete(&self) -> Result<(), ClientError> {
        let mut core = self.core.lock().await;
        let next = transition(core.state, DocEvent::Delete)?;
        core.state = next;
        core.value = None;
        self.notify(None);
        self.submit(&mut core, OperationData::Delete(true)).await
    }

    /// Enqueue an op at the tail and drain the head. Every local op flows
    /// through here, which is what keeps the discipline FIFO.
    pub(crate) async fn submit(
        &self,
        core: &mut DocCore,
        op: OperationData,
    ) -> Result<(), ClientError> {
        core.queue.push_back(op);
        self.drain(core).await
    }

    /// If nothing is in flight and the document can send (identity and
    /// version known), pop the queue head and write its frame. A failed
    /// write puts the op back at the head.
    async fn drain(&self, core: &mut DocCore) -> Result<(), ClientError> {
        if core.inflight.is_some() {
            return Ok(());
        }
        let Some(conn) = self.connection.upgrade() else {
            return Ok(());
        };
        let source = conn.client_id().await;
        if source.is_none() || core.version.is_none() {
            return Ok(());
        }
        let Some(op) = core.queue.pop_front() else {
            return Ok(());
        };
        let msg = Message::Operation(OperationMessage {
            collection: self.collection.clone(),
            document: self.key.clone(),
            source,
            sequence: 0, // stamped by the connection under the sink lock
            version: core.version,
            data: Some(op.clone()),
        });
        match conn.send(msg).await {
            Ok(()) => {
                core.inflight = Some(op);
                Ok(())
            }
            Err(e) => {
                core.queue.push_front(op);
                core.inflight = None;
                Err(e)
            }
        }
    }

    /// React to a server error frame targeting this document: create
    /// conflicts resume, deletions terminate, rejected submits roll back,
    /// everything else drops the inflight.
    pub(crate) async fn handle_server_error(&self, error: &ErrorInfo) -> Result<(), ClientError> {
        let mut core = self.core.lock().await;
        match ServerErrorCode::parse(&error.code) {
            Some(ServerErrorCode::DocAlreadyCreated) => {
                log::info!(
                    "{}/{}: create rejected, document already exists upstream",
                    self.collection,
                    self.key
                );
                core.inflight = None;
                self.drain(&mut core).await
            }
            Some(ServerErrorCode::DocWasDeleted) | Some(ServerErrorCode::DocTypeNotRecognized) => {
                log::warn!(
                    "{}/{}: {}: {}",
                    self.collection,
                    self.key,
                    error.code,
                    error.message
                );
                if let Ok(next) = transition(core.state, DocEvent::Delete) {
                    core.state = next;
                    core.value = None;
                    core.inflight = None;
                    core.queue.clear();
                    self.notify(None);
                }
                Ok(())
            }
            Some(ServerErrorCode::OpSubmitRejected) => match core.inflight.take() {
                Some(OperationData::Update(ops)) => {
                    log::warn!(
                        "{}/{}: op rejected, rolling back locally: {}",
                        self.collection,
                        self.key,
                        error.message
                    );
                    let inverse = json0::invert(&ops)?;
                    let next = transition(core.state, DocEvent::Apply)?;
                    let value = core.value.as_ref().ok_or(ClientError::MissingValue)?;
                    let new_value = json0::apply(value, &inverse)?;
                    let entity = self.derived(&new_value)?;
                    core.state = next;
                    core.value = Some(new_value);
                    self.notify(Some(entity));
                    Ok(())
                }
                _ => {
                    // Creates and deletes are not invertible here; drop
                    // the inflight and whatever was queued behind it.
                    core.queue.clear();
                    Ok(())
                }
            },
            _ => {
                log::warn!(
                    "{}/{}: server error {}: {} (dropping inflight)",
                    self.collection,
                    self.key,
                    error.code,
                    error.message
                );
                core.inflight = None;
                Ok(())
            }
        }
    }
}

/// A typed handle onto a registered document.
///
/// Handles are cheap to clone and hold only a back-reference; the
/// connection's registry owns the document. `E` is the caller's decoded
/// view of the snapshot, re-derived on every update.
pub struct Document<E> {
    pub(crate) shared: Arc<DocShared>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Document<E> {
    fn clone(&self) -> Self {
        Document {
            shared: Arc::clone(&self.shared),
            _entity: PhantomData,
        }
    }
}

impl<E> Document<E>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn from_shared(shared: Arc<DocShared>) -> Self {
        Document {
            shared,
            _entity: PhantomData,
        }
    }

    pub fn collection(&self) -> &str {
        &self.shared.collection
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub async fn state(&self) -> DocState {
        self.shared.core.lock().await.state
    }

    pub async fn version(&self) -> Option<u64> {
        self.shared.core.lock().await.version
    }

    /// True while an op awaits its ack.
    pub async fn in_flight(&self) -> bool {
        self.shared.core.lock().await.inflight.is_some()
    }

    /// Ops queued behind the inflight one.
    pub async fn pending_ops(&self) -> usize {
        self.shared.core.lock().await.queue.len()
    }

    /// The current decoded entity, if the document carries a snapshot.
    pub async fn entity(&self) -> Option<Arc<E>> {
        let rx = self.shared.watch_entity();
        let entity = rx.borrow().clone();
        entity.and_then(|e| e.downcast::<E>().ok())
    }

    /// Subscribe to the document's value stream.
    pub fn watch(&self) -> EntityWatch<E> {
        EntityWatch {
            rx: self.shared.watch_entity(),
            _entity: PhantomData,
        }
    }

    /// Send the subscribe frame; returns once it is written. The snapshot
    /// arrives later through the value stream.
    pub async fn subscribe(&self) -> Result<(), ClientError> {
        self.shared.subscribe().await
    }

    /// Create the document upstream with this initial entity.
    pub async fn create(&self, entity: &E) -> Result<(), ClientError> {
        self.create_as(entity, None).await
    }

    /// Create with an explicit OT type tag.
    pub async fn create_as(
        &self,
        entity: &E,
        type_url: Option<String>,
    ) -> Result<(), ClientError> {
        let value =
            serde_json::to_value(entity).map_err(|e| ClientError::EntityEncode(e.to_string()))?;
        self.shared.create_value(value, type_url).await
    }

    /// Collect edits against the current snapshot and submit them as one
    /// Update op. The closure addresses slots by path; every mutator is
    /// validated against a working copy before it is recorded, so an op
    /// with failing preconditions never leaves the transaction. An empty
    /// transaction returns without sending anything.
    pub async fn change<F>(&self, f: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut ChangeContext) -> Result<(), ClientError>,
    {
        let shared = &self.shared;
        let mut core = shared.core.lock().await;
        let value = core.value.clone().ok_or(ClientError::MissingValue)?;
        let mut ctx = ChangeContext::new(value);
        f(&mut ctx)?;
        let (ops, working) = ctx.into_parts();
        if ops.is_empty() {
            return Ok(());
        }
        let next = transition(core.state, DocEvent::Apply)?;
        let entity = shared.derived(&working)?;
        core.state = next;
        core.value = Some(working);
        shared.notify(Some(entity));
        shared.submit(&mut core, OperationData::Update(ops)).await
    }

    /// Delete the document upstream.
    pub async fn delete(&self) -> Result<(), ClientError> {
        self.shared.delete().await
    }
}

/// The value stream of a document: yields the decoded entity after every
/// update, `None` once the document is deleted.
pub struct EntityWatch<E> {
    rx: watch::Receiver<Option<Entity>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> EntityWatch<E>
where
    E: Send + Sync + 'static,
{
    /// The latest decoded entity, if any.
    pub fn current(&self) -> Option<Arc<E>> {
        let entity = self.rx.borrow().clone();
        entity.and_then(|e| e.downcast::<E>().ok())
    }

    /// Wait for the next update and return the entity it carried.
    pub async fn next(&mut self) -> Option<Arc<E>> {
        self.rx.changed().await.ok()?;
        self.current()
    }

    /// Wait until the document carries an entity at all.
    pub async fn ready(&mut self) -> Option<Arc<E>> {
        loop {
            if let Some(entity) = self.current() {
                return Some(entity);
            }
            self.rx.changed().await.ok()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ClientConfig, Connection, ConnectionInner};
    use scribe_ot::JsonOp;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        #[serde(rename = "numClicks")]
        num_clicks: i64,
    }

    fn detached() -> Connection {
        Connection {
            inner: ConnectionInner::new("ws://127.0.0.1:1".into(), ClientConfig::default()),
        }
    }

    async fn counter_doc(conn: &Connection) -> Document<Counter> {
        conn.get_document::<Counter>("examples", "counter")
            .await
            .unwrap()
    }

    fn replace_op(new: i64, old: i64) -> OperationData {
        OperationData::Update(vec![JsonOp::object_replace(
            vec!["numClicks".into()],
            json!(new),
            json!(old),
        )])
    }

    #[test]
    fn transition_table_is_exact() {
        use DocEvent::*;
        use DocState::*;
        let states = [Blank, Pending, Ready, Paused, Deleted, FetchError, NotCreated];
        let events = [Fetch, Put, Apply, Pause, Resume, Delete, Fail, SetNotCreated];
        let allowed = [
            (Blank, Fetch, Pending),
            (Blank, Put, Ready),
            (Blank, Fail, FetchError),
            (Pending, Put, Ready),
            (Pending, Fail, FetchError),
            (Pending, SetNotCreated, NotCreated),
            (Ready, Put, Ready),
            (Ready, Apply, Ready),
            (Ready, Pause, Paused),
            (Ready, Resume, Ready),
            (Ready, Delete, Deleted),
            (Paused, Apply, Paused),
            (Paused, Resume, Ready),
            (Paused, Delete, Deleted),
        ];
        for state in states {
            for event in events {
                let expected = allowed
                    .iter()
                    .find(|(s, e, _)| *s == state && *e == event)
                    .map(|(_, _, next)| *next);
                match (transition(state, event), expected) {
                    (Ok(next), Some(want)) => assert_eq!(next, want),
                    (Err(err), None) => {
                        assert_eq!(err, StateError { from: state, event });
                    }
                    (got, want) => {
                        panic!("({state:?}, {event:?}): got {got:?}, table says {want:?}")
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn put_installs_snapshot_and_entity() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared
            .put(json!({"numClicks": 5}), 3, None)
            .await
            .unwrap();
        assert_eq!(doc.state().await, DocState::Ready);
        assert_eq!(doc.version().await, Some(3));
        assert_eq!(doc.entity().await.unwrap().num_clicks, 5);
    }

    #[tokio::test]
    async fn put_rejects_undecodable_snapshot_without_mutating() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        let err = doc.shared.put(json!({"numClicks": "five"}), 3, None).await;
        assert!(matches!(err, Err(ClientError::EntityDecode(_))));
        assert_eq!(doc.state().await, DocState::Blank);
        assert_eq!(doc.version().await, None);
    }

    #[tokio::test]
    async fn change_requires_a_snapshot() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        let err = doc.change(|c| c.key("numClicks").set(1)).await;
        assert!(matches!(err, Err(ClientError::MissingValue)));
    }

    #[tokio::test]
    async fn change_applies_locally_and_queues_until_identity_known() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 5}), 3, None).await.unwrap();

        doc.change(|c| c.key("numClicks").set(6)).await.unwrap();
        assert_eq!(doc.entity().await.unwrap().num_clicks, 6);
        // No client id yet: the op waits in the queue, nothing inflight.
        assert!(!doc.in_flight().await);
        assert_eq!(doc.pending_ops().await, 1);
    }

    #[tokio::test]
    async fn empty_change_sends_nothing() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 5}), 3, None).await.unwrap();
        doc.change(|_| Ok(())).await.unwrap();
        assert_eq!(doc.pending_ops().await, 0);
    }

    #[tokio::test]
    async fn queued_ops_stay_fifo() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 0}), 0, None).await.unwrap();
        for i in 1..=3 {
            doc.change(|c| c.key("numClicks").set(i)).await.unwrap();
        }
        let core = doc.shared.core.lock().await;
        let values: Vec<i64> = core
            .queue
            .iter()
            .map(|op| match op {
                OperationData::Update(ops) => match &ops[0].kind {
                    scribe_ot::OpKind::ObjectReplace { value, .. } => {
                        value.as_i64().unwrap()
                    }
                    other => panic!("unexpected op kind {other:?}"),
                },
                other => panic!("unexpected op {other:?}"),
            })
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn ack_without_inflight_is_a_violation() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 5}), 3, None).await.unwrap();
        assert!(matches!(
            doc.shared.ack(3, 1).await,
            Err(ClientError::Violation(_))
        ));
    }

    #[tokio::test]
    async fn ack_advances_version_and_clears_inflight() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 6}), 3, None).await.unwrap();
        {
            let mut core = doc.shared.core.lock().await;
            core.inflight = Some(replace_op(6, 5));
        }
        doc.shared.ack(3, 1).await.unwrap();
        assert_eq!(doc.version().await, Some(4));
        assert!(!doc.in_flight().await);
    }

    #[tokio::test]
    async fn ack_at_the_wrong_version_is_rejected() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 6}), 3, None).await.unwrap();
        {
            let mut core = doc.shared.core.lock().await;
            core.inflight = Some(replace_op(6, 5));
        }
        assert!(matches!(
            doc.shared.ack(7, 1).await,
            Err(ClientError::VersionMismatch { expected: 3, got: 7 })
        ));
        // Nothing advanced.
        assert_eq!(doc.version().await, Some(3));
        assert!(doc.in_flight().await);
    }

    #[tokio::test]
    async fn sync_update_requires_the_current_version() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 6}), 3, None).await.unwrap();

        let op = OperationData::Update(vec![JsonOp::number_add(
            vec!["numClicks".into()],
            2.into(),
        )]);
        doc.shared.sync(op.clone(), Some(3)).await.unwrap();
        assert_eq!(doc.entity().await.unwrap().num_clicks, 8);
        assert_eq!(doc.version().await, Some(4));

        assert!(matches!(
            doc.shared.sync(op, Some(9)).await,
            Err(ClientError::VersionMismatch { expected: 4, got: 9 })
        ));
    }

    #[tokio::test]
    async fn sync_delete_terminates_the_document() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 5}), 3, None).await.unwrap();
        doc.shared
            .sync(OperationData::Delete(true), Some(3))
            .await
            .unwrap();
        assert_eq!(doc.state().await, DocState::Deleted);
        assert!(doc.entity().await.is_none());
    }

    #[tokio::test]
    async fn pause_parks_the_inflight_op_at_the_queue_head() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 1}), 0, None).await.unwrap();
        {
            let mut core = doc.shared.core.lock().await;
            core.inflight = Some(replace_op(1, 0));
            core.queue.push_back(replace_op(2, 1));
        }
        doc.shared.pause().await.unwrap();
        assert_eq!(doc.state().await, DocState::Paused);
        assert!(!doc.in_flight().await);

        let core = doc.shared.core.lock().await;
        assert_eq!(core.queue.len(), 2);
        assert_eq!(core.queue.front(), Some(&replace_op(1, 0)));
    }

    #[tokio::test]
    async fn resume_returns_to_ready() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 1}), 0, None).await.unwrap();
        doc.shared.pause().await.unwrap();
        doc.shared.resume().await.unwrap();
        assert_eq!(doc.state().await, DocState::Ready);
    }

    #[tokio::test]
    async fn second_subscribe_is_rejected() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 1}), 0, None).await.unwrap();
        assert!(matches!(
            doc.subscribe().await,
            Err(ClientError::AlreadySubscribed)
        ));
    }

    #[tokio::test]
    async fn create_from_not_created_restarts_the_lifecycle() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        {
            let mut core = doc.shared.core.lock().await;
            core.state = DocState::NotCreated;
            core.version = Some(9);
        }
        doc.create(&Counter { num_clicks: 0 }).await.unwrap();
        assert_eq!(doc.state().await, DocState::Ready);
        assert_eq!(doc.version().await, Some(0));
        assert_eq!(doc.entity().await.unwrap().num_clicks, 0);
        // No client id: the create op is queued.
        assert_eq!(doc.pending_ops().await, 1);
    }

    #[tokio::test]
    async fn create_from_ready_is_rejected() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 1}), 0, None).await.unwrap();
        assert!(doc.create(&Counter { num_clicks: 0 }).await.is_err());
    }

    #[tokio::test]
    async fn rejected_submit_rolls_the_inflight_back() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 6}), 3, None).await.unwrap();
        {
            let mut core = doc.shared.core.lock().await;
            core.inflight = Some(replace_op(6, 5));
        }
        let error = ErrorInfo {
            code: "ERR_OP_SUBMIT_REJECTED".into(),
            message: "no".into(),
        };
        doc.shared.handle_server_error(&error).await.unwrap();
        assert!(!doc.in_flight().await);
        assert_eq!(doc.entity().await.unwrap().num_clicks, 5);
        // The rollback is local; the version does not move.
        assert_eq!(doc.version().await, Some(3));
    }

    #[tokio::test]
    async fn already_created_discards_the_inflight_create() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 0}), 0, None).await.unwrap();
        {
            let mut core = doc.shared.core.lock().await;
            core.inflight = Some(OperationData::Create(CreateData {
                type_url: None,
                data: json!({"numClicks": 0}),
            }));
        }
        let error = ErrorInfo {
            code: "ERR_DOC_ALREADY_CREATED".into(),
            message: "exists".into(),
        };
        doc.shared.handle_server_error(&error).await.unwrap();
        assert!(!doc.in_flight().await);
        assert_eq!(doc.state().await, DocState::Ready);
    }

    #[tokio::test]
    async fn doc_was_deleted_error_terminates() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 0}), 0, None).await.unwrap();
        let error = ErrorInfo {
            code: "ERR_DOC_WAS_DELETED".into(),
            message: "gone".into(),
        };
        doc.shared.handle_server_error(&error).await.unwrap();
        assert_eq!(doc.state().await, DocState::Deleted);
    }

    #[tokio::test]
    async fn unknown_error_code_drops_the_inflight() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        doc.shared.put(json!({"numClicks": 1}), 0, None).await.unwrap();
        {
            let mut core = doc.shared.core.lock().await;
            core.inflight = Some(replace_op(1, 0));
        }
        let error = ErrorInfo {
            code: "ERR_SOMETHING_NEW".into(),
            message: "?".into(),
        };
        doc.shared.handle_server_error(&error).await.unwrap();
        assert!(!doc.in_flight().await);
        assert_eq!(doc.entity().await.unwrap().num_clicks, 1);
    }

    #[tokio::test]
    async fn watch_streams_every_update() {
        let conn = detached();
        let doc = counter_doc(&conn).await;
        let mut watch = doc.watch();
        assert!(watch.current().is_none());

        doc.shared.put(json!({"numClicks": 5}), 3, None).await.unwrap();
        assert_eq!(watch.ready().await.unwrap().num_clicks, 5);

        doc.change(|c| c.key("numClicks").set(6)).await.unwrap();
        assert_eq!(watch.next().await.unwrap().num_clicks, 6);
    }
}
