//! Query collections: server-driven lists of documents.
//!
//! A query subscription publishes the ordered list of matching document
//! keys on a watch channel. The server seeds it with an initial result
//! list and keeps it current with move/insert/remove diffs; inserted
//! documents get their snapshots installed through the same registry the
//! rest of the client uses.

use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::connection::ConnectionInner;
use crate::document::{Deriver, Document};
use crate::error::ClientError;
use crate::protocol::{QueryDiff, QueryResultEntry};

pub(crate) struct QueryShared {
    pub(crate) id: u64,
    pub(crate) collection: String,
    connection: Weak<ConnectionInner>,
    entity_type: TypeId,
    entity_type_name: &'static str,
    make_deriver: Box<dyn Fn() -> Deriver + Send + Sync>,
    entries: Mutex<Vec<String>>,
    results_tx: watch::Sender<Vec<String>>,
    results_rx: watch::Receiver<Vec<String>>,
}

impl QueryShared {
    pub(crate) fn new(
        id: u64,
        collection: &str,
        connection: Weak<ConnectionInner>,
        entity_type: TypeId,
        entity_type_name: &'static str,
        make_deriver: Box<dyn Fn() -> Deriver + Send + Sync>,
    ) -> Arc<Self> {
        let (results_tx, results_rx) = watch::channel(Vec::new());
        Arc::new(QueryShared {
            id,
            collection: collection.to_string(),
            connection,
            entity_type,
            entity_type_name,
            make_deriver,
            entries: Mutex::new(Vec::new()),
            results_tx,
            results_rx,
        })
    }

    async fn install(&self, entry: QueryResultEntry) -> Result<String, ClientError> {
        let conn = self.connection.upgrade().ok_or(ClientError::NotConnected)?;
        let doc = conn
            .get_or_create_shared(
                &self.collection,
                &entry.document,
                self.entity_type,
                self.entity_type_name,
                || (self.make_deriver)(),
            )
            .await?;
        if let Some(data) = entry.data {
            if let Err(e) = doc.put(data, entry.version, entry.type_url).await {
                log::warn!(
                    "query {}: snapshot install failed for {}: {e}",
                    self.id,
                    entry.document
                );
            }
        }
        Ok(entry.document)
    }

    /// Seed the collection from the initial result list.
    pub(crate) async fn put(&self, list: Vec<QueryResultEntry>) -> Result<(), ClientError> {
        let mut keys = Vec::with_capacity(list.len());
        for entry in list {
            keys.push(self.install(entry).await?);
        }
        let mut entries = self.entries.lock().await;
        *entries = keys.clone();
        self.results_tx.send_replace(keys);
        Ok(())
    }

    /// Apply a diff list to the published sequence, in order.
    pub(crate) async fn sync(&self, diffs: Vec<QueryDiff>) -> Result<(), ClientError> {
        let mut entries = self.entries.lock().await;
        for diff in diffs {
            match diff {
                QueryDiff::Move { from, to, how_many } => {
                    if from + how_many > entries.len() {
                        log::warn!("query {}: move out of range, skipped", self.id);
                        continue;
                    }
                    let moved: Vec<String> = entries.drain(from..from + how_many).collect();
                    if to > entries.len() {
                        log::warn!("query {}: move target out of range, skipped", self.id);
                        // Put the slice back where it was.
                        for (i, key) in moved.into_iter().enumerate() {
                            entries.insert(from + i, key);
                        }
                        continue;
                    }
                    for (i, key) in moved.into_iter().enumerate() {
                        entries.insert(to + i, key);
                    }
                }
                QueryDiff::Insert { index, values } => {
                    if index > entries.len() {
                        log::warn!("query {}: insert out of range, skipped", self.id);
                        continue;
                    }
                    for (i, entry) in values.into_iter().enumerate() {
                        let key = self.install(entry).await?;
                        entries.insert(index + i, key);
                    }
                }
                QueryDiff::Remove { index, how_many } => {
                    if index + how_many > entries.len() {
                        log::warn!("query {}: remove out of range, skipped", self.id);
                        continue;
                    }
                    entries.drain(index..index + how_many);
                }
            }
        }
        self.results_tx.send_replace(entries.clone());
        Ok(())
    }
}

/// A typed handle onto a live query subscription.
pub struct QueryCollection<E> {
    shared: Arc<QueryShared>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for QueryCollection<E> {
    fn clone(&self) -> Self {
        QueryCollection {
            shared: Arc::clone(&self.shared),
            _entity: PhantomData,
        }
    }
}

impl<E> QueryCollection<E>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn from_shared(shared: Arc<QueryShared>) -> Self {
        QueryCollection {
            shared,
            _entity: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn collection(&self) -> &str {
        &self.shared.collection
    }

    /// The published sequence of matching document keys, in server order.
    pub fn results(&self) -> watch::Receiver<Vec<String>> {
        self.shared.results_rx.clone()
    }

    /// Resolve the current result keys to typed document handles.
    pub async fn documents(&self) -> Result<Vec<Document<E>>, ClientError> {
        let conn = self
            .shared
            .connection
            .upgrade()
            .ok_or(ClientError::NotConnected)?;
        let keys = self.shared.results_rx.borrow().clone();
        let mut docs = Vec::with_capacity(keys.len());
        for key in keys {
            let shared = conn
                .get_or_create_shared(
                    &self.shared.collection,
                    &key,
                    TypeId::of::<E>(),
                    std::any::type_name::<E>(),
                    crate::document::deriver_for::<E>,
                )
                .await?;
            docs.push(Document::from_shared(shared));
        }
        Ok(docs)
    }
}
