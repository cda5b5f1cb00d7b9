//! In-process live store.
//!
//! Evaluates query shapes against documents held in memory and pushes a new
//! full result set to every matching listener whenever a collection changes.
//! Used for demos and tests, and as the secondary source when the dashboard
//! runs without a network store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

use botwatch_core::{Document, QueryShape};

use super::{FeedItem, LiveFeed, LiveStore};
use crate::error::{SyncError, SyncResult};

struct Listener {
    id: u64,
    shape: QueryShape,
    tx: mpsc::UnboundedSender<FeedItem>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Vec<Document>>,
    listeners: Vec<Listener>,
    next_listener: u64,
    failure: Option<SyncError>,
}

impl Inner {
    fn result_set(&self, shape: &QueryShape) -> Vec<Document> {
        self.collections
            .get(&shape.collection)
            .map(|docs| shape.apply(docs))
            .unwrap_or_default()
    }

    fn notify(&mut self, collection: &str) {
        let snapshots: Vec<(u64, Vec<Document>)> = self
            .listeners
            .iter()
            .filter(|l| l.shape.collection == collection)
            .map(|l| (l.id, self.result_set(&l.shape)))
            .collect();

        for (id, docs) in snapshots {
            if let Some(listener) = self.listeners.iter().find(|l| l.id == id) {
                if listener.tx.send(Ok(docs)).is_err() {
                    self.listeners.retain(|l| l.id != id);
                }
            }
        }
    }
}

/// Live store backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    reads: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts or replaces a document and notifies listeners of the collection.
    pub fn upsert(&self, collection: &str, doc: Document) {
        let mut inner = self.lock();
        let docs = inner.collections.entry(collection.to_string()).or_default();
        match docs.iter_mut().find(|d| d.id == doc.id) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
        inner.notify(collection);
    }

    /// Removes a document. Returns false if it did not exist.
    pub fn remove(&self, collection: &str, id: &str) -> bool {
        let mut inner = self.lock();
        let removed = match inner.collections.get_mut(collection) {
            Some(docs) => {
                let before = docs.len();
                docs.retain(|d| d.id != id);
                docs.len() != before
            }
            None => false,
        };
        if removed {
            inner.notify(collection);
        }
        removed
    }

    /// Makes every subsequent read and listen fail with `err` (or succeed
    /// again with `None`).
    pub fn set_failure(&self, err: Option<SyncError>) {
        self.lock().failure = err;
    }

    /// Simulates a transport failure: every live listener receives `err`
    /// once and is dropped.
    pub fn break_listeners(&self, err: SyncError) {
        let listeners = std::mem::take(&mut self.lock().listeners);
        for listener in listeners {
            let _ = listener.tx.send(Err(err.clone()));
        }
    }

    /// Number of one-time reads served or refused so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of registered live queries.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}

#[async_trait]
impl LiveStore for MemoryStore {
    async fn get_once(&self, shape: &QueryShape) -> SyncResult<Vec<Document>> {
        shape.validate()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let inner = self.lock();
        if let Some(ref err) = inner.failure {
            return Err(err.clone());
        }
        Ok(inner.result_set(shape))
    }

    async fn listen(&self, shape: &QueryShape) -> SyncResult<LiveFeed> {
        shape.validate()?;
        let mut inner = self.lock();
        if let Some(ref err) = inner.failure {
            return Err(err.clone());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(inner.result_set(shape)));

        let id = inner.next_listener;
        inner.next_listener += 1;
        inner.listeners.push(Listener {
            id,
            shape: shape.clone(),
            tx,
        });
        debug!(id, query = %shape.key(), "Memory listener registered");

        let store = Arc::downgrade(&self.inner);
        Ok(LiveFeed::new(rx).on_close(move || {
            if let Some(inner) = store.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(|p| p.into_inner());
                inner.listeners.retain(|l| l.id != id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botwatch_core::Direction;
    use serde_json::json;

    fn trade(id: &str, open: bool, ts: i64) -> Document {
        Document::new(id, json!({ "symbol": "BTCUSDT", "is_open": open, "timestamp": ts }))
    }

    #[tokio::test]
    async fn test_get_once_applies_shape() {
        let store = MemoryStore::new();
        store.upsert("trades", trade("a", true, 1));
        store.upsert("trades", trade("b", false, 2));
        store.upsert("trades", trade("c", true, 3));

        let shape = QueryShape::collection("trades")
            .where_eq("is_open", true)
            .order_by("timestamp", Direction::Desc);
        let docs = store.get_once(&shape).await.unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(store.read_count(), 1);
    }

    #[tokio::test]
    async fn test_listen_pushes_full_result_sets() {
        let store = MemoryStore::new();
        store.upsert("trades", trade("a", true, 1));

        let mut feed = store.listen(&QueryShape::collection("trades")).await.unwrap();
        assert_eq!(feed.recv().await.unwrap().unwrap().len(), 1);

        store.upsert("trades", trade("b", true, 2));
        assert_eq!(feed.recv().await.unwrap().unwrap().len(), 2);

        store.remove("trades", "a");
        assert_eq!(feed.recv().await.unwrap().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropping_feed_unregisters() {
        let store = MemoryStore::new();
        let feed = store.listen(&QueryShape::collection("trades")).await.unwrap();
        assert_eq!(store.listener_count(), 1);
        drop(feed);
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        store.set_failure(Some(SyncError::Disconnected));
        assert!(store.get_once(&QueryShape::collection("trades")).await.is_err());
        assert!(store.listen(&QueryShape::collection("trades")).await.is_err());

        store.set_failure(None);
        let mut feed = store.listen(&QueryShape::collection("trades")).await.unwrap();
        let _ = feed.recv().await;
        store.break_listeners(SyncError::Disconnected);
        assert_eq!(feed.recv().await, Some(Err(SyncError::Disconnected)));
        assert!(feed.recv().await.is_none());
    }
}
