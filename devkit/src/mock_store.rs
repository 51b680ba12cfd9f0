/*!
In-memory document store for tests without Firestore.

Keeps every document in memory, journals every write attempt (including the
ones it was told to fail) and can be told to fail writes per collection.
*/

use async_trait::async_trait;
use homewatch_bridge::store::{validate_collection, validate_document_id};
use homewatch_bridge::{Document, DocumentStore, StoreError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Set,
    Add,
}

#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub op: WriteOp,
    pub collection: String,
    /// Assigned id for `add`; `None` when the write was failed on purpose.
    pub id: Option<String>,
    pub document: Document,
    pub succeeded: bool,
}

#[derive(Default)]
struct Inner {
    collections: BTreeMap<String, BTreeMap<String, Document>>,
    journal: Vec<WriteRecord>,
    failing: HashSet<String>,
}

/// Cloning shares the same storage.
#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent write to `collection` fails with a rejection.
    pub fn fail_writes_to(&self, collection: &str) {
        self.inner.lock().failing.insert(collection.to_string());
    }

    pub fn heal(&self) {
        self.inner.lock().failing.clear();
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.inner
            .lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Nested lookup with a dotted path, e.g. `last_reading.sensors.motion`.
    pub fn field(&self, collection: &str, id: &str, path: &str) -> Option<Value> {
        let document = self.document(collection, id)?;
        let mut parts = path.split('.');
        let mut current = document.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current.clone())
    }

    pub fn documents(&self, collection: &str) -> Vec<(String, Document)> {
        self.inner
            .lock()
            .collections
            .get(collection)
            .map(|docs| docs.iter().map(|(id, doc)| (id.clone(), doc.clone())).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn journal(&self) -> Vec<WriteRecord> {
        self.inner.lock().journal.clone()
    }

    /// Collections written to, in order, failed attempts included.
    pub fn write_order(&self) -> Vec<String> {
        self.inner
            .lock()
            .journal
            .iter()
            .map(|w| w.collection.clone())
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.collections.clear();
        inner.journal.clear();
    }

    fn write(
        &self,
        op: WriteOp,
        collection: &str,
        id: Option<String>,
        document: &Document,
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.lock();
        if inner.failing.contains(collection) {
            inner.journal.push(WriteRecord {
                op,
                collection: collection.to_string(),
                id: None,
                document: document.clone(),
                succeeded: false,
            });
            return Err(StoreError::Rejected {
                status: 503,
                message: format!("injected failure for {collection}"),
            });
        }

        let id = id.unwrap_or_else(|| format!("mock-{}", self.next_id.fetch_add(1, Ordering::Relaxed)));
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), document.clone());
        inner.journal.push(WriteRecord {
            op,
            collection: collection.to_string(),
            id: Some(id.clone()),
            document: document.clone(),
            succeeded: true,
        });
        Ok(id)
    }
}

#[async_trait]
impl DocumentStore for MockStore {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    async fn set(&self, collection: &str, id: &str, document: &Document) -> Result<(), StoreError> {
        validate_collection(collection)?;
        validate_document_id(id)?;
        self.write(WriteOp::Set, collection, Some(id.to_string()), document)
            .map(|_| ())
    }

    async fn add(&self, collection: &str, document: &Document) -> Result<String, StoreError> {
        validate_collection(collection)?;
        self.write(WriteOp::Add, collection, None, document)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        validate_document_id(id)?;
        Ok(self.document(collection, id))
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError> {
        Ok(self.documents(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn set_add_and_lookup() {
        let store = MockStore::new();
        store
            .set("devices_latest", "s1", &doc(json!({"last_reading": {"sensors": {"motion": true}}})))
            .await
            .unwrap();
        let id = store.add("alerts", &doc(json!({"alert_type": "leak"}))).await.unwrap();

        assert_eq!(store.field("devices_latest", "s1", "last_reading.sensors.motion"), Some(json!(true)));
        assert_eq!(store.document("alerts", &id).unwrap()["alert_type"], "leak");
        assert_eq!(store.write_order(), ["devices_latest", "alerts"]);
    }

    #[tokio::test]
    async fn injected_failures_are_journaled() {
        let store = MockStore::new();
        store.fail_writes_to("alerts");

        assert!(store.add("alerts", &doc(json!({}))).await.is_err());
        assert_eq!(store.count("alerts"), 0);
        let journal = store.journal();
        assert_eq!(journal.len(), 1);
        assert!(!journal[0].succeeded);

        store.heal();
        assert!(store.add("alerts", &doc(json!({}))).await.is_ok());
        assert_eq!(store.count("alerts"), 1);
    }
}
