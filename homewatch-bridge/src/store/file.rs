//! Local JSON-file backend.
//!
//! Layout: `{root}/{collection}/{id}.json`, one pretty-printed object per file.
//! Writes go to a temporary sibling first and are renamed into place, so a
//! reader never sees a half-written document.

use async_trait::async_trait;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use super::{validate_collection, validate_document_id, Document, DocumentStore, StoreError};

const EXTENSION: &str = "json";

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens (and creates if needed) the data directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        debug!(root = %root.display(), "file store opened");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: &str) -> Result<PathBuf, StoreError> {
        validate_collection(collection)?;
        Ok(self.root.join(collection))
    }

    fn document_path(&self, collection: &str, id: &str) -> Result<PathBuf, StoreError> {
        validate_document_id(id)?;
        Ok(self
            .collection_dir(collection)?
            .join(format!("{id}.{EXTENSION}")))
    }

    async fn write_document(&self, path: &Path, document: &Document) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(document)?;
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        fs::write(&tmp, json).await?;
        if let Err(err) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn read_document(path: &Path) -> Result<Option<Document>, StoreError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice::<Value>(&bytes)? {
            Value::Object(document) => Ok(Some(document)),
            _ => Err(StoreError::Protocol(format!(
                "{} does not hold a JSON object",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn set(&self, collection: &str, id: &str, document: &Document) -> Result<(), StoreError> {
        let path = self.document_path(collection, id)?;
        self.write_document(&path, document).await
    }

    async fn add(&self, collection: &str, document: &Document) -> Result<String, StoreError> {
        let id = Uuid::new_v4().simple().to_string();
        let path = self.document_path(collection, &id)?;
        self.write_document(&path, document).await?;
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let path = self.document_path(collection, id)?;
        Self::read_document(&path).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError> {
        let dir = self.collection_dir(collection)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut documents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            // Temp files end in `.tmp`, so only finished documents get here.
            if let Some(document) = Self::read_document(&path).await? {
                documents.push((id.to_string(), document));
            }
        }
        documents.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(documents)
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
    async fn set_overwrites_whole_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        store
            .set("device_heartbeats", "sensor1", &doc(json!({"uptime": 1, "wifi_rssi": -60})))
            .await
            .unwrap();
        store
            .set("device_heartbeats", "sensor1", &doc(json!({"uptime": 2})))
            .await
            .unwrap();

        let stored = store.get("device_heartbeats", "sensor1").await.unwrap().unwrap();
        assert_eq!(Value::Object(stored), json!({"uptime": 2}));
        assert_eq!(store.list("device_heartbeats").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn add_assigns_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let first = store.add("alerts", &doc(json!({"n": 1}))).await.unwrap();
        let second = store.add("alerts", &doc(json!({"n": 1}))).await.unwrap();
        assert_ne!(first, second);

        let listed = store.list("alerts").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|(id, _)| *id == first));
    }

    #[tokio::test]
    async fn missing_documents_and_collections() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        assert!(store.get("alerts", "nope").await.unwrap().is_none());
        assert!(store.list("alerts").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_ids_that_escape_the_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();

        let err = store
            .set("sensor_readings", "../escape", &doc(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocumentId(_)));
        let err = store.set("", "x", &doc(json!({}))).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidCollection(_)));
    }
}
