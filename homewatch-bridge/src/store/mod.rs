/**
 * DOCUMENT STORE - Persistance des messages du réseau de capteurs
 *
 * RÔLE :
 * Interface unique entre le routeur et le stockage. Le routeur n'écrit que
 * via le trait DocumentStore ; le backend concret est choisi au démarrage.
 *
 * FONCTIONNEMENT :
 * - FirestoreStore : Cloud Firestore via l'API REST v1 (production)
 * - FileStore : un fichier JSON par document sous un répertoire local
 * - set = écrasement complet du document, add = nouvel id choisi par le store
 * - Ids et noms de collection validés avant tout appel réseau ou disque
 *
 * UTILITÉ DANS HOMEWATCH :
 * 🎯 Historique : sensor_readings, alerts, unknown_messages
 * 🎯 État courant : devices_latest, device_heartbeats (lus par le dashboard)
 * 🎯 Tests : le devkit fournit un MockStore sur le même trait
 */

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};

mod file;
mod firestore;

pub use file::FileStore;
pub use firestore::{FirestoreStore, ServiceAccountKey};

/// A stored document: always a JSON object at the top level.
pub type Document = Map<String, Value>;

const MAX_ID_BYTES: usize = 1500;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid document id {0:?}")]
    InvalidDocumentId(String),
    #[error("invalid collection name {0:?}")]
    InvalidCollection(String),
    #[error("credentials file {} not found", .path.display())]
    MissingCredentials { path: PathBuf },
    #[error("invalid credentials in {}: {reason}", .path.display())]
    InvalidCredentials { path: PathBuf, reason: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected store response: {0}")]
    Protocol(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Short backend name for log lines.
    fn backend_name(&self) -> &'static str;

    /// Creates or fully overwrites `collection/id`.
    async fn set(&self, collection: &str, id: &str, document: &Document) -> Result<(), StoreError>;

    /// Appends a new document and returns the id the store assigned.
    async fn add(&self, collection: &str, document: &Document) -> Result<String, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// All documents of a collection, ordered by id.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError>;
}

/// Id rules shared by every backend: non-empty, not `.`/`..`, no `/` or NUL,
/// at most 1500 bytes.
pub fn validate_document_id(id: &str) -> Result<(), StoreError> {
    if is_valid_segment(id) {
        Ok(())
    } else {
        Err(StoreError::InvalidDocumentId(id.to_string()))
    }
}

pub fn validate_collection(name: &str) -> Result<(), StoreError> {
    if is_valid_segment(name) {
        Ok(())
    } else {
        Err(StoreError::InvalidCollection(name.to_string()))
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment.len() <= MAX_ID_BYTES
        && !segment.contains(['/', '\0'])
}

/// Opens the configured backend. Failures here are fatal at startup.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn DocumentStore>, StoreError> {
    let store: Arc<dyn DocumentStore> = match config.backend {
        StoreBackend::Firestore => Arc::new(
            FirestoreStore::from_key_file(&config.credentials_path, config.endpoint.as_deref())
                .await?,
        ),
        StoreBackend::File => Arc::new(FileStore::open(&config.data_dir).await?),
    };
    info!(backend = store.backend_name(), "document store initialized");
    Ok(store)
}
