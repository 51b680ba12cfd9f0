//! Cloud Firestore backend over the REST v1 API.
//!
//! Document URL: `{base}/projects/{project}/databases/(default)/documents/{collection}/{id}`.
//! `base` defaults to the public endpoint; `store.endpoint` overrides it
//! (e.g. a local emulator).

mod auth;
mod values;

pub use auth::ServiceAccountKey;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::path::Path;
use tracing::{debug, info};

use self::auth::TokenSource;
use self::values::{decode_fields, encode_fields};
use super::{validate_collection, validate_document_id, Document, DocumentStore, StoreError};

const DEFAULT_ENDPOINT: &str = "https://firestore.googleapis.com/v1/";
const PAGE_SIZE: &str = "300";

pub struct FirestoreStore {
    documents_url: Url,
    tokens: TokenSource,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    documents: Vec<RawDocument>,
    next_page_token: Option<String>,
}

impl FirestoreStore {
    pub async fn from_key_file(path: &Path, endpoint: Option<&str>) -> Result<Self, StoreError> {
        let key = ServiceAccountKey::load(path).await?;
        let store = Self::new(&key, endpoint).map_err(|reason| StoreError::InvalidCredentials {
            path: path.to_path_buf(),
            reason,
        })?;
        info!(project = %key.project_id, "firestore credentials loaded");
        Ok(store)
    }

    pub fn new(key: &ServiceAccountKey, endpoint: Option<&str>) -> Result<Self, String> {
        let http = reqwest::Client::new();
        let tokens = TokenSource::new(key, http.clone())?;
        let documents_url = documents_url(endpoint.unwrap_or(DEFAULT_ENDPOINT), &key.project_id)?;
        Ok(Self {
            documents_url,
            tokens,
            http,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.documents_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Protocol(format!("{} cannot be a base URL", self.documents_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value), StoreError> {
        let token = self.tokens.token().await?;
        let mut request = self.http.request(method, url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok((status, Value::Null));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
        Ok((status, response.json().await?))
    }
}

fn documents_url(endpoint: &str, project_id: &str) -> Result<Url, String> {
    let mut url = Url::parse(endpoint).map_err(|e| format!("invalid endpoint {endpoint:?}: {e}"))?;
    url.path_segments_mut()
        .map_err(|_| format!("invalid endpoint {endpoint:?}"))?
        .pop_if_empty()
        .extend(["projects", project_id, "databases", "(default)", "documents"]);
    Ok(url)
}

/// Pulls `error.message` out of a Google API error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

/// Last path segment of a document resource name.
fn document_id(name: &str) -> Result<String, StoreError> {
    name.rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| StoreError::Protocol(format!("bad document name {name:?}")))
}

#[async_trait]
impl DocumentStore for FirestoreStore {
    fn backend_name(&self) -> &'static str {
        "firestore"
    }

    async fn set(&self, collection: &str, id: &str, document: &Document) -> Result<(), StoreError> {
        validate_collection(collection)?;
        validate_document_id(id)?;
        let url = self.url(&[collection, id])?;
        // No updateMask: PATCH replaces the whole document.
        let body = json!({ "fields": encode_fields(document) });
        let (status, _) = self.send(Method::PATCH, url, Some(body)).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                message: format!("{collection}/{id}: database not found"),
            });
        }
        debug!(collection, id, "document set");
        Ok(())
    }

    async fn add(&self, collection: &str, document: &Document) -> Result<String, StoreError> {
        validate_collection(collection)?;
        let url = self.url(&[collection])?;
        let body = json!({ "fields": encode_fields(document) });
        let (status, created) = self.send(Method::POST, url, Some(body)).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                message: format!("{collection}: database not found"),
            });
        }
        let created: RawDocument = serde_json::from_value(created)?;
        document_id(&created.name)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        validate_collection(collection)?;
        validate_document_id(id)?;
        let url = self.url(&[collection, id])?;
        let (status, body) = self.send(Method::GET, url, None).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let raw: RawDocument = serde_json::from_value(body)?;
        decode_fields(&raw.fields).map(Some)
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError> {
        validate_collection(collection)?;
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.url(&[collection])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("pageSize", PAGE_SIZE);
                query.append_pair("orderBy", "__name__");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let (status, body) = self.send(Method::GET, url, None).await?;
            if status == StatusCode::NOT_FOUND {
                break;
            }
            let page: ListResponse = serde_json::from_value(body)?;
            for raw in page.documents {
                documents.push((document_id(&raw.name)?, decode_fields(&raw.fields)?));
            }
            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(documents)
    }
}
