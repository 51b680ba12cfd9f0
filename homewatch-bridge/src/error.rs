use std::fmt;
use std::path::PathBuf;

use crate::config::ConfigError;
use crate::store::StoreError;

/// Failure classes reported for a dropped message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Decode,
    MalformedPayload,
    Processing,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Decode => "DecodeError",
            FailureKind::MalformedPayload => "MalformedPayloadError",
            FailureKind::Processing => "ProcessingError",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a single message was dropped. Never escapes the per-message boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("payload is not valid UTF-8: {0}")]
    Decode(#[from] std::str::Utf8Error),
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
    #[error("{}", describe_failures(.0))]
    Persistence(Vec<WriteFailure>),
    #[error("message handler panicked: {0}")]
    Panicked(String),
}

impl ProcessError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProcessError::Decode(_) => FailureKind::Decode,
            ProcessError::InvalidJson(_) | ProcessError::NotAnObject(_) => {
                FailureKind::MalformedPayload
            }
            ProcessError::Persistence(_) | ProcessError::Panicked(_) => FailureKind::Processing,
        }
    }

    pub(crate) fn write_failed(
        collection: &'static str,
        document: impl Into<String>,
        source: StoreError,
    ) -> Self {
        ProcessError::Persistence(vec![WriteFailure {
            collection,
            document: document.into(),
            source,
        }])
    }
}

/// One store write that did not go through.
#[derive(Debug, thiserror::Error)]
#[error("{collection}/{document}: {source}")]
pub struct WriteFailure {
    pub collection: &'static str,
    pub document: String,
    #[source]
    pub source: StoreError,
}

fn describe_failures(failures: &[WriteFailure]) -> String {
    let parts: Vec<String> = failures.iter().map(ToString::to_string).collect();
    format!("write failed: {}", parts.join("; "))
}

/// Errors that abort the process before (or instead of) reaching `Running`.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("document store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("cannot read TLS material {}: {source}", .path.display())]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot bind health endpoint on {address}: {source}")]
    HttpBind {
        address: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("broker {address} unreachable after {attempts} attempts: {last_error}")]
    BrokerUnreachable {
        address: String,
        attempts: u32,
        last_error: String,
    },
}
