//! Homewatch ingestion bridge.
//!
//! Subscribes to the home-monitoring MQTT topics and persists every message
//! into the document store the dashboard reads from:
//! - `home/sensors/data`   → `sensor_readings` log + `devices_latest` projection
//! - `home/sensors/alerts` → `alerts` (new document per alert)
//! - `home/heartbeat`      → `device_heartbeats` (one document per device)
//! - anything else         → `unknown_messages`
//!
//! Messages are handled one at a time, in delivery order. A message that
//! cannot be decoded or stored is logged and dropped; it never stops the
//! receive loop.

pub mod bridge;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod models;
pub mod normalizer;
pub mod router;
pub mod stats;
pub mod store;

pub use bridge::Bridge;
pub use config::{BridgeConfig, TopicsConfig};
pub use error::{FailureKind, ProcessError, StartupError};
pub use models::{InboundMessage, NormalizedRecord, Routed, TopicKind};
pub use stats::{BridgeStats, LifecycleState};
pub use store::{Document, DocumentStore, StoreError};
