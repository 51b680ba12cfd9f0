//! Topic router: maps a normalized record to its collection writes.
//!
//! | topic kind   | writes                                                        |
//! |--------------|---------------------------------------------------------------|
//! | sensor data  | set `sensor_readings/{device}_{timestamp}`, set `devices_latest/{device}` |
//! | alert        | add `alerts` (with `alert_status` and `acknowledged` defaults) |
//! | heartbeat    | set `device_heartbeats/{device}`                               |
//! | anything else| add `unknown_messages`                                         |

use serde_json::{json, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

use crate::config::TopicsConfig;
use crate::error::{ProcessError, WriteFailure};
use crate::models::{
    key_part, NormalizedRecord, Routed, TopicKind, ALERTS, DEVICES_LATEST, DEVICE_HEARTBEATS,
    GENERATED_ID, SENSOR_READINGS, UNKNOWN_DEVICE, UNKNOWN_MESSAGES,
};
use crate::normalizer::RECEIVED_AT_FIELD;
use crate::store::DocumentStore;

const DEVICE_ID_FIELD: &str = "device_id";
const TIMESTAMP_FIELD: &str = "timestamp";
const ALERT_TYPE_FIELD: &str = "alert_type";
const UNKNOWN_ALERT_TYPE: &str = "unknown";

pub struct Router {
    store: Arc<dyn DocumentStore>,
    topics: TopicsConfig,
}

impl Router {
    pub fn new(store: Arc<dyn DocumentStore>, topics: TopicsConfig) -> Self {
        Self { store, topics }
    }

    pub fn classify(&self, topic: &str) -> TopicKind {
        self.topics.classify(topic)
    }

    pub async fn route(
        &self,
        topic: &str,
        record: NormalizedRecord,
    ) -> Result<Routed, ProcessError> {
        match self.classify(topic) {
            TopicKind::SensorData => self.store_sensor_reading(record).await,
            TopicKind::Alert => self.store_alert(record).await,
            TopicKind::Heartbeat => self.store_heartbeat(record).await,
            TopicKind::Unclassified => self.store_unclassified(record).await,
        }
    }

    /// Appends the reading, then refreshes the per-device projection.
    ///
    /// Both writes are always attempted; any failures are reported together.
    async fn store_sensor_reading(&self, record: NormalizedRecord) -> Result<Routed, ProcessError> {
        let device_id = device_id(&record);
        let timestamp = key_part(&record, TIMESTAMP_FIELD).unwrap_or_else(fallback_timestamp);
        let doc_id = format!("{device_id}_{timestamp}");

        let mut failures = Vec::new();
        if let Err(source) = self.store.set(SENSOR_READINGS, &doc_id, &record).await {
            failures.push(WriteFailure {
                collection: SENSOR_READINGS,
                document: doc_id.clone(),
                source,
            });
        }

        let latest = latest_projection(record);
        if let Err(source) = self.store.set(DEVICES_LATEST, &device_id, &latest).await {
            failures.push(WriteFailure {
                collection: DEVICES_LATEST,
                document: device_id.clone(),
                source,
            });
        }

        if !failures.is_empty() {
            return Err(ProcessError::Persistence(failures));
        }
        debug!(device_id = %device_id, doc_id = %doc_id, "sensor reading stored");
        Ok(Routed::SensorReading { device_id, doc_id })
    }

    async fn store_alert(&self, mut record: NormalizedRecord) -> Result<Routed, ProcessError> {
        // Defaults are forced: a new alert always starts active and unacknowledged.
        record.insert("alert_status".into(), json!("active"));
        record.insert("acknowledged".into(), json!(false));
        let alert_type =
            key_part(&record, ALERT_TYPE_FIELD).unwrap_or_else(|| UNKNOWN_ALERT_TYPE.into());

        let id = self
            .store
            .add(ALERTS, &record)
            .await
            .map_err(|source| ProcessError::write_failed(ALERTS, GENERATED_ID, source))?;
        Ok(Routed::Alert { id, alert_type })
    }

    async fn store_heartbeat(&self, record: NormalizedRecord) -> Result<Routed, ProcessError> {
        let device_id = device_id(&record);
        self.store
            .set(DEVICE_HEARTBEATS, &device_id, &record)
            .await
            .map_err(|source| {
                ProcessError::write_failed(DEVICE_HEARTBEATS, device_id.clone(), source)
            })?;
        Ok(Routed::Heartbeat { device_id })
    }

    async fn store_unclassified(&self, record: NormalizedRecord) -> Result<Routed, ProcessError> {
        let id = self
            .store
            .add(UNKNOWN_MESSAGES, &record)
            .await
            .map_err(|source| ProcessError::write_failed(UNKNOWN_MESSAGES, GENERATED_ID, source))?;
        Ok(Routed::Unclassified { id })
    }
}

fn device_id(record: &NormalizedRecord) -> String {
    key_part(record, DEVICE_ID_FIELD).unwrap_or_else(|| UNKNOWN_DEVICE.into())
}

/// Seconds since the epoch with sub-second precision, used when a reading has
/// no `timestamp` of its own.
fn fallback_timestamp() -> String {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    (nanos as f64 / 1e9).to_string()
}

fn latest_projection(record: NormalizedRecord) -> NormalizedRecord {
    let last_updated = record.get(RECEIVED_AT_FIELD).cloned().unwrap_or(Value::Null);
    let mut latest = NormalizedRecord::new();
    latest.insert("last_reading".into(), Value::Object(record));
    latest.insert("last_updated".into(), last_updated);
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use serde_json::json;

    fn record(value: Value) -> NormalizedRecord {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    async fn router() -> (tempfile::TempDir, Arc<FileStore>, Router) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let router = Router::new(store.clone(), TopicsConfig::default());
        (dir, store, router)
    }

    #[tokio::test]
    async fn sensor_reading_is_appended_and_projected() {
        let (_dir, store, router) = router().await;
        let reading = record(json!({
            "device_id": "sensor1",
            "timestamp": "1700000000",
            "sensors": {"temperature_c": 22.5},
            "received_at": "2024-03-01T12:30:45Z",
            "topic": "home/sensors/data",
        }));

        let routed = router.route("home/sensors/data", reading.clone()).await.unwrap();
        assert_eq!(
            routed,
            Routed::SensorReading {
                device_id: "sensor1".into(),
                doc_id: "sensor1_1700000000".into()
            }
        );

        let stored = store.get(SENSOR_READINGS, "sensor1_1700000000").await.unwrap().unwrap();
        assert_eq!(stored, reading);
        let latest = store.get(DEVICES_LATEST, "sensor1").await.unwrap().unwrap();
        assert_eq!(latest["last_reading"], Value::Object(reading));
        assert_eq!(latest["last_updated"], "2024-03-01T12:30:45Z");
    }

    #[tokio::test]
    async fn reading_without_device_or_timestamp_uses_fallbacks() {
        let (_dir, store, router) = router().await;

        let routed = router
            .route("home/sensors/data", record(json!({"sensors": {"motion": true}})))
            .await
            .unwrap();
        let (device_id, doc_id) = match routed {
            Routed::SensorReading { device_id, doc_id } => (device_id, doc_id),
            other => panic!("expected a sensor reading, got {other:?}"),
        };
        assert_eq!(device_id, "unknown");
        let timestamp = doc_id.strip_prefix("unknown_").unwrap();
        assert!(timestamp.parse::<f64>().unwrap() > 1.6e9);
        assert!(store.get(DEVICES_LATEST, "unknown").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn numeric_timestamp_is_rendered_as_json_text() {
        let (_dir, _store, router) = router().await;
        let routed = router
            .route("home/sensors/data", record(json!({"device_id": "s2", "timestamp": 1700000001})))
            .await
            .unwrap();
        assert_eq!(
            routed,
            Routed::SensorReading { device_id: "s2".into(), doc_id: "s2_1700000001".into() }
        );
    }

    #[tokio::test]
    async fn alerts_get_forced_defaults_and_new_ids() {
        let (_dir, store, router) = router().await;
        let alert = record(json!({
            "device_id": "sensor1",
            "alert_type": "motion",
            "alert_status": "resolved",
            "acknowledged": true,
        }));

        let first = router.route("home/sensors/alerts", alert.clone()).await.unwrap();
        let second = router.route("home/sensors/alerts", alert).await.unwrap();
        assert_ne!(first, second);

        let alerts = store.list(ALERTS).await.unwrap();
        assert_eq!(alerts.len(), 2);
        for (_, doc) in alerts {
            assert_eq!(doc["alert_status"], "active");
            assert_eq!(doc["acknowledged"], false);
            assert_eq!(doc["alert_type"], "motion");
        }
    }

    #[tokio::test]
    async fn heartbeat_keeps_only_latest() {
        let (_dir, store, router) = router().await;
        router
            .route("home/heartbeat", record(json!({"device_id": "D1", "uptime": 10})))
            .await
            .unwrap();
        router
            .route("home/heartbeat", record(json!({"device_id": "D1", "uptime": 20})))
            .await
            .unwrap();

        let beats = store.list(DEVICE_HEARTBEATS).await.unwrap();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].1["uptime"], 20);
    }

    #[tokio::test]
    async fn unknown_topics_land_in_unknown_messages() {
        let (_dir, store, router) = router().await;
        let routed = router
            .route("home/garage/door", record(json!({"open": true})))
            .await
            .unwrap();
        assert!(matches!(routed, Routed::Unclassified { .. }));
        assert_eq!(store.list(UNKNOWN_MESSAGES).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_device_id_fails_both_sensor_writes() {
        let (_dir, _store, router) = router().await;
        let err = router
            .route("home/sensors/data", record(json!({"device_id": "living/room", "timestamp": 1})))
            .await
            .unwrap_err();
        match err {
            ProcessError::Persistence(failures) => {
                let targets: Vec<_> = failures.iter().map(|f| f.collection).collect();
                assert_eq!(targets, [SENSOR_READINGS, DEVICES_LATEST]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
