//! Per-message pipeline and its failure boundary.
//!
//! `dispatch` is the only entry point the receive loop uses. Whatever happens
//! inside (bad bytes, bad JSON, store errors, even a panic) ends up as exactly
//! one log line and a dropped message; the loop always gets control back.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::TopicsConfig;
use crate::error::ProcessError;
use crate::models::{InboundMessage, Routed};
use crate::normalizer::normalize;
use crate::router::Router;
use crate::stats::BridgeStats;
use crate::store::DocumentStore;

pub struct Bridge {
    router: Router,
    stats: BridgeStats,
}

impl Bridge {
    pub fn new(store: Arc<dyn DocumentStore>, topics: TopicsConfig, stats: BridgeStats) -> Self {
        Self {
            router: Router::new(store, topics),
            stats,
        }
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Normalize then route, without any error isolation.
    pub async fn process(&self, message: &InboundMessage) -> Result<Routed, ProcessError> {
        let record = normalize(message)?;
        self.router.route(&message.topic, record).await
    }

    /// Processes one message and swallows any failure after logging it.
    ///
    /// Returns what was written, or `None` if the message was dropped.
    pub async fn dispatch(&self, message: InboundMessage) -> Option<Routed> {
        self.stats.record_received();

        let outcome = AssertUnwindSafe(self.process(&message))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ProcessError::Panicked(panic_message(panic))));

        match outcome {
            Ok(routed) => {
                self.stats.record_stored();
                log_stored(&message.topic, &routed);
                Some(routed)
            }
            Err(err) => {
                let kind = err.kind();
                self.stats.record_dropped(kind);
                error!(
                    kind = %kind,
                    topic = %message.topic,
                    payload = %message.payload_preview(),
                    error = %err,
                    "message dropped"
                );
                None
            }
        }
    }
}

fn log_stored(topic: &str, routed: &Routed) {
    match routed {
        Routed::SensorReading { device_id, doc_id } => {
            info!(topic, device_id = %device_id, doc_id = %doc_id, "sensor reading stored")
        }
        Routed::Alert { id, alert_type } => {
            info!(topic, alert_type = %alert_type, id = %id, "alert stored")
        }
        Routed::Heartbeat { device_id } => {
            info!(topic, device_id = %device_id, "heartbeat updated")
        }
        Routed::Unclassified { id } => {
            warn!(topic, id = %id, "message on unrecognised topic stored in unknown_messages")
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::models::SENSOR_READINGS;
    use crate::store::{Document, FileStore, StoreError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io;
    use tracing_subscriber::fmt::MakeWriter;

    /// Collects formatted log output in memory.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn take_lines(&self) -> Vec<String> {
            let bytes = std::mem::take(&mut *self.0.lock());
            String::from_utf8_lossy(&bytes).lines().map(str::to_string).collect()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    struct PanickingStore;

    #[async_trait]
    impl DocumentStore for PanickingStore {
        fn backend_name(&self) -> &'static str {
            "panicking"
        }
        async fn set(&self, _: &str, _: &str, _: &Document) -> Result<(), StoreError> {
            panic!("store exploded");
        }
        async fn add(&self, _: &str, _: &Document) -> Result<String, StoreError> {
            panic!("store exploded");
        }
        async fn get(&self, _: &str, _: &str) -> Result<Option<Document>, StoreError> {
            Ok(None)
        }
        async fn list(&self, _: &str) -> Result<Vec<(String, Document)>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn bad_messages_are_dropped_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let bridge = Bridge::new(store.clone(), TopicsConfig::default(), BridgeStats::new());

        assert!(bridge
            .dispatch(InboundMessage::new("home/sensors/data", vec![0xff, 0xfe]))
            .await
            .is_none());
        assert!(bridge
            .dispatch(InboundMessage::new("home/heartbeat", &b"{not json"[..]))
            .await
            .is_none());
        let ok = bridge
            .dispatch(InboundMessage::new(
                "home/sensors/data",
                &br#"{"device_id":"s1","timestamp":5}"#[..],
            ))
            .await;
        assert!(ok.is_some());
        assert!(store.get(SENSOR_READINGS, "s1_5").await.unwrap().is_some());

        let s = bridge.stats().snapshot();
        assert_eq!(s.messages_received, 3);
        assert_eq!(s.messages_stored, 1);
        assert_eq!(s.decode_errors, 1);
        assert_eq!(s.malformed_payloads, 1);
    }

    #[tokio::test]
    async fn panic_in_store_is_contained() {
        let bridge = Bridge::new(Arc::new(PanickingStore), TopicsConfig::default(), BridgeStats::new());

        let dropped = bridge
            .dispatch(InboundMessage::new("home/heartbeat", &br#"{"device_id":"D1"}"#[..]))
            .await;
        assert!(dropped.is_none());

        let err = AssertUnwindSafe(bridge.process(&InboundMessage::new("x", &b"{}"[..])))
            .catch_unwind()
            .await;
        assert!(err.is_err(), "process itself does not isolate panics");
        assert_eq!(bridge.stats().snapshot().processing_errors, 1);
    }

    #[test]
    fn panic_payloads_are_rendered() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7_u8)), "non-string panic payload");
        assert_eq!(FailureKind::Processing.as_str(), "ProcessingError");
    }

    #[tokio::test]
    async fn each_drop_logs_exactly_one_error_line() {
        let logs = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let bridge = Bridge::new(store, TopicsConfig::default(), BridgeStats::new());

        let cases: [(&str, &[u8], &str); 3] = [
            ("home/sensors/data", &[0xff, 0xfe], "DecodeError"),
            ("home/heartbeat", b"{\"device_id\": ", "MalformedPayloadError"),
            // Both sensor writes fail on the invalid id; still one line.
            ("home/sensors/data", br#"{"device_id":"a/b","timestamp":1}"#, "ProcessingError"),
        ];
        for (topic, payload, kind) in cases {
            assert!(bridge.dispatch(InboundMessage::new(topic, payload)).await.is_none());

            let lines = logs.take_lines();
            let errors: Vec<&String> = lines.iter().filter(|l| l.contains("ERROR")).collect();
            assert_eq!(errors.len(), 1, "{kind}: {lines:#?}");
            assert!(errors[0].contains("message dropped"));
            assert!(errors[0].contains(&format!("kind={kind}")), "{}", errors[0]);
            assert!(errors[0].contains(&format!("topic={topic}")), "{}", errors[0]);
        }

        bridge
            .dispatch(InboundMessage::new("home/heartbeat", &br#"{"device_id":"D1"}"#[..]))
            .await
            .unwrap();
        assert!(logs.take_lines().iter().all(|l| !l.contains("ERROR")));
    }
}
