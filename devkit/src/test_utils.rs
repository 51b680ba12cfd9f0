/*!
Test harness for the bridge pipeline.

Wires a [`Bridge`] to a [`MockStore`] and a lifecycle [`Supervisor`], so tests
can feed raw broker events or plain messages and assert on what got stored,
without a broker or Firestore.
*/

use homewatch_bridge::lifecycle::{Action, Supervisor};
use homewatch_bridge::stats::StatsSnapshot;
use homewatch_bridge::{
    Bridge, BridgeStats, InboundMessage, LifecycleState, Routed, TopicsConfig,
};
use rumqttc::{ConnAck, ConnectReturnCode, ConnectionError, Event, Packet, Publish, QoS};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::mock_store::MockStore;
use crate::payloads::PayloadBuilder;

/// Outcome of feeding one broker event through the harness.
#[derive(Debug)]
pub enum Fed {
    Subscribed(Vec<String>),
    /// The message went through the pipeline; `None` means it was dropped.
    Dispatched(Option<Routed>),
    Retrying(String),
    GaveUp { attempts: u32 },
    Ignored,
}

pub struct TestHarness {
    pub store: MockStore,
    pub topics: TopicsConfig,
    stats: BridgeStats,
    bridge: Bridge,
    supervisor: Supervisor,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_topics(TopicsConfig::default(), 5)
    }

    pub fn with_topics(topics: TopicsConfig, startup_attempts: u32) -> Self {
        init_tracing();
        let store = MockStore::new();
        let stats = BridgeStats::new();
        let bridge = Bridge::new(Arc::new(store.clone()), topics.clone(), stats.clone());
        let supervisor = Supervisor::new(topics.subscriptions(), startup_attempts, stats.clone());
        Self {
            store,
            topics,
            stats,
            bridge,
            supervisor,
        }
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn state(&self) -> LifecycleState {
        self.stats.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Sends a message straight to the pipeline, bypassing the supervisor.
    pub async fn send(&self, topic: &str, payload: impl Into<Vec<u8>>) -> Option<Routed> {
        self.bridge.dispatch(InboundMessage::new(topic, payload)).await
    }

    pub async fn send_json(&self, topic: &str, payload: &Value) -> Option<Routed> {
        self.send(topic, payload.to_string()).await
    }

    pub async fn send_payload(&self, topic: &str, payload: &PayloadBuilder) -> Option<Routed> {
        self.send(topic, payload.to_bytes()).await
    }

    pub async fn send_sensor(&self, payload: &PayloadBuilder) -> Option<Routed> {
        let topic = self.topics.sensor_data.clone();
        self.send_payload(&topic, payload).await
    }

    pub async fn send_alert(&self, payload: &PayloadBuilder) -> Option<Routed> {
        let topic = self.topics.alerts.clone();
        self.send_payload(&topic, payload).await
    }

    pub async fn send_heartbeat(&self, payload: &PayloadBuilder) -> Option<Routed> {
        let topic = self.topics.heartbeat.clone();
        self.send_payload(&topic, payload).await
    }

    /// Feeds a broker event through the supervisor, dispatching deliveries
    /// the way the receive loop does.
    pub async fn feed(&mut self, event: Event) -> Fed {
        let action = self.supervisor.on_event(event);
        self.apply(action).await
    }

    pub async fn feed_error(&mut self, err: ConnectionError) -> Fed {
        let action = self.supervisor.on_connection_error(&err);
        self.apply(action).await
    }

    pub async fn connect(&mut self) -> Fed {
        self.feed(connack(ConnectReturnCode::Success)).await
    }

    pub async fn deliver(&mut self, topic: &str, payload: impl Into<Vec<u8>>) -> Fed {
        self.feed(publish(topic, payload)).await
    }

    async fn apply(&mut self, action: Action) -> Fed {
        match action {
            Action::Subscribe(filters) => Fed::Subscribed(filters),
            Action::Deliver(message) => Fed::Dispatched(self.bridge.dispatch(message).await),
            Action::Retry { reason } => {
                debug!(reason = %reason, "harness: retry");
                Fed::Retrying(reason)
            }
            Action::GiveUp { attempts, .. } => Fed::GaveUp { attempts },
            Action::Ignore => Fed::Ignored,
        }
    }

    pub fn stop(&mut self) {
        self.supervisor.stop();
    }
}

pub fn connack(code: ConnectReturnCode) -> Event {
    Event::Incoming(Packet::ConnAck(ConnAck {
        session_present: false,
        code,
    }))
}

pub fn publish(topic: &str, payload: impl Into<Vec<u8>>) -> Event {
    Event::Incoming(Packet::Publish(Publish::new(topic, QoS::AtMostOnce, payload)))
}

pub fn refused() -> ConnectionError {
    ConnectionError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "connection refused",
    ))
}

fn init_tracing() {
    // Several harnesses share one test binary; only the first init wins.
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}
