//! Broker connection lifecycle and the receive loop.
//!
//! The [`Supervisor`] is a pure state machine over rumqttc events: it decides
//! when to subscribe, when to hand a message to the pipeline and when to give
//! up on startup. [`run`] drives it from the event loop.

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet, QoS, SubscribeFilter, Transport,
};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, error, info, warn};

use crate::bridge::Bridge;
use crate::config::{BridgeConfig, BrokerConfig, TlsConfig};
use crate::error::StartupError;
use crate::models::InboundMessage;
use crate::stats::{BridgeStats, LifecycleState};

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// What the receive loop should do after an event.
#[derive(Debug)]
pub enum Action {
    /// Connection acknowledged: (re)subscribe to these filters.
    Subscribe(Vec<String>),
    Deliver(InboundMessage),
    /// Connection lost or refused; the event loop reconnects on the next poll.
    Retry { reason: String },
    /// Never connected and out of startup attempts.
    GiveUp { attempts: u32, last_error: String },
    Ignore,
}

pub struct Supervisor {
    subscriptions: Vec<String>,
    startup_attempts: u32,
    stats: BridgeStats,
    ever_connected: bool,
    failed_attempts: u32,
}

impl Supervisor {
    pub fn new(subscriptions: Vec<String>, startup_attempts: u32, stats: BridgeStats) -> Self {
        stats.set_state(LifecycleState::Connecting);
        Self {
            subscriptions,
            startup_attempts,
            stats,
            ever_connected: false,
            failed_attempts: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.stats.state()
    }

    pub fn on_event(&mut self, event: Event) -> Action {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
                if self.ever_connected {
                    info!("reconnected to broker");
                } else {
                    info!("connected to broker");
                }
                self.ever_connected = true;
                self.failed_attempts = 0;
                self.stats.set_state(LifecycleState::Running);
                Action::Subscribe(self.subscriptions.clone())
            }
            Event::Incoming(Packet::ConnAck(ack)) => {
                self.on_failure(format!("connection refused: {:?}", ack.code))
            }
            Event::Incoming(Packet::Publish(publish)) => {
                // Anything delivered before CONNACK is not ours to process.
                if self.state() != LifecycleState::Running {
                    return Action::Ignore;
                }
                Action::Deliver(InboundMessage::new(publish.topic, publish.payload.to_vec()))
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                debug!(pkid = ack.pkid, "subscription acknowledged");
                Action::Ignore
            }
            _ => Action::Ignore,
        }
    }

    pub fn on_connection_error(&mut self, err: &ConnectionError) -> Action {
        self.on_failure(err.to_string())
    }

    fn on_failure(&mut self, reason: String) -> Action {
        if self.state() == LifecycleState::Running {
            self.stats.record_reconnect();
        }
        self.stats.set_state(LifecycleState::Connecting);

        if !self.ever_connected {
            self.failed_attempts += 1;
            if self.startup_attempts > 0 && self.failed_attempts >= self.startup_attempts {
                self.stats.set_state(LifecycleState::FailedStartup);
                return Action::GiveUp {
                    attempts: self.failed_attempts,
                    last_error: reason,
                };
            }
        }
        Action::Retry { reason }
    }

    pub fn stop(&mut self) {
        self.stats.set_state(LifecycleState::Stopped);
    }
}

pub fn mqtt_options(config: &BrokerConfig) -> Result<MqttOptions, StartupError> {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
    options.set_clean_session(true);
    options.set_max_packet_size(config.max_packet_size, config.max_packet_size);
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }
    if config.tls.enabled {
        options.set_transport(build_transport(&config.tls)?);
    }
    Ok(options)
}

/// TLS transport from the configured material; platform roots when no CA is given.
pub fn build_transport(tls: &TlsConfig) -> Result<Transport, StartupError> {
    let client_auth = match (&tls.client_cert_path, &tls.client_key_path) {
        (Some(cert), Some(key)) => Some((read_material(cert)?, read_material(key)?)),
        _ => None,
    };
    match &tls.ca_path {
        Some(ca) => Ok(Transport::tls(read_material(ca)?, client_auth, None)),
        None => Ok(Transport::tls_with_default_config()),
    }
}

fn read_material(path: &Path) -> Result<Vec<u8>, StartupError> {
    std::fs::read(path).map_err(|source| StartupError::TlsMaterial {
        path: path.to_path_buf(),
        source,
    })
}

/// Runs the receive loop until `shutdown` resolves.
///
/// Each delivered message is processed to completion before the next poll.
/// `shutdown` is also raced against the message in flight, so a store call
/// that never returns cannot hold the process. Returns an error only when the
/// broker could not be reached during startup.
pub async fn run<F>(config: &BridgeConfig, bridge: &Bridge, shutdown: F) -> Result<(), StartupError>
where
    F: Future<Output = ()>,
{
    let options = mqtt_options(&config.broker)?;
    let (client, mut eventloop) = AsyncClient::new(options, config.broker.channel_capacity);
    let mut supervisor = Supervisor::new(
        config.topics.subscriptions(),
        config.broker.startup_attempts,
        bridge.stats().clone(),
    );
    let address = config.broker.address();
    let reconnect_delay = Duration::from_secs(config.broker.reconnect_delay_secs);
    let mut stats_timer = stats_timer(config.stats_interval_secs);

    tokio::pin!(shutdown);
    info!(broker = %address, tls = config.broker.tls.enabled, "connecting to broker");

    loop {
        let event = tokio::select! {
            _ = &mut shutdown => break,
            _ = tick(&mut stats_timer) => {
                bridge.stats().log_summary();
                continue;
            }
            event = eventloop.poll() => event,
        };

        let action = match event {
            Ok(event) => supervisor.on_event(event),
            Err(err) => supervisor.on_connection_error(&err),
        };

        match action {
            Action::Subscribe(filters) => {
                if let Err(e) = subscribe(&client, &filters) {
                    error!(filters = filters.len(), error = %e, "subscribe request failed");
                }
            }
            Action::Deliver(message) => {
                if !dispatch_until(bridge, message, &mut shutdown).await {
                    warn!("shutdown requested while a message was in flight");
                    break;
                }
            }
            Action::Retry { reason } => {
                warn!(
                    broker = %address,
                    error = %reason,
                    delay_s = reconnect_delay.as_secs(),
                    "broker connection failed, retrying"
                );
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
            }
            Action::GiveUp { attempts, last_error } => {
                error!(broker = %address, attempts, error = %last_error, "giving up on broker");
                return Err(StartupError::BrokerUnreachable {
                    address,
                    attempts,
                    last_error,
                });
            }
            Action::Ignore => {}
        }
    }

    info!("shutdown requested, disconnecting");
    disconnect(&client, &mut eventloop).await;
    supervisor.stop();
    bridge.stats().log_summary();
    Ok(())
}

/// Queues every filter as a single SUBSCRIBE, so the request channel only
/// needs one free slot whatever the number of filters.
fn subscribe(client: &AsyncClient, filters: &[String]) -> Result<(), ClientError> {
    client.try_subscribe_many(subscribe_filters(filters))?;
    for filter in filters {
        info!(topic = %filter, "subscribing");
    }
    Ok(())
}

fn subscribe_filters(filters: &[String]) -> Vec<SubscribeFilter> {
    filters
        .iter()
        .map(|filter| SubscribeFilter::new(filter.clone(), QoS::AtMostOnce))
        .collect()
}

/// Dispatches one message unless `shutdown` resolves first.
/// Returns `false` when the message was abandoned for shutdown.
async fn dispatch_until<S>(bridge: &Bridge, message: InboundMessage, shutdown: S) -> bool
where
    S: Future<Output = ()>,
{
    tokio::select! {
        _ = shutdown => false,
        _ = bridge.dispatch(message) => true,
    }
}

/// Sends DISCONNECT and polls until it is flushed or the grace period ends.
/// Messages arriving meanwhile are not processed.
async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(e) = client.try_disconnect() {
        warn!(error = %e, "disconnect request failed");
        return;
    }
    let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        warn!("broker did not acknowledge disconnect in time");
    }
}

fn stats_timer(interval_secs: u64) -> Option<Interval> {
    (interval_secs > 0).then(|| {
        let period = Duration::from_secs(interval_secs);
        interval_at(Instant::now() + period, period)
    })
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
