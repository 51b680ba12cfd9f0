use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tracing::{info, warn};

use crate::models::TopicKind;

/// Env var naming the YAML config file.
pub const CONFIG_ENV: &str = "HOMEWATCH_BRIDGE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "bridge.yaml";

/// Room for the subscribe batch sent on CONNACK plus the final DISCONNECT.
pub const MIN_CHANNEL_CAPACITY: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub broker: BrokerConfig,
    pub topics: TopicsConfig,
    pub store: StoreConfig,
    pub http: HttpConfig,
    /// Interval between stats summaries in the log; 0 disables them.
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Request channel capacity of the MQTT client.
    pub channel_capacity: usize,
    pub max_packet_size: usize,
    pub reconnect_delay_secs: u64,
    /// Consecutive failed attempts tolerated before the first successful
    /// connection. 0 retries forever.
    pub startup_attempts: u32,
    pub tls: TlsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// PEM CA bundle; the platform roots are used when absent.
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub sensor_data: String,
    pub alerts: String,
    pub heartbeat: String,
    /// Extra filters to subscribe to; their messages land in `unknown_messages`.
    pub extra_subscriptions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Firestore,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Service-account key file (firestore backend).
    pub credentials_path: PathBuf,
    /// Overrides the Firestore API origin, e.g. for an emulator.
    pub endpoint: Option<String>,
    /// Root directory (file backend).
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address for the `/health` endpoint; disabled when unset.
    pub listen: Option<SocketAddr>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            topics: TopicsConfig::default(),
            store: StoreConfig::default(),
            http: HttpConfig::default(),
            stats_interval_secs: 300,
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8883,
            client_id: "homewatch-bridge".into(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            channel_capacity: 10,
            max_packet_size: 256 * 1024,
            reconnect_delay_secs: 2,
            startup_attempts: 5,
            tls: TlsConfig::default(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_path: None,
            client_cert_path: None,
            client_key_path: None,
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            sensor_data: "home/sensors/data".into(),
            alerts: "home/sensors/alerts".into(),
            heartbeat: "home/heartbeat".into(),
            extra_subscriptions: Vec::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Firestore,
            credentials_path: PathBuf::from("firebase-key.json"),
            endpoint: None,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl FromStr for StoreBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "firestore" => Ok(StoreBackend::Firestore),
            "file" => Ok(StoreBackend::File),
            _ => Err(()),
        }
    }
}

impl TopicsConfig {
    /// Exact-match classification; everything unrecognised is `Unclassified`.
    pub fn classify(&self, topic: &str) -> TopicKind {
        if topic == self.sensor_data {
            TopicKind::SensorData
        } else if topic == self.alerts {
            TopicKind::Alert
        } else if topic == self.heartbeat {
            TopicKind::Heartbeat
        } else {
            TopicKind::Unclassified
        }
    }

    /// Filters to subscribe to on every successful connection, without duplicates.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        [&self.sensor_data, &self.alerts, &self.heartbeat]
            .into_iter()
            .chain(self.extra_subscriptions.iter())
            .filter(|topic| seen.insert(topic.to_string()))
            .cloned()
            .collect()
    }
}

impl BrokerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl BridgeConfig {
    /// Reads a YAML file. A missing or empty file yields the defaults.
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies environment overrides; `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.broker.port = parse_env("MQTT_PORT", port)?;
        }
        if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
            self.broker.client_id = client_id;
        }
        if let Some(username) = lookup("MQTT_USERNAME") {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.broker.password = Some(password);
        }
        if let Some(tls) = lookup("MQTT_TLS") {
            self.broker.tls.enabled = parse_flag("MQTT_TLS", tls)?;
        }
        if let Some(backend) = lookup("STORE_BACKEND") {
            self.store.backend = backend
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { key: "STORE_BACKEND", value: backend })?;
        }
        if let Some(path) = lookup("STORE_CREDENTIALS") {
            self.store.credentials_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("STORE_DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
        if let Some(listen) = lookup("HTTP_LISTEN") {
            self.http.listen = Some(parse_env("HTTP_LISTEN", listen)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.host must not be empty".into()));
        }
        if broker.port == 0 {
            return Err(ConfigError::Invalid("broker.port must not be 0".into()));
        }
        if broker.client_id.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.client_id must not be empty".into()));
        }
        if broker.keep_alive_secs < 5 {
            return Err(ConfigError::Invalid("broker.keep_alive_secs must be at least 5".into()));
        }
        if broker.channel_capacity < MIN_CHANNEL_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "broker.channel_capacity must be at least {MIN_CHANNEL_CAPACITY}"
            )));
        }
        if broker.password.is_some() && broker.username.is_none() {
            return Err(ConfigError::Invalid("broker.password requires broker.username".into()));
        }

        let tls = &broker.tls;
        if tls.client_cert_path.is_some() != tls.client_key_path.is_some() {
            return Err(ConfigError::Invalid(
                "tls.client_cert_path and tls.client_key_path must be set together".into(),
            ));
        }
        if tls.client_cert_path.is_some() && tls.ca_path.is_none() {
            return Err(ConfigError::Invalid(
                "tls.ca_path is required when a client certificate is configured".into(),
            ));
        }
        if !tls.enabled && (tls.ca_path.is_some() || tls.client_cert_path.is_some()) {
            return Err(ConfigError::Invalid(
                "TLS material configured but tls.enabled is false".into(),
            ));
        }

        let topics = [&self.topics.sensor_data, &self.topics.alerts, &self.topics.heartbeat];
        if topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid("topics must not be empty".into()));
        }
        let distinct: HashSet<&str> = topics.iter().map(|t| t.as_str()).collect();
        if distinct.len() != topics.len() {
            return Err(ConfigError::Invalid(
                "sensor_data, alerts and heartbeat topics must differ".into(),
            ));
        }
        if let Some(bad) = self
            .topics
            .subscriptions()
            .into_iter()
            .find(|filter| !rumqttc::valid_filter(filter))
        {
            return Err(ConfigError::Invalid(format!("invalid topic filter {bad:?}")));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}

fn parse_flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { key, value }),
    }
}

/// Loads the config named by `HOMEWATCH_BRIDGE_CONFIG` (default `bridge.yaml`),
/// then applies environment overrides and validates the result.
pub async fn load_config() -> Result<BridgeConfig, ConfigError> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = BridgeConfig::from_file(Path::new(&path)).await?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    info!(
        broker = %config.broker.address(),
        tls = config.broker.tls.enabled,
        store = ?config.store.backend,
        "configuration loaded"
    );
    Ok(config)
}
