//! Engine configuration
//!
//! One TOML file describes the broker, the client identity used at CONNECT
//! time, the engine's resource limits and (for the CLI) a list of startup
//! subscriptions. Credentials are never stored in the file; the file names
//! the environment variables that hold them.

use crate::engine::{ConnectInfo, Credentials};
use crate::protocol::packet::{qos_serde, LastWill, QoS};
use crate::protocol::topic::{validate_topic_filter, validate_topic_name};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Smallest receive buffer the engine accepts
pub const MIN_NETWORK_BUFFER: usize = 256;
/// Longest handle descriptor accepted by `create`
pub const MAX_DESCRIPTOR_LEN: usize = 20;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub broker: BrokerInfo,
    pub client: ClientSection,
    #[serde(default)]
    pub limits: Limits,
    /// Subscriptions made by the CLI after connecting
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Broker address; immutable once a handle is created
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerInfo {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Present when the connection must be secured
    pub tls: Option<TlsSettings>,
}

fn default_port() -> u16 {
    1883
}

impl fmt::Display for BrokerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls.is_some() { "mqtts" } else { "mqtt" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

impl BrokerInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
        }
    }

    /// Parse `mqtt://host[:port]` or `mqtts://host[:port]`
    pub fn from_url(broker_url: &str) -> Result<Self, ConfigError> {
        let url = url::Url::parse(broker_url)
            .map_err(|e| ConfigError::InvalidConfig(format!("broker URL '{broker_url}': {e}")))?;
        let (tls, default_port) = match url.scheme() {
            "mqtt" | "tcp" => (None, 1883),
            "mqtts" | "ssl" => (Some(TlsSettings::default()), 8883),
            other => {
                return Err(ConfigError::InvalidConfig(format!(
                    "unsupported broker scheme '{other}'"
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ConfigError::InvalidConfig(format!("broker URL '{broker_url}' has no host")))?
            .to_string();

        let broker = Self {
            host,
            port: url.port().unwrap_or(default_port),
            tls,
        };
        broker.validate()?;
        Ok(broker)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("broker host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidConfig("broker port must not be 0".into()));
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }
}

/// Certificate material for secured connections
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TlsSettings {
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// SNI override; defaults to the broker host
    pub server_name: Option<String>,
    #[serde(default)]
    pub alpn: Vec<String>,
}

impl TlsSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(ConfigError::InvalidConfig(
                "client_cert_path and client_key_path must be set together".into(),
            ));
        }
        if self.server_name.as_deref().is_some_and(|name| name.trim().is_empty()) {
            return Err(ConfigError::InvalidConfig("TLS server_name must not be empty".into()));
        }
        if self.alpn.iter().any(|protocol| protocol.is_empty()) {
            return Err(ConfigError::InvalidConfig("ALPN protocol names must not be empty".into()));
        }
        Ok(())
    }
}

/// Client identity and session options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// Short unique name for the handle
    pub descriptor: String,
    /// MQTT client identifier; generated when empty
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_clean_session")]
    pub clean_session: bool,
    /// Keepalive interval in seconds; 0 disables keepalive
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u16,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    pub will: Option<WillConfig>,
}

fn default_clean_session() -> bool {
    true
}

fn default_keepalive_secs() -> u16 {
    60
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WillConfig {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default = "default_qos", with = "qos_serde")]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

fn default_qos() -> QoS {
    QoS::AtMostOnce
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionConfig {
    pub filter: String,
    #[serde(default = "default_qos", with = "qos_serde")]
    pub qos: QoS,
}

/// Engine-wide resource limits and timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Limits {
    pub max_handles: usize,
    /// Concurrent QoS 1/2 publishes awaiting acknowledgement, per handle
    pub max_outgoing_publishes: usize,
    /// Concurrent subscribe and unsubscribe requests, per handle
    pub max_outgoing_subscribes: usize,
    pub ack_receive_timeout_ms: u64,
    pub message_send_timeout_ms: u64,
    pub message_receive_timeout_ms: u64,
    /// Retransmissions before an outgoing request is failed
    pub max_retry: u32,
    pub network_buffer_size: usize,
    /// Largest inbound packet accepted before the session is torn down
    pub max_packet_size: usize,
    /// Queued events per handle at which a slow callback is reported
    pub event_queue_warn_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_handles: 2,
            max_outgoing_publishes: 1,
            max_outgoing_subscribes: 1,
            ack_receive_timeout_ms: 3000,
            message_send_timeout_ms: 3000,
            message_receive_timeout_ms: 500,
            max_retry: 3,
            network_buffer_size: 1024,
            max_packet_size: 256 * 1024,
            event_queue_warn_depth: 1024,
        }
    }
}

impl Limits {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_receive_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.message_send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.message_receive_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidConfig(msg.to_string()));
        if self.max_handles == 0 || self.max_handles > u16::MAX as usize {
            return invalid("max_handles must be between 1 and 65535");
        }
        if self.max_outgoing_publishes == 0 || self.max_outgoing_subscribes == 0 {
            return invalid("outgoing request capacities must be at least 1");
        }
        if self.max_outgoing_publishes + self.max_outgoing_subscribes > u16::MAX as usize {
            return invalid("outgoing request capacities exceed the packet id space");
        }
        if self.ack_receive_timeout_ms == 0
            || self.message_send_timeout_ms == 0
            || self.message_receive_timeout_ms == 0
        {
            return invalid("timeouts must be greater than zero");
        }
        if self.network_buffer_size < MIN_NETWORK_BUFFER {
            return Err(ConfigError::InvalidConfig(format!(
                "network_buffer_size must be at least {MIN_NETWORK_BUFFER}"
            )));
        }
        if self.max_packet_size < self.network_buffer_size {
            return invalid("max_packet_size must not be smaller than network_buffer_size");
        }
        if self.event_queue_warn_depth == 0 {
            return invalid("event_queue_warn_depth must be at least 1");
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;
        self.limits.validate()?;
        self.client.validate()?;
        for subscription in &self.subscriptions {
            validate_topic_filter(&subscription.filter).map_err(|e| {
                ConfigError::InvalidConfig(format!("subscription '{}': {e}", subscription.filter))
            })?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
host = "localhost"

[client]
descriptor = "test-client"
client_id = "test-client-id"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

impl ClientSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_descriptor(&self.descriptor)?;
        if let Some(will) = &self.will {
            validate_topic_name(&will.topic)
                .map_err(|e| ConfigError::InvalidConfig(format!("will topic: {e}")))?;
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Get username from environment variable
    pub fn username(&self) -> Result<Option<String>, ConfigError> {
        self.username_env
            .as_deref()
            .map(get_env_var_required)
            .transpose()
    }

    /// Get password from environment variable
    pub fn password(&self) -> Result<Option<String>, ConfigError> {
        self.password_env
            .as_deref()
            .map(get_env_var_required)
            .transpose()
    }

    /// Build CONNECT parameters, resolving credentials from the environment
    pub fn connect_info(&self) -> Result<ConnectInfo, ConfigError> {
        let credentials = match (self.username()?, self.password()?) {
            (Some(username), password) => Some(Credentials { username, password }),
            (None, Some(_)) => {
                return Err(ConfigError::InvalidConfig(
                    "password_env requires username_env".into(),
                ))
            }
            (None, None) => None,
        };
        let will = self.will.as_ref().map(|will| LastWill {
            topic: will.topic.clone(),
            message: will.payload.clone().into(),
            qos: will.qos,
            retain: will.retain,
        });

        Ok(ConnectInfo {
            client_id: self.client_id.clone(),
            clean_session: self.clean_session,
            keepalive_secs: self.keepalive_secs,
            credentials,
            will,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        })
    }
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

/// Validate a handle descriptor: 1..=20 characters from [a-zA-Z0-9._-]
pub fn validate_descriptor(descriptor: &str) -> Result<(), ConfigError> {
    let valid_chars = descriptor
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if descriptor.is_empty() || descriptor.len() > MAX_DESCRIPTOR_LEN || !valid_chars {
        return Err(ConfigError::InvalidDescriptor(format!(
            "'{descriptor}' must be 1-{MAX_DESCRIPTOR_LEN} characters of [a-zA-Z0-9._-]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
host = "broker.example.com"
port = 8883

[broker.tls]
ca_cert_path = "/etc/ssl/ca.pem"
alpn = ["x-amzn-mqtt-ca"]

[client]
descriptor = "sensor-1"
client_id = "sensor-1-client"
clean_session = false
keepalive_secs = 30
username_env = "MQTT_USERNAME"

[client.will]
topic = "sensors/1/status"
payload = "offline"
qos = 1
retain = true

[limits]
max_handles = 4
max_outgoing_publishes = 8
max_retry = 5

[[subscriptions]]
filter = "commands/sensor-1/#"
qos = 2
"#;

        let config: EngineConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.broker.port, 8883);
        let tls = config.broker.tls.as_ref().unwrap();
        assert_eq!(tls.ca_cert_path.as_deref(), Some(Path::new("/etc/ssl/ca.pem")));
        assert_eq!(tls.alpn, vec!["x-amzn-mqtt-ca"]);
        assert!(!config.client.clean_session);
        assert_eq!(config.client.will.as_ref().unwrap().qos, QoS::AtLeastOnce);
        assert_eq!(config.limits.max_handles, 4);
        assert_eq!(config.limits.max_outgoing_publishes, 8);
        // untouched limits keep their defaults
        assert_eq!(config.limits.ack_receive_timeout_ms, 3000);
        assert_eq!(config.subscriptions[0].qos, QoS::ExactlyOnce);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tls_client_identity_requires_cert_and_key() {
        let mut broker = BrokerInfo::new("broker.example.com", 8883);
        broker.tls = Some(TlsSettings {
            client_cert_path: Some(PathBuf::from("/etc/mqtt/client.pem")),
            ..TlsSettings::default()
        });
        assert!(matches!(broker.validate(), Err(ConfigError::InvalidConfig(_))));

        broker.tls = Some(TlsSettings {
            client_cert_path: Some(PathBuf::from("/etc/mqtt/client.pem")),
            client_key_path: Some(PathBuf::from("/etc/mqtt/client.key")),
            ..TlsSettings::default()
        });
        assert!(broker.validate().is_ok());

        broker.tls = Some(TlsSettings {
            alpn: vec![String::new()],
            ..TlsSettings::default()
        });
        assert!(broker.validate().is_err());
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = EngineConfig::test_config();
        assert_eq!(config.broker.port, 1883);
        assert!(config.broker.tls.is_none());
        assert!(config.client.clean_session);
        assert_eq!(config.client.keepalive_secs, 60);
        assert_eq!(config.limits, Limits::default());
        assert!(config.subscriptions.is_empty());
    }

    #[test]
    fn test_default_limits() {
        let limits = Limits::default();
        assert_eq!(limits.max_handles, 2);
        assert_eq!(limits.ack_timeout(), Duration::from_millis(3000));
        assert_eq!(limits.send_timeout(), Duration::from_millis(3000));
        assert_eq!(limits.receive_timeout(), Duration::from_millis(500));
        assert_eq!(limits.max_retry, 3);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_invalid_limits() {
        let limits = Limits {
            max_handles: 0,
            ..Limits::default()
        };
        assert!(limits.validate().is_err());

        let limits = Limits {
            network_buffer_size: 64,
            ..Limits::default()
        };
        assert!(limits.validate().is_err());

        let limits = Limits {
            ack_receive_timeout_ms: 0,
            ..Limits::default()
        };
        assert!(limits.validate().is_err());

        let limits = Limits {
            event_queue_warn_depth: 0,
            ..Limits::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(validate_descriptor("sensor-1").is_ok());
        assert!(validate_descriptor("a.b_c-d").is_ok());
        assert!(validate_descriptor("").is_err());
        assert!(validate_descriptor("has space").is_err());
        assert!(validate_descriptor(&"x".repeat(MAX_DESCRIPTOR_LEN + 1)).is_err());
    }

    #[test]
    fn test_broker_from_url() {
        let broker = BrokerInfo::from_url("mqtt://localhost").unwrap();
        assert_eq!(broker.port, 1883);
        assert!(broker.tls.is_none());

        let broker = BrokerInfo::from_url("mqtts://broker.example.com:9999").unwrap();
        assert_eq!(broker.port, 9999);
        assert!(broker.tls.is_some());
        assert_eq!(broker.to_string(), "mqtts://broker.example.com:9999");

        assert!(BrokerInfo::from_url("http://localhost").is_err());
        assert!(BrokerInfo::from_url("not a url").is_err());
    }

    #[test]
    fn test_connect_info_requires_present_env_vars() {
        let mut config = EngineConfig::test_config();
        config.client.username_env = Some("MQTT_ENGINE_TEST_MISSING_USER".into());

        let result = config.client.connect_info();
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound(name)) if name == "MQTT_ENGINE_TEST_MISSING_USER"));
    }

    #[test]
    fn test_connect_info_from_section() {
        let mut config = EngineConfig::test_config();
        config.client.will = Some(WillConfig {
            topic: "status".into(),
            payload: "gone".into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        });

        let info = config.client.connect_info().unwrap();
        assert_eq!(info.client_id, "test-client-id");
        assert_eq!(info.keepalive_secs, 60);
        assert_eq!(info.connect_timeout, Duration::from_millis(5000));
        assert!(info.credentials.is_none());
        assert_eq!(info.will.unwrap().message.as_ref(), b"gone");
    }

    #[test]
    fn test_invalid_subscription_filter_rejected() {
        let mut config = EngineConfig::test_config();
        config.subscriptions.push(SubscriptionConfig {
            filter: "a/#/b".into(),
            qos: QoS::AtMostOnce,
        });
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }
}
