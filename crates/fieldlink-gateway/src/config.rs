//! Gateway configuration.
//!
//! Configuration can be built in code (builder methods), deserialized from
//! JSON, or read from `FIELDLINK_*` environment variables. Anything not
//! given falls back to the defaults in [`fieldlink_core::config`].

use std::time::Duration;

use fieldlink_core::config::{self as defaults, env_parse, env_string, env_vars, split_list};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::topic;

/// Transport scheme used to reach the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Plain TCP
    #[default]
    Mqtt,
    /// TLS over TCP
    Mqtts,
    /// Websocket
    Ws,
    /// Websocket over TLS
    Wss,
}

impl Scheme {
    /// Check if the scheme uses TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Mqtts | Self::Wss)
    }

    /// Check if the scheme tunnels MQTT through a websocket.
    pub fn is_websocket(&self) -> bool {
        matches!(self, Self::Ws | Self::Wss)
    }
}

impl std::str::FromStr for Scheme {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Ok(Self::Mqtt),
            "mqtts" | "ssl" | "tls" => Ok(Self::Mqtts),
            "ws" => Ok(Self::Ws),
            "wss" => Ok(Self::Wss),
            other => Err(GatewayError::Configuration(format!(
                "unknown transport scheme: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mqtt => write!(f, "mqtt"),
            Self::Mqtts => write!(f, "mqtts"),
            Self::Ws => write!(f, "ws"),
            Self::Wss => write!(f, "wss"),
        }
    }
}

/// Broker connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOptions {
    /// Broker host name or address
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport scheme
    #[serde(default)]
    pub scheme: Scheme,

    /// Username for authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Client id prefix; a random suffix keeps each process instance unique
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Handshake timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Websocket path (ws/wss only)
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

fn default_host() -> String {
    defaults::broker::DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    defaults::broker::DEFAULT_PORT
}
fn default_client_id() -> String {
    defaults::broker::DEFAULT_CLIENT_ID_PREFIX.to_string()
}
fn default_keep_alive() -> u64 {
    defaults::broker::DEFAULT_KEEP_ALIVE_SECS
}
fn default_connect_timeout() -> u64 {
    defaults::broker::DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_ws_path() -> String {
    defaults::broker::DEFAULT_WS_PATH.to_string()
}

impl BrokerOptions {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            scheme: Scheme::default(),
            username: None,
            password: None,
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_ms: default_connect_timeout(),
            ws_path: default_ws_path(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn full_broker_addr(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Generate a fresh client identifier from the configured prefix.
    pub fn generate_client_id(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.client_id, &suffix[..12])
    }

    pub(crate) fn validate(&self) -> GatewayResult<()> {
        if self.host.trim().is_empty() {
            return Err(GatewayError::Configuration("broker host is empty".to_string()));
        }
        if self.port == 0 {
            return Err(GatewayError::Configuration("broker port must not be 0".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(GatewayError::Configuration("client id prefix is empty".to_string()));
        }
        if self.keep_alive_secs == 0 {
            return Err(GatewayError::Configuration("keep-alive must be at least 1s".to_string()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(GatewayError::Configuration("connect timeout must not be 0".to_string()));
        }
        Ok(())
    }
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self::new(default_host())
    }
}

/// Exponential reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt
    pub base_delay_ms: u64,
    /// Multiplier applied per attempt
    pub growth: f64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Attempts before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: defaults::reconnect::DEFAULT_BASE_DELAY_MS,
            growth: defaults::reconnect::DEFAULT_GROWTH,
            max_delay_ms: defaults::reconnect::DEFAULT_MAX_DELAY_MS,
            max_attempts: defaults::reconnect::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(base × growth^(attempt−1), ceiling)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.growth.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.round() as u64)
    }

    fn validate(&self) -> GatewayResult<()> {
        if !(self.growth.is_finite() && self.growth >= 1.0) {
            return Err(GatewayError::Configuration(
                "backoff growth must be a finite number >= 1".to_string(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(GatewayError::Configuration(
                "backoff base delay exceeds the ceiling".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(GatewayError::Configuration(
                "reconnect max attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Presence tracking windows and sweep cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub liveness_window_secs: u64,
    pub retention_window_secs: u64,
    pub check_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            liveness_window_secs: defaults::presence::DEFAULT_LIVENESS_WINDOW_SECS,
            retention_window_secs: defaults::presence::DEFAULT_RETENTION_WINDOW_SECS,
            check_interval_secs: defaults::presence::DEFAULT_CHECK_INTERVAL_SECS,
            cleanup_interval_secs: defaults::presence::DEFAULT_CLEANUP_INTERVAL_SECS,
        }
    }
}

impl PresenceConfig {
    pub fn liveness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.liveness_window_secs as i64)
    }

    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_window_secs as i64)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    fn validate(&self) -> GatewayResult<()> {
        if self.liveness_window_secs == 0 {
            return Err(GatewayError::Configuration(
                "liveness window must not be 0".to_string(),
            ));
        }
        if self.retention_window_secs < self.liveness_window_secs {
            return Err(GatewayError::Configuration(format!(
                "retention window ({}s) is shorter than the liveness window ({}s)",
                self.retention_window_secs, self.liveness_window_secs
            )));
        }
        if self.check_interval_secs == 0 || self.cleanup_interval_secs == 0 {
            return Err(GatewayError::Configuration(
                "presence sweep intervals must not be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outbound command conventions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Tag written into every envelope's `source` field
    pub source_tag: String,
    /// Timeout used by `publish_command` callers that do not pick one
    pub default_timeout_ms: u64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            source_tag: defaults::topics::DEFAULT_SOURCE_TAG.to_string(),
            default_timeout_ms: defaults::timeouts::QUERY_MS,
        }
    }
}

impl CommandConfig {
    /// Response timeout for a command, falling back to the configured default.
    pub fn timeout(&self, override_ms: Option<u64>) -> Duration {
        Duration::from_millis(override_ms.unwrap_or(self.default_timeout_ms))
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub broker: BrokerOptions,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    #[serde(default)]
    pub presence: PresenceConfig,

    #[serde(default)]
    pub commands: CommandConfig,

    /// Topic patterns subscribed after every (re)connect
    #[serde(default = "defaults::topics::default_subscriptions")]
    pub subscriptions: Vec<String>,

    /// Categories whose messages update the device status snapshot
    #[serde(default = "default_status_categories")]
    pub status_categories: Vec<String>,
}

fn default_status_categories() -> Vec<String> {
    vec![defaults::topics::STATUS_CATEGORY.to_string()]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new(BrokerOptions::default())
    }
}

impl GatewayConfig {
    pub fn new(broker: BrokerOptions) -> Self {
        Self {
            broker,
            reconnect: ReconnectPolicy::default(),
            presence: PresenceConfig::default(),
            commands: CommandConfig::default(),
            subscriptions: defaults::topics::default_subscriptions(),
            status_categories: default_status_categories(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_presence(mut self, presence: PresenceConfig) -> Self {
        self.presence = presence;
        self
    }

    pub fn with_subscriptions(mut self, subscriptions: Vec<String>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    pub fn with_source_tag(mut self, tag: impl Into<String>) -> Self {
        self.commands.source_tag = tag.into();
        self
    }

    /// Build a configuration from `FIELDLINK_*` environment variables.
    pub fn from_env() -> GatewayResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay values from `FIELDLINK_*` environment variables.
    pub fn apply_env(&mut self) -> GatewayResult<()> {
        let broker = &mut self.broker;
        if let Some(host) = env_string(env_vars::MQTT_HOST) {
            broker.host = host;
        }
        if let Some(port) = env_string(env_vars::MQTT_PORT) {
            broker.port = port.parse().map_err(|_| {
                GatewayError::Configuration(format!("invalid {}: {}", env_vars::MQTT_PORT, port))
            })?;
        }
        if let Some(scheme) = env_string(env_vars::MQTT_SCHEME) {
            broker.scheme = scheme.parse()?;
        }
        if let Some(username) = env_string(env_vars::MQTT_USERNAME) {
            broker.username = Some(username);
        }
        if let Some(password) = env_string(env_vars::MQTT_PASSWORD) {
            broker.password = Some(password);
        }
        if let Some(client_id) = env_string(env_vars::MQTT_CLIENT_ID) {
            broker.client_id = client_id;
        }
        if let Some(keep_alive) = env_parse(env_vars::MQTT_KEEP_ALIVE_SECS) {
            broker.keep_alive_secs = keep_alive;
        }
        if let Some(timeout) = env_parse(env_vars::MQTT_CONNECT_TIMEOUT_MS) {
            broker.connect_timeout_ms = timeout;
        }
        if let Some(attempts) = env_parse(env_vars::RECONNECT_MAX_ATTEMPTS) {
            self.reconnect.max_attempts = attempts;
        }
        if let Some(window) = env_parse(env_vars::LIVENESS_WINDOW_SECS) {
            self.presence.liveness_window_secs = window;
        }
        if let Some(window) = env_parse(env_vars::RETENTION_WINDOW_SECS) {
            self.presence.retention_window_secs = window;
        }
        if let Some(list) = env_string(env_vars::SUBSCRIPTIONS) {
            self.subscriptions = split_list(&list);
        }
        if let Some(tag) = env_string(env_vars::SOURCE_TAG) {
            self.commands.source_tag = tag;
        }
        Ok(())
    }

    /// Check the configuration for values the gateway cannot run with.
    pub fn validate(&self) -> GatewayResult<()> {
        self.broker.validate()?;
        self.reconnect.validate()?;
        self.presence.validate()?;
        if self.commands.source_tag.trim().is_empty() {
            return Err(GatewayError::Configuration("source tag is empty".to_string()));
        }
        for pattern in &self.subscriptions {
            topic::validate_pattern(pattern)?;
        }
        Ok(())
    }
}
