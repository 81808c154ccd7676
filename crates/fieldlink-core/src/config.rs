//! Shared configuration defaults and environment variable names.
//!
//! Every crate in the workspace reads its defaults from here so the numbers
//! are defined once.

/// Broker connection defaults.
pub mod broker {
    pub const DEFAULT_HOST: &str = "localhost";
    pub const DEFAULT_PORT: u16 = 1883;
    pub const DEFAULT_CLIENT_ID_PREFIX: &str = "fieldlink";
    pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
    pub const DEFAULT_WS_PATH: &str = "/mqtt";
    /// Outgoing request queue size of the MQTT client
    pub const REQUEST_CHANNEL_CAPACITY: usize = 64;
    /// 10MB, large enough for file transfer payloads
    pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;
}

/// Reconnect backoff defaults.
pub mod reconnect {
    pub const DEFAULT_BASE_DELAY_MS: u64 = 5_000;
    pub const DEFAULT_GROWTH: f64 = 1.5;
    pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
}

/// Presence tracking defaults.
pub mod presence {
    /// Silence after which a device is considered offline
    pub const DEFAULT_LIVENESS_WINDOW_SECS: u64 = 120;
    /// Silence after which an offline device record is purged
    pub const DEFAULT_RETENTION_WINDOW_SECS: u64 = 300;
    pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 30;
    pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;
}

/// Command timeouts, scaled to the latency expected on the device side.
pub mod timeouts {
    /// Liveness check (ping)
    pub const PING_MS: u64 = 5_000;
    /// Short queries answered from device memory
    pub const QUERY_MS: u64 = 10_000;
    /// Operations that need physical action on the device (dialing, sending)
    pub const PHYSICAL_ACTION_MS: u64 = 60_000;
    /// Bulk data transfer (file read/write)
    pub const BULK_TRANSFER_MS: u64 = 60_000;
}

/// Topic and envelope conventions.
pub mod topics {
    pub const DEVICE_PREFIX: &str = "device";
    pub const COMMAND_CATEGORY: &str = "command";
    pub const STATUS_CATEGORY: &str = "status";
    pub const DEFAULT_SOURCE_TAG: &str = "fieldlink-gateway";
    pub const CORRELATION_FIELD: &str = "correlation_id";
    pub const TIMESTAMP_FIELD: &str = "timestamp";
    pub const SOURCE_FIELD: &str = "source";

    /// Subscriptions registered when none are configured.
    pub fn default_subscriptions() -> Vec<String> {
        vec!["device/+/+".to_string(), "device/+/+/#".to_string()]
    }
}

/// Environment variable names.
pub mod env_vars {
    pub const MQTT_HOST: &str = "FIELDLINK_MQTT_HOST";
    pub const MQTT_PORT: &str = "FIELDLINK_MQTT_PORT";
    pub const MQTT_SCHEME: &str = "FIELDLINK_MQTT_SCHEME";
    pub const MQTT_USERNAME: &str = "FIELDLINK_MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "FIELDLINK_MQTT_PASSWORD";
    pub const MQTT_CLIENT_ID: &str = "FIELDLINK_MQTT_CLIENT_ID";
    pub const MQTT_KEEP_ALIVE_SECS: &str = "FIELDLINK_MQTT_KEEPALIVE_SECS";
    pub const MQTT_CONNECT_TIMEOUT_MS: &str = "FIELDLINK_MQTT_CONNECT_TIMEOUT_MS";
    pub const RECONNECT_MAX_ATTEMPTS: &str = "FIELDLINK_RECONNECT_MAX_ATTEMPTS";
    pub const LIVENESS_WINDOW_SECS: &str = "FIELDLINK_LIVENESS_WINDOW_SECS";
    pub const RETENTION_WINDOW_SECS: &str = "FIELDLINK_RETENTION_WINDOW_SECS";
    pub const SUBSCRIPTIONS: &str = "FIELDLINK_SUBSCRIPTIONS";
    pub const SOURCE_TAG: &str = "FIELDLINK_SOURCE_TAG";
    pub const LOG_JSON: &str = "FIELDLINK_LOG_JSON";
}

/// Read an environment variable and parse it, ignoring unset or unparsable values.
pub fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Read a non-empty environment variable.
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Split a comma separated list, dropping empty entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list("device/+/+, device/+/storage/#,,"),
            vec!["device/+/+".to_string(), "device/+/storage/#".to_string()]
        );
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_env_parse_ignores_garbage() {
        std::env::set_var("FIELDLINK_TEST_ENV_PARSE", "not-a-number");
        assert_eq!(env_parse::<u16>("FIELDLINK_TEST_ENV_PARSE"), None);
        std::env::set_var("FIELDLINK_TEST_ENV_PARSE", " 8883 ");
        assert_eq!(env_parse::<u16>("FIELDLINK_TEST_ENV_PARSE"), Some(8883));
        std::env::remove_var("FIELDLINK_TEST_ENV_PARSE");
    }

    #[test]
    fn test_retention_not_shorter_than_liveness() {
        assert!(presence::DEFAULT_RETENTION_WINDOW_SECS >= presence::DEFAULT_LIVENESS_WINDOW_SECS);
    }
}
