//! Topic patterns and device topic parsing.
//!
//! Device topics look like `device/{device_id}/{category}/{action}`; the
//! three segment form `device/{device_id}/{category}` is valid too. Deeper
//! topics keep segment three as the category and join the rest as the
//! action.

use fieldlink_core::config::topics::{COMMAND_CATEGORY, DEVICE_PREFIX};

use crate::error::{GatewayError, GatewayResult};

/// Check whether `topic` matches the subscription `pattern`.
///
/// `+` matches exactly one segment, a trailing `#` matches all remaining
/// segments (including none), literal segments must match exactly. Without
/// `#` the segment counts must be equal.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) => {
                if p != t {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Validate a subscription pattern.
pub fn validate_pattern(pattern: &str) -> GatewayResult<()> {
    if pattern.is_empty() {
        return Err(GatewayError::Configuration("empty topic pattern".to_string()));
    }
    let parts: Vec<&str> = pattern.split('/').collect();
    for (i, part) in parts.iter().enumerate() {
        if part.contains('#') && (*part != "#" || i != parts.len() - 1) {
            return Err(GatewayError::Configuration(format!(
                "'#' must be the last segment of a topic pattern: {}",
                pattern
            )));
        }
        if part.contains('+') && *part != "+" {
            return Err(GatewayError::Configuration(format!(
                "'+' must occupy a whole segment: {}",
                pattern
            )));
        }
    }
    Ok(())
}

/// A parsed device topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopic {
    pub device_id: String,
    pub category: String,
    pub action: Option<String>,
}

impl DeviceTopic {
    /// Parse `device/{id}/{category}[/{action}...]`.
    ///
    /// Returns `None` for topics outside the device namespace.
    pub fn parse(topic: &str) -> Option<Self> {
        let mut parts = topic.splitn(4, '/');
        if parts.next()? != DEVICE_PREFIX {
            return None;
        }
        let device_id = parts.next()?;
        let category = parts.next()?;
        if device_id.is_empty() || category.is_empty() {
            return None;
        }
        let action = parts
            .next()
            .filter(|a| !a.is_empty())
            .map(str::to_string);

        Some(Self {
            device_id: device_id.to_string(),
            category: category.to_string(),
            action,
        })
    }

    /// Name of the bare action event: the action, or the category for
    /// three segment topics.
    pub fn action_name(&self) -> &str {
        self.action.as_deref().unwrap_or(&self.category)
    }
}

/// Outbound command topic for a device.
pub fn command_topic(device_id: &str, command: &str) -> String {
    format!("{}/{}/{}/{}", DEVICE_PREFIX, device_id, COMMAND_CATEGORY, command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("device/+/status", "device/abc/status"));
        assert!(!matches("device/+/status", "device/abc/def/status"));
        assert!(!matches("device/+/status", "device/abc"));
        assert!(!matches("device/+/status", "device/abc/heartbeat"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("device/+/storage/#", "device/abc/storage/list"));
        assert!(matches("device/+/storage/#", "device/abc/storage/sub/path"));
        assert!(matches("device/+/storage/#", "device/abc/storage"));
        assert!(!matches("device/+/storage/#", "device/abc/status/list"));
        assert!(matches("#", "anything/at/all"));
    }

    #[test]
    fn test_literal_match() {
        assert!(matches("device/abc/status", "device/abc/status"));
        assert!(!matches("device/abc/status", "device/abd/status"));
        assert!(!matches("device/abc", "device/abc/status"));
    }

    #[test]
    fn test_validate_pattern() {
        assert!(validate_pattern("device/+/+/#").is_ok());
        assert!(validate_pattern("device/#/status").is_err());
        assert!(validate_pattern("device/a+/status").is_err());
        assert!(validate_pattern("").is_err());
    }

    #[test]
    fn test_parse_device_topic() {
        let four = DeviceTopic::parse("device/abc/storage/list").unwrap();
        assert_eq!(four.device_id, "abc");
        assert_eq!(four.category, "storage");
        assert_eq!(four.action.as_deref(), Some("list"));
        assert_eq!(four.action_name(), "list");

        let three = DeviceTopic::parse("device/abc/status").unwrap();
        assert_eq!(three.category, "status");
        assert_eq!(three.action, None);
        assert_eq!(three.action_name(), "status");

        let deep = DeviceTopic::parse("device/abc/storage/sub/path").unwrap();
        assert_eq!(deep.action.as_deref(), Some("sub/path"));

        assert!(DeviceTopic::parse("sensors/abc/status").is_none());
        assert!(DeviceTopic::parse("device//status").is_none());
        assert!(DeviceTopic::parse("device/abc").is_none());
    }

    #[test]
    fn test_command_topic() {
        assert_eq!(command_topic("dev1", "get-status"), "device/dev1/command/get-status");
    }
}
