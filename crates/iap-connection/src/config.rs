//! Engine configuration

use iap_proto::{ACK_THRESHOLD, MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{TunnelError, TunnelResult};

/// Tunnel engine configuration
///
/// The defaults are the relay's protocol constants; only change them when
/// talking to a relay known to accept different values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    /// Largest payload per Data or Success frame
    pub max_frame_size: usize,

    /// Unacknowledged receive bytes that trigger an Ack frame
    pub ack_threshold: u64,

    /// Bound on waiting for the Success frame
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Chunks buffered between the caller and each loop
    pub conduit_depth: usize,

    /// Close the tunnel when the relay is silent this long (disabled by default)
    #[serde(default, with = "option_duration_secs")]
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            ack_threshold: ACK_THRESHOLD,
            handshake_timeout: Duration::from_secs(30),
            conduit_depth: 1,
            idle_timeout: None,
        }
    }
}

impl ConnectionConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn with_conduit_depth(mut self, depth: usize) -> Self {
        self.conduit_depth = depth;
        self
    }

    /// Validate the configuration for common issues and misconfigurations
    pub fn validate(&self) -> TunnelResult<()> {
        let mut errors = Vec::new();

        if self.max_frame_size == 0 {
            errors.push("Max frame size must be greater than 0".to_string());
        } else if self.max_frame_size > u32::MAX as usize {
            errors.push(format!(
                "Max frame size too large: {} (length field is 32 bits)",
                self.max_frame_size
            ));
        }

        if self.ack_threshold == 0 {
            errors.push("Ack threshold must be greater than 0".to_string());
        }

        if self.handshake_timeout.is_zero() {
            errors.push("Handshake timeout must be greater than 0".to_string());
        }

        if self.conduit_depth == 0 {
            errors.push("Conduit depth must be at least 1".to_string());
        }

        if matches!(self.idle_timeout, Some(timeout) if timeout.is_zero()) {
            errors.push("Idle timeout must be greater than 0 when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TunnelError::Config(errors.join("; ")))
        }
    }
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_frame_size, 16_384);
        assert_eq!(config.ack_threshold, 32_768);
        assert_eq!(config.idle_timeout, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let config = ConnectionConfig {
            max_frame_size: 0,
            conduit_depth: 0,
            ..Default::default()
        };

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Max frame size"));
        assert!(err.contains("Conduit depth"));
    }

    #[test]
    fn test_deserialize_with_missing_idle_timeout() {
        let json = r#"{
            "max_frame_size": 16384,
            "ack_threshold": 65536,
            "handshake_timeout": 10,
            "conduit_depth": 4
        }"#;

        let config: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.ack_threshold, 65_536);
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, None);
    }

    #[test]
    fn test_idle_timeout_serialized_as_seconds() {
        let config = ConnectionConfig::default().with_idle_timeout(Duration::from_secs(300));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["idle_timeout"], 300);
        assert_eq!(value["handshake_timeout"], 30);
    }
}
