//! Tunnel configuration.
//!
//! All knobs of a channel in one serde-deserializable struct, so the host
//! binary can load it from a JSON file. Every field has a default.
//!
//! # Example
//!
//! ```
//! use enclave_tunnel::TunnelConfig;
//!
//! let config: TunnelConfig =
//!     serde_json::from_str(r#"{ "max_frame_payload": 4096 }"#).unwrap();
//! assert_eq!(config.max_frame_payload, 4096);
//! config.validate().unwrap();
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, TunnelError};
use crate::protocol::DEFAULT_MAX_DECODE_PAYLOAD;

/// Default largest DATA payload a sender puts in one frame (16 KiB).
pub const DEFAULT_MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Default per-session outbound backlog that suspends writers (256 KiB).
pub const DEFAULT_HIGH_WATER: usize = 256 * 1024;

/// Default backlog a suspended writer waits for (64 KiB).
pub const DEFAULT_LOW_WATER: usize = 64 * 1024;

/// Default relay socket read size.
pub const DEFAULT_RELAY_READ_BUFFER: usize = 8192;

/// Default OPEN handshake timeout.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for the host's outbound TCP dial.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(8);

/// Default idle interval before a session is closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default keep-alive send interval.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Default silence after which the channel is declared dead.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(45);

/// Configuration shared by both ends of a channel.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    /// Largest DATA payload emitted in a single frame.
    pub max_frame_payload: usize,
    /// Largest payload the decoder accepts before declaring corruption.
    pub max_decode_payload: u32,
    /// Outbound backlog (bytes) at which a session's writer is suspended.
    pub high_water: usize,
    /// Backlog (bytes) at which a suspended writer resumes.
    pub low_water: usize,
    /// Relay read size for the outbound socket.
    pub relay_read_buffer: usize,
    #[serde(with = "millis")]
    pub open_timeout: Duration,
    /// Host dial timeout. Must stay below `open_timeout`.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    #[serde(with = "millis")]
    pub idle_timeout: Duration,
    #[serde(with = "millis")]
    pub keepalive_interval: Duration,
    #[serde(with = "millis")]
    pub keepalive_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: DEFAULT_MAX_FRAME_PAYLOAD,
            max_decode_payload: DEFAULT_MAX_DECODE_PAYLOAD,
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
            relay_read_buffer: DEFAULT_RELAY_READ_BUFFER,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
        }
    }
}

impl TunnelConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: TunnelConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants between fields.
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_payload == 0 {
            return Err(TunnelError::Config("max_frame_payload must be > 0".into()));
        }
        if self.max_frame_payload as u64 > self.max_decode_payload as u64 {
            return Err(TunnelError::Config(format!(
                "max_frame_payload {} exceeds max_decode_payload {}",
                self.max_frame_payload, self.max_decode_payload
            )));
        }
        if self.low_water >= self.high_water {
            return Err(TunnelError::Config(format!(
                "low_water {} must be below high_water {}",
                self.low_water, self.high_water
            )));
        }
        if self.relay_read_buffer == 0 {
            return Err(TunnelError::Config("relay_read_buffer must be > 0".into()));
        }
        if self.keepalive_timeout <= self.keepalive_interval {
            return Err(TunnelError::Config(format!(
                "keepalive_timeout {:?} must exceed keepalive_interval {:?}",
                self.keepalive_timeout, self.keepalive_interval
            )));
        }
        if self.connect_timeout >= self.open_timeout {
            return Err(TunnelError::Config(format!(
                "connect_timeout {:?} must be below open_timeout {:?}",
                self.connect_timeout, self.open_timeout
            )));
        }
        for (name, value) in [
            ("open_timeout", self.open_timeout),
            ("connect_timeout", self.connect_timeout),
            ("idle_timeout", self.idle_timeout),
            ("keepalive_interval", self.keepalive_interval),
        ] {
            if value.is_zero() {
                return Err(TunnelError::Config(format!("{} must be > 0", name)));
            }
        }
        Ok(())
    }
}

/// Durations are written as integer milliseconds in config files.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TunnelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.relay_read_buffer, 8192);
        assert!(config.max_frame_payload as u32 <= config.max_decode_payload);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TunnelConfig =
            serde_json::from_str(r#"{ "open_timeout": 2500, "connect_timeout": 2000, "high_water": 1024, "low_water": 10 }"#)
                .unwrap();
        assert_eq!(config.open_timeout, Duration::from_millis(2500));
        assert_eq!(config.high_water, 1024);
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: std::result::Result<TunnelConfig, _> =
            serde_json::from_str(r#"{ "max_frame_size": 10 }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_watermarks_validated() {
        let config = TunnelConfig {
            high_water: 100,
            low_water: 100,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("low_water"));
    }

    #[test]
    fn test_frame_payload_bounded_by_decoder() {
        let config = TunnelConfig {
            max_frame_payload: 2 * 1024 * 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_keepalive_ordering_validated() {
        let config = TunnelConfig {
            keepalive_interval: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connect_timeout_below_open_timeout() {
        let config = TunnelConfig {
            open_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("connect_timeout"), "{}", err);

        let config = TunnelConfig {
            open_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(4),
            ..Default::default()
        };
        config.validate().unwrap();
    }
}
