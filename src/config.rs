//! Configuration types
//!
//! Every section has sensible defaults, a `validate` pass and a `from_env`
//! constructor reading `RTC_CALL_*` variables.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::media::MediaConstraints;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8000/signal";
pub const DEFAULT_RELAY_BIND: &str = "0.0.0.0:8000";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_MS: u64 = 3000;
pub const DEFAULT_ANSWER_TIMEOUT_MS: u64 = 30_000;

pub const ENV_RELAY_URL: &str = "RTC_CALL_RELAY_URL";
pub const ENV_IDENTITY_MODE: &str = "RTC_CALL_IDENTITY_MODE";
pub const ENV_MAX_RECONNECTS: &str = "RTC_CALL_MAX_RECONNECTS";
pub const ENV_BACKOFF_MS: &str = "RTC_CALL_BACKOFF_MS";
pub const ENV_ANSWER_TIMEOUT_MS: &str = "RTC_CALL_ANSWER_TIMEOUT_MS";
pub const ENV_RELAY_BIND: &str = "RTC_CALL_RELAY_BIND";

/// How the client announces its identity to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityMode {
    /// `?clientId=<id>` on the connect URL
    #[serde(rename = "query")]
    QueryParam,
    /// A first text frame `clientId:<id>`
    Announce,
}

impl std::str::FromStr for IdentityMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(IdentityMode::QueryParam),
            "announce" => Ok(IdentityMode::Announce),
            other => Err(ConfigError::Invalid {
                key: ENV_IDENTITY_MODE,
                reason: format!("expected 'query' or 'announce', got '{}'", other),
            }),
        }
    }
}

/// Relay connection and reconnect policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// WebSocket relay URL (ws:// or wss://)
    pub relay_url: String,

    /// Identity announcement (default: query parameter)
    pub identity_mode: IdentityMode,

    /// Reconnect attempts after a failure (default: 5)
    pub max_attempts: u32,

    /// Fixed delay between reconnect attempts in milliseconds (default: 3000)
    pub backoff_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            identity_mode: IdentityMode::QueryParam,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

impl TransportConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.relay_url.starts_with("ws://") && !self.relay_url.starts_with("wss://") {
            return Err(ConfigError::Invalid {
                key: ENV_RELAY_URL,
                reason: format!("must start with ws:// or wss://, got {}", self.relay_url),
            });
        }
        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_RELAY_URL) {
            config.relay_url = url;
        }
        if let Some(mode) = lookup(ENV_IDENTITY_MODE) {
            config.identity_mode = mode.parse()?;
        }
        if let Some(n) = lookup(ENV_MAX_RECONNECTS) {
            config.max_attempts = parse_number(ENV_MAX_RECONNECTS, &n)?;
        }
        if let Some(ms) = lookup(ENV_BACKOFF_MS) {
            config.backoff_ms = parse_number(ENV_BACKOFF_MS, &ms)?;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Offer/answer negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationConfig {
    /// How long a caller waits for an answer, in milliseconds (default: 30000)
    pub answer_timeout_ms: u64,

    /// What to capture when placing a call (default: video only)
    pub constraints: MediaConstraints,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            answer_timeout_ms: DEFAULT_ANSWER_TIMEOUT_MS,
            constraints: MediaConstraints::default(),
        }
    }
}

impl NegotiationConfig {
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.answer_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_ANSWER_TIMEOUT_MS,
                reason: "must be greater than zero".to_string(),
            });
        }
        if !self.constraints.video && !self.constraints.audio {
            return Err(ConfigError::Invalid {
                key: "constraints",
                reason: "at least one of audio or video is required".to_string(),
            });
        }
        Ok(())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = lookup(ENV_ANSWER_TIMEOUT_MS) {
            config.answer_timeout_ms = parse_number(ENV_ANSWER_TIMEOUT_MS, &ms)?;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Everything a call context needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallConfig {
    pub transport: TransportConfig,
    pub negotiation: NegotiationConfig,
}

impl CallConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()?;
        self.negotiation.validate()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            transport: TransportConfig::from_lookup(&lookup)?,
            negotiation: NegotiationConfig::from_lookup(&lookup)?,
        })
    }
}

/// Relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listen address (default: 0.0.0.0:8000)
    pub bind: SocketAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind = lookup(ENV_RELAY_BIND).unwrap_or_else(|| DEFAULT_RELAY_BIND.to_string());
        let bind = bind.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
            key: ENV_RELAY_BIND,
            reason: format!("{}", e),
        })?;
        Ok(Self { bind })
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: format!("'{}': {}", value, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_reference_client() {
        let config = CallConfig::default();
        assert_eq!(config.transport.max_attempts, 5);
        assert_eq!(config.transport.backoff(), Duration::from_millis(3000));
        assert_eq!(config.transport.identity_mode, IdentityMode::QueryParam);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = CallConfig::from_lookup(lookup(&[
            (ENV_RELAY_URL, "wss://relay.example/signal"),
            (ENV_IDENTITY_MODE, "announce"),
            (ENV_MAX_RECONNECTS, "2"),
            (ENV_BACKOFF_MS, "250"),
            (ENV_ANSWER_TIMEOUT_MS, "1000"),
        ]))
        .unwrap();

        assert_eq!(config.transport.relay_url, "wss://relay.example/signal");
        assert_eq!(config.transport.identity_mode, IdentityMode::Announce);
        assert_eq!(config.transport.max_attempts, 2);
        assert_eq!(config.transport.backoff_ms, 250);
        assert_eq!(config.negotiation.answer_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(TransportConfig::from_lookup(lookup(&[(ENV_RELAY_URL, "http://x")])).is_err());
        assert!(TransportConfig::from_lookup(lookup(&[(ENV_MAX_RECONNECTS, "many")])).is_err());
        assert!(TransportConfig::from_lookup(lookup(&[(ENV_IDENTITY_MODE, "cookie")])).is_err());
        assert!(NegotiationConfig::from_lookup(lookup(&[(ENV_ANSWER_TIMEOUT_MS, "0")])).is_err());
        assert!(RelayConfig::from_lookup(lookup(&[(ENV_RELAY_BIND, "nowhere")])).is_err());
    }

    #[test]
    fn relay_bind_defaults() {
        let config = RelayConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bind.port(), 8000);
    }
}
