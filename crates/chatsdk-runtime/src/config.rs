//! Environment-backed session runtime configuration.

use std::{env, time::Duration};

use chatsdk_core::{MachineSettings, ReconnectPolicy};
use thiserror::Error;

const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_BACKGROUND_GRACE_SECS: u64 = 300;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_DECODE_FAILURE_WARN_THRESHOLD: u32 = 5;
const DEFAULT_EVENT_BUFFER: usize = 256;

/// Tunables for one session runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Keep-alive period while connected.
    pub heartbeat_interval: Duration,
    /// How long a connected session may stay up after the app leaves foreground.
    pub background_grace: Duration,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    /// Warn after this many consecutive undecodable frames, and at each multiple.
    pub decode_failure_warn_threshold: u32,
    /// Capacity of the broadcast event stream.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            background_grace: Duration::from_secs(DEFAULT_BACKGROUND_GRACE_SECS),
            reconnect_base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            reconnect_max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            decode_failure_warn_threshold: DEFAULT_DECODE_FAILURE_WARN_THRESHOLD,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl SessionConfig {
    /// Parse configuration from `CHATSDK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let heartbeat_secs = parse_or(
            "CHATSDK_HEARTBEAT_INTERVAL_SECS",
            DEFAULT_HEARTBEAT_INTERVAL_SECS,
            &mut lookup,
        )?;
        let grace_secs = parse_or(
            "CHATSDK_BACKGROUND_GRACE_SECS",
            DEFAULT_BACKGROUND_GRACE_SECS,
            &mut lookup,
        )?;
        let reconnect_base_delay_ms = parse_or(
            "CHATSDK_RECONNECT_BASE_DELAY_MS",
            DEFAULT_RECONNECT_BASE_DELAY_MS,
            &mut lookup,
        )?;
        let reconnect_max_delay_ms = parse_or(
            "CHATSDK_RECONNECT_MAX_DELAY_MS",
            DEFAULT_RECONNECT_MAX_DELAY_MS,
            &mut lookup,
        )?;
        let decode_failure_warn_threshold = parse_or(
            "CHATSDK_DECODE_FAILURE_WARN_THRESHOLD",
            DEFAULT_DECODE_FAILURE_WARN_THRESHOLD,
            &mut lookup,
        )?;
        let event_buffer = parse_or("CHATSDK_EVENT_BUFFER", DEFAULT_EVENT_BUFFER, &mut lookup)?;

        require_positive("CHATSDK_HEARTBEAT_INTERVAL_SECS", heartbeat_secs)?;
        require_positive("CHATSDK_BACKGROUND_GRACE_SECS", grace_secs)?;
        require_positive("CHATSDK_EVENT_BUFFER", event_buffer as u64)?;
        require_positive(
            "CHATSDK_DECODE_FAILURE_WARN_THRESHOLD",
            u64::from(decode_failure_warn_threshold),
        )?;
        if reconnect_base_delay_ms > reconnect_max_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "CHATSDK_RECONNECT_BASE_DELAY_MS",
                value: reconnect_base_delay_ms.to_string(),
                reason: format!(
                    "must not exceed CHATSDK_RECONNECT_MAX_DELAY_MS ({reconnect_max_delay_ms})"
                ),
            });
        }

        Ok(Self {
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            background_grace: Duration::from_secs(grace_secs),
            reconnect_base_delay_ms,
            reconnect_max_delay_ms,
            decode_failure_warn_threshold,
            event_buffer,
        })
    }

    /// State machine settings derived from this configuration.
    pub fn machine_settings(&self) -> MachineSettings {
        MachineSettings {
            reconnect: ReconnectPolicy::new(
                self.reconnect_base_delay_ms,
                self.reconnect_max_delay_ms,
            ),
            decode_failure_warn_threshold: self.decode_failure_warn_threshold,
        }
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed or is out of range.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<T>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            reason: err.to_string(),
            value,
        })
}

fn require_positive(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SessionConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SessionConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config_from_pairs(&[]).expect("empty config should parse");
        assert_eq!(cfg, SessionConfig::default());
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.background_grace, Duration::from_secs(300));
    }

    #[test]
    fn parses_overrides() {
        let cfg = config_from_pairs(&[
            ("CHATSDK_HEARTBEAT_INTERVAL_SECS", "10"),
            ("CHATSDK_BACKGROUND_GRACE_SECS", " 60 "),
            ("CHATSDK_RECONNECT_BASE_DELAY_MS", "250"),
            ("CHATSDK_RECONNECT_MAX_DELAY_MS", "4000"),
            ("CHATSDK_EVENT_BUFFER", "32"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(cfg.background_grace, Duration::from_secs(60));
        assert_eq!(cfg.event_buffer, 32);
        let settings = cfg.machine_settings();
        assert_eq!(settings.reconnect.base_delay_ms(), 250);
        assert_eq!(settings.reconnect.max_delay_ms(), 4_000);
    }

    #[test]
    fn rejects_zero_heartbeat_interval() {
        let err = config_from_pairs(&[("CHATSDK_HEARTBEAT_INTERVAL_SECS", "0")])
            .expect_err("zero interval must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHATSDK_HEARTBEAT_INTERVAL_SECS",
                ..
            }
        ));
    }

    #[test]
    fn rejects_non_numeric_values() {
        let err = config_from_pairs(&[("CHATSDK_BACKGROUND_GRACE_SECS", "five minutes")])
            .expect_err("text must fail");
        assert!(err.to_string().contains("CHATSDK_BACKGROUND_GRACE_SECS"));
    }

    #[test]
    fn rejects_base_delay_above_max() {
        let err = config_from_pairs(&[
            ("CHATSDK_RECONNECT_BASE_DELAY_MS", "5000"),
            ("CHATSDK_RECONNECT_MAX_DELAY_MS", "1000"),
        ])
        .expect_err("inverted backoff bounds must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "CHATSDK_RECONNECT_BASE_DELAY_MS",
                ..
            }
        ));
    }
}
