//! Synchronizer configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::SyncError, graph::Direction, timer::Millis};

/// Tunables for one synchronizer and its transport.
///
/// Every field has a default, so a partial TOML file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL for the event stream, e.g. `ws://localhost:8000`.
    pub ws_base_url: String,
    /// Base URL for REST commands, e.g. `http://localhost:8000/api`.
    pub api_base_url: String,
    pub reconnect_delay_ms: Millis,
    pub keepalive_interval_ms: Millis,
    pub layout_debounce_ms: Millis,
    pub flush_interval_ms: Millis,
    /// Visible output kept per agent, in characters.
    pub output_limit_chars: usize,
    pub edge_pulse_ms: Millis,
    pub history_limit: usize,
    pub highlight_max_rounds: usize,
    pub direction: Direction,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://localhost:8000".to_string(),
            api_base_url: "http://localhost:8000/api".to_string(),
            reconnect_delay_ms: 2_000,
            keepalive_interval_ms: 30_000,
            layout_debounce_ms: 150,
            flush_interval_ms: 33,
            output_limit_chars: 8_000,
            edge_pulse_ms: 1_500,
            history_limit: 50,
            highlight_max_rounds: 100,
            direction: Direction::TopBottom,
        }
    }
}

impl SyncConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    /// Returns error if the document is malformed or a limit is zero.
    pub fn from_toml_str(s: &str) -> Result<Self, SyncError> {
        let config: Self = toml::from_str(s).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or fails validation.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Reject zero limits.
    ///
    /// # Errors
    /// Returns error naming the first invalid field.
    pub fn validate(&self) -> Result<(), SyncError> {
        let checks = [
            ("flush_interval_ms", self.flush_interval_ms == 0),
            ("output_limit_chars", self.output_limit_chars == 0),
            ("history_limit", self.history_limit == 0),
            ("highlight_max_rounds", self.highlight_max_rounds == 0),
        ];
        match checks.iter().find(|(_, bad)| *bad) {
            Some((field, _)) => Err(SyncError::Config(format!("{field} must be greater than zero"))),
            None => Ok(()),
        }
    }

    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            ws_base_url = "ws://swarm:9000"
            direction = "LR"
            "#,
        )
        .unwrap();
        assert_eq!(config.ws_base_url, "ws://swarm:9000");
        assert_eq!(config.direction, Direction::LeftRight);
        assert_eq!(config.layout_debounce_ms, 150);
        assert_eq!(config.history_limit, 50);
    }

    #[test]
    fn test_zero_limit_rejected() {
        let err = SyncConfig::from_toml_str("history_limit = 0").unwrap_err();
        assert!(err.to_string().contains("history_limit"));
    }
}
