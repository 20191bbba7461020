use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::{BusError, Result};

/// Event bus settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusConfig {
    /// Applied to `send_with_reply` when neither the call nor the reply
    /// handler names a timeout. `None` waits forever.
    pub default_reply_timeout: Option<Duration>,
    /// Prefix of generated reply addresses.
    pub reply_prefix: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_reply_timeout: std::env::var("EVENTBUS_REPLY_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            reply_prefix: std::env::var("EVENTBUS_REPLY_PREFIX")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "__reply.".to_string()),
        }
    }
}

impl BusConfig {
    /// Load configuration from a TOML file (path via EVENTBUS_CONFIG or ./eventbus.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("EVENTBUS_CONFIG").unwrap_or_else(|_| "eventbus.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::debug!(target: "eventbus", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match Self::overlay_toml(default.clone(), &s) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(target: "eventbus", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "eventbus", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    /// Parse a TOML document on top of the env-driven defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Self::overlay_toml(Self::default(), s)
    }

    fn overlay_toml(base: Self, s: &str) -> Result<Self> {
        let parsed = toml::from_str::<BusToml>(s).map_err(|e| BusError::Config(e.to_string()))?;
        Ok(parsed.overlay(base))
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct BusToml {
    /// 0 disables the default timeout
    pub reply_timeout_ms: Option<u64>,
    pub reply_prefix: Option<String>,
}

impl BusToml {
    fn overlay(self, mut base: BusConfig) -> BusConfig {
        if let Some(ms) = self.reply_timeout_ms {
            base.default_reply_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(p) = self.reply_prefix.filter(|p| !p.is_empty()) {
            base.reply_prefix = p;
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overlays_defaults() {
        let cfg = BusConfig::from_toml_str("reply_timeout_ms = 2500\nreply_prefix = \"rr.\"").unwrap();
        assert_eq!(cfg.default_reply_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(cfg.reply_prefix, "rr.");
    }

    #[test]
    fn zero_timeout_disables_default() {
        let cfg = BusConfig::from_toml_str("reply_timeout_ms = 0").unwrap();
        assert_eq!(cfg.default_reply_timeout, None);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let err = BusConfig::from_toml_str("reply_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }
}
