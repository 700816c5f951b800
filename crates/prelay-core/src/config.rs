//! Gateway-level configuration from the environment.
//!
//! Per-channel policy comes from the host's channel store (see
//! [`crate::channel`]); this module covers the process-wide knobs. Nothing
//! is baked in: every value has an environment override and a documented
//! default.

use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};
use crate::stream::RelayOptions;
use crate::warmer::WarmerConfig;

/// Default provider endpoint.
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.anthropic.com";

const ENV_BASE_URL: &str = "PRELAY_UPSTREAM_BASE_URL";
const ENV_STREAMING_TIMEOUT: &str = "PRELAY_STREAMING_TIMEOUT_SECS";
const ENV_PING_INTERVAL: &str = "PRELAY_PING_INTERVAL_SECS";
const ENV_CHECK_INTERVAL: &str = "PRELAY_WARMER_CHECK_INTERVAL_SECS";
const ENV_WARMUP_THRESHOLD: &str = "PRELAY_WARMUP_THRESHOLD";

/// Process-wide gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub upstream_base_url: String,
    pub relay: RelayOptions,
    pub warmer: WarmerConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream_base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            relay: RelayOptions::default(),
            warmer: WarmerConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Loads settings from process environment variables.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` for malformed URLs or non-numeric durations.
    pub fn from_env() -> GatewayResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same resolution, with the environment abstracted for tests.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` for malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> GatewayResult<Self> {
        let mut config = Self::default();

        if let Some(base_url) = non_empty(lookup(ENV_BASE_URL)) {
            url::Url::parse(&base_url).map_err(|err| {
                GatewayError::config(format!("invalid {ENV_BASE_URL} {base_url:?}: {err}"))
            })?;
            config.upstream_base_url = base_url;
        }
        if let Some(secs) = parse_secs(&lookup, ENV_STREAMING_TIMEOUT)? {
            config.relay.streaming_timeout = secs;
        }
        if let Some(secs) = parse_secs(&lookup, ENV_PING_INTERVAL)? {
            config.relay.ping_interval = secs;
        }
        if let Some(secs) = parse_secs(&lookup, ENV_CHECK_INTERVAL)? {
            config.warmer.check_interval = secs;
        }
        if let Some(raw) = non_empty(lookup(ENV_WARMUP_THRESHOLD)) {
            config.warmer.default_threshold = raw.parse().map_err(|_| {
                GatewayError::config(format!("invalid {ENV_WARMUP_THRESHOLD} {raw:?}"))
            })?;
        }

        Ok(config)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_secs(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
) -> GatewayResult<Option<Duration>> {
    let Some(raw) = non_empty(lookup(key)) else {
        return Ok(None);
    };
    let secs: u64 = raw
        .parse()
        .map_err(|_| GatewayError::config(format!("invalid {key} {raw:?}")))?;
    Ok(Some(Duration::from_secs(secs)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_environment() {
        let config = GatewayConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.upstream_base_url, DEFAULT_UPSTREAM_BASE_URL);
        assert_eq!(config.relay.streaming_timeout, Duration::from_secs(60));
        assert_eq!(config.relay.ping_interval, Duration::from_secs(10));
        assert_eq!(config.warmer.check_interval, Duration::from_secs(60));
        assert_eq!(config.warmer.default_threshold, 10);
    }

    #[test]
    fn environment_overrides_apply() {
        let config = GatewayConfig::from_lookup(|key| match key {
            "PRELAY_UPSTREAM_BASE_URL" => Some("http://localhost:8045".to_string()),
            "PRELAY_STREAMING_TIMEOUT_SECS" => Some("25".to_string()),
            "PRELAY_WARMUP_THRESHOLD" => Some("3".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.upstream_base_url, "http://localhost:8045");
        assert_eq!(config.relay.streaming_timeout, Duration::from_secs(25));
        assert_eq!(config.warmer.default_threshold, 3);
    }

    #[test]
    fn malformed_values_are_config_errors() {
        let err = GatewayConfig::from_lookup(|key| {
            (key == "PRELAY_STREAMING_TIMEOUT_SECS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert_eq!(err.kind, crate::error::GatewayErrorKind::ConfigInvalid);

        let err = GatewayConfig::from_lookup(|key| {
            (key == "PRELAY_UPSTREAM_BASE_URL").then(|| "not a url".to_string())
        })
        .unwrap_err();
        assert_eq!(err.kind, crate::error::GatewayErrorKind::ConfigInvalid);
    }
}
