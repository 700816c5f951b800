//! Per-channel configuration and the narrow channel-store capability.
//!
//! A channel is one upstream provider account. Config rows come from an
//! external store; this module owns validation and the effective-flag rules.

use std::collections::BTreeMap;

use prelay_wire::CacheTtl as WireTtl;
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Upstream cache tier for a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTtl {
    /// Provider default (~5 minutes). Expressed on the wire by omitting `ttl`.
    #[default]
    Short,
    /// Extended tier (~1 hour).
    Long,
}

impl CacheTtl {
    /// The `ttl` value to place on `cache_control` markers, if any.
    pub fn wire_ttl(self) -> Option<WireTtl> {
        match self {
            CacheTtl::Short => None,
            CacheTtl::Long => Some(WireTtl::OneHour),
        }
    }

    /// Upstream lifetime of a cache entry at this tier.
    pub fn lifetime(self) -> std::time::Duration {
        match self {
            CacheTtl::Short => std::time::Duration::from_secs(5 * 60),
            CacheTtl::Long => std::time::Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    Disabled,
}

pub const DEFAULT_WARMUP_THRESHOLD: u32 = 10;
pub const MAX_WARMUP_THRESHOLD: u32 = 100;
pub const MAX_CACHE_HISTORY_MESSAGES: u8 = 10;

fn default_warmup_threshold() -> u32 {
    DEFAULT_WARMUP_THRESHOLD
}

/// One upstream provider account with its cache policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: i64,
    pub name: String,
    pub api_key: String,
    pub base_url: String,
    #[serde(default)]
    pub status: ChannelStatus,
    /// Master switch; when false every other cache flag is ignored.
    #[serde(default)]
    pub pool_cache_enabled: bool,
    /// Overrides the built-in padding bundle.
    #[serde(default)]
    pub padding_content: Option<String>,
    #[serde(default)]
    pub smart_warmup_enabled: bool,
    /// Requests per 5-minute window above which warmup arms.
    #[serde(default = "default_warmup_threshold")]
    pub warmup_threshold: u32,
    #[serde(default)]
    pub cache_ttl: CacheTtl,
    #[serde(default)]
    pub category_cache_enabled: bool,
    /// Category name → prompt. BTreeMap gives iteration a stable order, so
    /// "first entry" selection is deterministic.
    #[serde(default)]
    pub category_prompts: BTreeMap<String, String>,
    /// Number of trailing turns to also mark for caching (0 disables).
    #[serde(default)]
    pub cache_history_messages: u8,
}

impl ChannelConfig {
    /// Validates ranges. Bundle token minimums are checked separately when
    /// the padding override is resolved into a bundle.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` for out-of-range values.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.warmup_threshold > MAX_WARMUP_THRESHOLD {
            return Err(GatewayError::config(format!(
                "channel {}: warmup_threshold {} out of range 0..={MAX_WARMUP_THRESHOLD}",
                self.channel_id, self.warmup_threshold
            )));
        }
        if self.cache_history_messages > MAX_CACHE_HISTORY_MESSAGES {
            return Err(GatewayError::config(format!(
                "channel {}: cache_history_messages {} out of range 0..={MAX_CACHE_HISTORY_MESSAGES}",
                self.channel_id, self.cache_history_messages
            )));
        }
        Ok(())
    }

    /// Whether the category block applies: the flag alone is not enough, an
    /// empty prompt map auto-disables the feature.
    pub fn category_active(&self) -> bool {
        self.category_cache_enabled && !self.category_prompts.is_empty()
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }
}

/// Selection policy when more than one category prompt is configured.
///
/// The intended routing semantics are undecided upstream of this core, so
/// selection is pluggable. The default takes the first entry in iteration
/// order (lexicographic over the `BTreeMap`).
pub trait CategorySelector: Send + Sync {
    fn select<'a>(&self, prompts: &'a BTreeMap<String, String>) -> Option<&'a str>;
}

/// Default selector: first key in iteration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstCategory;

impl CategorySelector for FirstCategory {
    fn select<'a>(&self, prompts: &'a BTreeMap<String, String>) -> Option<&'a str> {
        prompts.values().next().map(String::as_str)
    }
}

/// Narrow capability the warmer consumes to reach a channel's credentials.
/// The core never touches channel internals beyond this.
pub trait ChannelDirectory: Send + Sync {
    fn api_key(&self, channel_id: i64) -> Option<String>;
    fn base_url(&self, channel_id: i64) -> Option<String>;
}

/// Directory over a static channel list; handy for tests and single-process
/// deployments where the host keeps channels in memory.
#[derive(Debug, Default)]
pub struct StaticChannelDirectory {
    channels: std::collections::HashMap<i64, (String, String)>,
}

impl StaticChannelDirectory {
    pub fn new(channels: impl IntoIterator<Item = ChannelConfig>) -> Self {
        Self {
            channels: channels
                .into_iter()
                .map(|c| (c.channel_id, (c.api_key, c.base_url)))
                .collect(),
        }
    }
}

impl ChannelDirectory for StaticChannelDirectory {
    fn api_key(&self, channel_id: i64) -> Option<String> {
        self.channels.get(&channel_id).map(|(key, _)| key.clone())
    }

    fn base_url(&self, channel_id: i64) -> Option<String> {
        self.channels.get(&channel_id).map(|(_, url)| url.clone())
    }
}

#[cfg(test)]
pub(crate) fn test_channel(channel_id: i64) -> ChannelConfig {
    ChannelConfig {
        channel_id,
        name: format!("channel-{channel_id}"),
        api_key: "sk-test".to_string(),
        base_url: "http://127.0.0.1:1".to_string(),
        status: ChannelStatus::Enabled,
        pool_cache_enabled: true,
        padding_content: None,
        smart_warmup_enabled: true,
        warmup_threshold: DEFAULT_WARMUP_THRESHOLD,
        cache_ttl: CacheTtl::Short,
        category_cache_enabled: false,
        category_prompts: BTreeMap::new(),
        cache_history_messages: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_range_is_enforced() {
        let mut config = test_channel(1);
        config.warmup_threshold = 100;
        assert!(config.validate().is_ok());

        config.warmup_threshold = 101;
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind, crate::error::GatewayErrorKind::ConfigInvalid);
    }

    #[test]
    fn history_range_is_enforced() {
        let mut config = test_channel(1);
        config.cache_history_messages = 10;
        assert!(config.validate().is_ok());

        config.cache_history_messages = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_category_prompts_disable_the_feature() {
        let mut config = test_channel(1);
        config.category_cache_enabled = true;
        assert!(!config.category_active());

        config
            .category_prompts
            .insert("coding".to_string(), "You write code.".to_string());
        assert!(config.category_active());
    }

    #[test]
    fn first_category_is_deterministic() {
        let mut prompts = BTreeMap::new();
        prompts.insert("writing".to_string(), "w".to_string());
        prompts.insert("coding".to_string(), "c".to_string());

        // BTreeMap iterates lexicographically: "coding" precedes "writing".
        assert_eq!(FirstCategory.select(&prompts), Some("c"));
    }

    #[test]
    fn short_ttl_has_no_wire_field() {
        assert!(CacheTtl::Short.wire_ttl().is_none());
        assert_eq!(CacheTtl::Long.wire_ttl(), Some(WireTtl::OneHour));
    }
}
