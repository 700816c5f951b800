//! Eligibility gate: which requests get the padding treatment.

use std::collections::HashSet;
use std::sync::OnceLock;

use crate::channel::ChannelConfig;

/// Outcome of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    Optimize,
    Skip,
}

const WARMUP_MODEL: &str = "claude-3-5-haiku-20241022";

/// Model dispatched by the warmer: the cheapest cache-capable model.
///
/// Pinned rather than rotated; see DESIGN.md for the trade-off.
pub fn warmup_model() -> &'static str {
    WARMUP_MODEL
}

/// Known cache-capable model ids, matched before any family heuristics.
fn known_models() -> &'static HashSet<&'static str> {
    static MODELS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    MODELS.get_or_init(|| {
        [
            "claude-3-opus-20240229",
            "claude-3-sonnet-20240229",
            "claude-3-haiku-20240307",
            "claude-3-5-sonnet-20240620",
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
            "claude-3-7-sonnet-20250219",
            "claude-sonnet-4-20250514",
            "claude-opus-4-20250514",
            "claude-opus-4-1-20250805",
            "claude-sonnet-4-5",
            "claude-opus-4-5",
            "claude-haiku-4-5",
        ]
        .into_iter()
        .collect()
    })
}

/// Families that carry prompt-cache support.
const CACHE_FAMILIES: &[&str] = &[
    "claude-3-5-",
    "claude-3-7-",
    "claude-3-",
    "claude-sonnet-4",
    "claude-opus-4",
    "claude-haiku-4",
    "claude-4",
];

/// Generations that never had the feature.
const EXCLUDED_FAMILIES: &[&str] = &["claude-2", "claude-1", "claude-instant"];

/// Whether `model` supports the provider's prompt cache.
///
/// Exact table lookup first, then excluded generations, then family
/// prefixes. Unknown `claude-*` ids default to capable: new generations ship
/// with the feature and the gate should not lag behind provider releases.
pub fn model_supports_cache(model: &str) -> bool {
    let model = model.trim();
    if known_models().contains(model) {
        return true;
    }
    if EXCLUDED_FAMILIES.iter().any(|f| model.starts_with(f)) {
        return false;
    }
    if CACHE_FAMILIES.iter().any(|f| model.starts_with(f)) {
        return true;
    }
    model.starts_with("claude-")
}

/// Pure gate: skip when the channel master switch is off or the model cannot
/// cache, optimize otherwise.
pub fn decide(model: &str, channel: &ChannelConfig) -> CacheDecision {
    if !channel.pool_cache_enabled {
        return CacheDecision::Skip;
    }
    if !model_supports_cache(model) {
        return CacheDecision::Skip;
    }
    CacheDecision::Optimize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_channel;

    #[test]
    fn published_set_is_capable() {
        for model in [
            "claude-3-opus-20240229",
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
            "claude-3-7-sonnet-20250219",
            "claude-sonnet-4-20250514",
            "claude-opus-4-1-20250805",
        ] {
            assert!(model_supports_cache(model), "{model} should be capable");
        }
    }

    #[test]
    fn excluded_generations_are_skipped() {
        for model in [
            "claude-2.1",
            "claude-2.0",
            "claude-1.3",
            "claude-instant-1.2",
        ] {
            assert!(!model_supports_cache(model), "{model} should be excluded");
        }
    }

    #[test]
    fn unknown_claude_defaults_to_capable() {
        assert!(model_supports_cache("claude-sonnet-5-20270101"));
        assert!(model_supports_cache("claude-next"));
    }

    #[test]
    fn non_claude_models_are_skipped() {
        assert!(!model_supports_cache("gpt-4o"));
        assert!(!model_supports_cache("gemini-2.5-pro"));
    }

    #[test]
    fn master_switch_wins() {
        let mut channel = test_channel(1);
        channel.pool_cache_enabled = false;
        assert_eq!(
            decide("claude-3-5-sonnet-20241022", &channel),
            CacheDecision::Skip
        );

        channel.pool_cache_enabled = true;
        assert_eq!(
            decide("claude-3-5-sonnet-20241022", &channel),
            CacheDecision::Optimize
        );
        assert_eq!(decide("claude-2.1", &channel), CacheDecision::Skip);
    }

    #[test]
    fn warmup_model_is_cache_capable() {
        assert!(model_supports_cache(warmup_model()));
    }
}
