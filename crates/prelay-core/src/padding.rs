//! Padding bundles.
//!
//! A bundle is the high-token shared prefix injected into every optimized
//! request so that all users of a channel share one upstream cache entry.
//! Bundles are validated once, at configuration load; requests never pay the
//! validation cost and never see an undersized bundle.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use sha2::{Digest, Sha256};

use crate::channel::ChannelConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::tokens::estimate_tokens;

/// Minimum bundle size; the provider refuses to cache shorter prefixes.
pub const MIN_PADDING_TOKENS: usize = 1024;

const DEFAULT_PADDING: &str = include_str!("../assets/default_padding.md");

/// An immutable, pre-validated padding text with its content digest.
///
/// The digest doubles as a cache-version identifier: when the text changes,
/// the digest changes, and warmed upstream entries are simply superseded.
#[derive(Debug, Clone)]
pub struct PaddingBundle {
    text: Arc<str>,
    token_count: usize,
    digest: String,
}

impl PaddingBundle {
    /// Builds a bundle from raw text, enforcing the token minimum.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` when the text is shorter than
    /// [`MIN_PADDING_TOKENS`].
    pub fn new(text: impl Into<String>) -> GatewayResult<Self> {
        let text: String = text.into();
        let token_count = estimate_tokens(&text);
        if token_count < MIN_PADDING_TOKENS {
            return Err(GatewayError::config(format!(
                "padding bundle is {token_count} tokens, below the {MIN_PADDING_TOKENS} minimum"
            )));
        }
        let digest = hex_digest(&text);
        Ok(Self {
            text: text.into(),
            token_count,
            digest,
        })
    }

    /// The built-in default bundle, validated once per process.
    pub fn default_bundle() -> &'static PaddingBundle {
        static DEFAULT: OnceLock<PaddingBundle> = OnceLock::new();
        DEFAULT.get_or_init(|| {
            PaddingBundle::new(DEFAULT_PADDING).expect("built-in padding bundle meets the minimum")
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// Full sha-256 content digest, hex-encoded.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Short digest prefix used as the cache-version identifier in logs and
    /// warmer state.
    pub fn version(&self) -> &str {
        &self.digest[..16]
    }
}

fn hex_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Per-channel resolved bundles, built once per channel startup.
///
/// Channels with a valid `padding_content` override get their own bundle;
/// everything else shares the default.
#[derive(Debug, Default)]
pub struct BundleCache {
    bundles: RwLock<HashMap<i64, Arc<PaddingBundle>>>,
}

impl BundleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves and stores the bundle for a channel.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` when the channel's override fails validation;
    /// the channel keeps no entry and optimization for it must not start.
    pub fn load_channel(&self, config: &ChannelConfig) -> GatewayResult<Arc<PaddingBundle>> {
        let bundle = match &config.padding_content {
            Some(text) if !text.trim().is_empty() => Arc::new(PaddingBundle::new(text.clone())?),
            _ => Arc::new(PaddingBundle::default_bundle().clone()),
        };
        self.bundles
            .write()
            .expect("bundle cache lock poisoned")
            .insert(config.channel_id, Arc::clone(&bundle));
        Ok(bundle)
    }

    /// The channel's resolved bundle, falling back to the default for
    /// channels never loaded (optimization then still behaves sanely).
    pub fn resolve(&self, channel_id: i64) -> Arc<PaddingBundle> {
        self.bundles
            .read()
            .expect("bundle cache lock poisoned")
            .get(&channel_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(PaddingBundle::default_bundle().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_channel;

    /// Builds text sized to an exact token count by trimming a slightly
    /// oversized word list one word at a time.
    pub(crate) fn text_with_tokens(target: usize) -> String {
        let mut words = vec!["fox"; target + 8];
        let mut text = words.join(" ");
        while estimate_tokens(&text) > target {
            words.pop();
            text = words.join(" ");
        }
        assert_eq!(estimate_tokens(&text), target, "could not hit target size");
        text
    }

    #[test]
    fn default_bundle_meets_minimum() {
        let bundle = PaddingBundle::default_bundle();
        assert!(bundle.token_count() >= MIN_PADDING_TOKENS);
        assert_eq!(bundle.version().len(), 16);
    }

    #[test]
    fn bundle_at_exactly_minimum_is_accepted() {
        let text = text_with_tokens(MIN_PADDING_TOKENS);
        let bundle = PaddingBundle::new(text).unwrap();
        assert_eq!(bundle.token_count(), MIN_PADDING_TOKENS);
    }

    #[test]
    fn bundle_one_token_short_is_rejected() {
        let text = text_with_tokens(MIN_PADDING_TOKENS - 1);
        let err = PaddingBundle::new(text).unwrap_err();
        assert_eq!(err.kind, crate::error::GatewayErrorKind::ConfigInvalid);
    }

    #[test]
    fn digest_tracks_content() {
        let a = PaddingBundle::new(text_with_tokens(1100)).unwrap();
        let b = PaddingBundle::new(text_with_tokens(1200)).unwrap();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn cache_resolves_override_and_default() {
        let cache = BundleCache::new();

        let mut with_override = test_channel(1);
        with_override.padding_content = Some(text_with_tokens(1050));
        let loaded = cache.load_channel(&with_override).unwrap();
        assert_eq!(loaded.token_count(), 1050);
        assert_eq!(cache.resolve(1).digest(), loaded.digest());

        // Unknown channel falls back to the default bundle.
        assert_eq!(
            cache.resolve(99).digest(),
            PaddingBundle::default_bundle().digest()
        );
    }

    #[test]
    fn undersized_override_is_rejected_at_load() {
        let cache = BundleCache::new();
        let mut config = test_channel(2);
        config.padding_content = Some("too small".to_string());
        assert!(cache.load_channel(&config).is_err());
    }
}
