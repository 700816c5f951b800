//! Request interceptor.
//!
//! Sits between authentication and upstream dispatch. Parses Messages
//! bodies, consults the eligibility gate, rewrites eligible bodies through
//! the injector, and feeds the traffic tracker. Optimization is a
//! best-effort cost reducer: every failure here degrades to forwarding the
//! original body, never to breaking user traffic.

use std::sync::Arc;

use bytes::Bytes;
use prelay_wire::MessageRequest;
use tracing::error;

use crate::channel::{CategorySelector, ChannelConfig, FirstCategory};
use crate::eligibility::{CacheDecision, decide};
use crate::inject::inject;
use crate::padding::BundleCache;
use crate::tokens::estimate_tokens;

/// Path prefix of the provider's messages endpoint; everything else passes
/// through untouched.
pub const MESSAGES_PATH_PREFIX: &str = "/v1/messages";

/// Sink for traffic observations; the warmer scheduler implements this.
pub trait TrafficObserver: Send + Sync {
    fn record(&self, channel: &ChannelConfig);
}

/// Mutable request state threaded through the proxy pipeline.
///
/// The body is `Bytes`, so downstream stages re-read it freely.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub path: String,
    pub body: Bytes,
    pub channel: ChannelConfig,
    pub user_id: i64,
    pub token_id: i64,
    pub log_id: String,
    /// Model name parsed from the body, when parsing succeeded.
    pub model: Option<String>,
    /// Rough prompt size of the (possibly rewritten) body; the stream relay
    /// falls back to this when the upstream reports no usage.
    pub fallback_prompt_tokens: Option<u64>,
    /// Whether the padding injection was applied to this body.
    pub optimized: bool,
}

impl RequestContext {
    pub fn new(path: impl Into<String>, body: Bytes, channel: ChannelConfig) -> Self {
        Self {
            path: path.into(),
            body,
            channel,
            user_id: 0,
            token_id: 0,
            log_id: String::new(),
            model: None,
            fallback_prompt_tokens: None,
            optimized: false,
        }
    }
}

/// The in-pipeline interceptor.
pub struct Interceptor {
    bundles: Arc<BundleCache>,
    selector: Arc<dyn CategorySelector>,
    observer: Option<Arc<dyn TrafficObserver>>,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor").finish_non_exhaustive()
    }
}

impl Interceptor {
    pub fn new(bundles: Arc<BundleCache>, observer: Option<Arc<dyn TrafficObserver>>) -> Self {
        Self {
            bundles,
            selector: Arc::new(FirstCategory),
            observer,
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn CategorySelector>) -> Self {
        self.selector = selector;
        self
    }

    /// Inspects and possibly rewrites the request body in place.
    ///
    /// Infallible by contract: parse and injection failures are logged and
    /// the original body is forwarded unmodified.
    pub fn intercept(&self, ctx: &mut RequestContext) {
        if !ctx.path.starts_with(MESSAGES_PATH_PREFIX) {
            return;
        }

        let mut request = match MessageRequest::from_slice(&ctx.body) {
            Ok(request) => request,
            Err(err) => {
                error!(
                    channel_id = ctx.channel.channel_id,
                    error = %err,
                    "messages body parse failed; forwarding unmodified"
                );
                return;
            }
        };
        ctx.model = Some(request.model.clone());

        if decide(&request.model, &ctx.channel) == CacheDecision::Optimize {
            let bundle = self.bundles.resolve(ctx.channel.channel_id);
            match inject(&mut request, &ctx.channel, &bundle, self.selector.as_ref()) {
                Ok(()) => match request.to_vec() {
                    Ok(body) => {
                        ctx.body = Bytes::from(body);
                        ctx.optimized = true;
                    }
                    Err(err) => {
                        error!(
                            channel_id = ctx.channel.channel_id,
                            error = %err,
                            "rewritten body failed to serialize; forwarding original"
                        );
                    }
                },
                Err(err) => {
                    error!(
                        channel_id = ctx.channel.channel_id,
                        error = %err,
                        "padding injection failed; forwarding original"
                    );
                }
            }
        }

        ctx.fallback_prompt_tokens = Some(estimate_tokens(&request.visible_text()) as u64);

        if ctx.channel.smart_warmup_enabled
            && let Some(observer) = &self.observer
        {
            observer.record(&ctx.channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::{Value, json};

    use super::*;
    use crate::channel::test_channel;
    use crate::padding::PaddingBundle;

    #[derive(Default)]
    struct RecordingObserver {
        seen: Mutex<Vec<i64>>,
    }

    impl TrafficObserver for RecordingObserver {
        fn record(&self, channel: &ChannelConfig) {
            self.seen.lock().unwrap().push(channel.channel_id);
        }
    }

    fn interceptor(observer: Option<Arc<dyn TrafficObserver>>) -> Interceptor {
        Interceptor::new(Arc::new(BundleCache::new()), observer)
    }

    fn body(value: &Value) -> Bytes {
        Bytes::from(value.to_string())
    }

    fn messages_body() -> Value {
        json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 256,
            "messages": [{"role": "user", "content": "hi"}],
            "system": "you are helpful"
        })
    }

    #[test]
    fn rewrites_eligible_bodies() {
        let interceptor = interceptor(None);
        let mut ctx = RequestContext::new("/v1/messages", body(&messages_body()), test_channel(1));

        interceptor.intercept(&mut ctx);

        assert!(ctx.optimized);
        let rewritten: Value = serde_json::from_slice(&ctx.body).unwrap();
        assert_eq!(
            rewritten["system"][0]["text"],
            PaddingBundle::default_bundle().text()
        );
        assert_eq!(rewritten["system"][0]["cache_control"]["type"], "ephemeral");
        assert!(ctx.fallback_prompt_tokens.unwrap() > 1000);
    }

    #[test]
    fn non_messages_paths_pass_through() {
        let interceptor = interceptor(None);
        let original = body(&messages_body());
        let mut ctx = RequestContext::new("/v1/complete", original.clone(), test_channel(1));

        interceptor.intercept(&mut ctx);

        assert!(!ctx.optimized);
        assert_eq!(ctx.body, original);
    }

    #[test]
    fn disabled_pool_forwards_byte_identical_body() {
        let interceptor = interceptor(None);
        let mut channel = test_channel(1);
        channel.pool_cache_enabled = false;
        let original = body(&messages_body());
        let mut ctx = RequestContext::new("/v1/messages", original.clone(), channel);

        interceptor.intercept(&mut ctx);

        assert!(!ctx.optimized);
        assert_eq!(ctx.body, original);
    }

    #[test]
    fn ineligible_model_is_left_alone() {
        let interceptor = interceptor(None);
        let mut value = messages_body();
        value["model"] = json!("claude-2.1");
        let original = body(&value);
        let mut ctx = RequestContext::new("/v1/messages", original.clone(), test_channel(1));

        interceptor.intercept(&mut ctx);

        assert!(!ctx.optimized);
        assert_eq!(ctx.body, original);
    }

    #[test]
    fn unparseable_body_is_forwarded() {
        let interceptor = interceptor(None);
        let original = Bytes::from_static(b"{not json");
        let mut ctx = RequestContext::new("/v1/messages", original.clone(), test_channel(1));

        interceptor.intercept(&mut ctx);

        assert!(!ctx.optimized);
        assert_eq!(ctx.body, original);
        assert!(ctx.model.is_none());
    }

    #[test]
    fn observer_sees_skipped_and_optimized_traffic() {
        let observer = Arc::new(RecordingObserver::default());
        let interceptor = interceptor(Some(Arc::clone(&observer) as Arc<dyn TrafficObserver>));

        // Optimized request.
        let mut ctx = RequestContext::new("/v1/messages", body(&messages_body()), test_channel(7));
        interceptor.intercept(&mut ctx);

        // Skipped (ineligible model), warmup still enabled.
        let mut value = messages_body();
        value["model"] = json!("claude-2.1");
        let mut ctx = RequestContext::new("/v1/messages", body(&value), test_channel(7));
        interceptor.intercept(&mut ctx);

        // Warmup disabled: not observed.
        let mut channel = test_channel(8);
        channel.smart_warmup_enabled = false;
        let mut ctx = RequestContext::new("/v1/messages", body(&messages_body()), channel);
        interceptor.intercept(&mut ctx);

        assert_eq!(*observer.seen.lock().unwrap(), vec![7, 7]);
    }

    #[test]
    fn repeated_interception_does_not_stack_padding() {
        let interceptor = interceptor(None);
        let mut ctx = RequestContext::new("/v1/messages", body(&messages_body()), test_channel(1));

        interceptor.intercept(&mut ctx);
        let once = ctx.body.clone();
        interceptor.intercept(&mut ctx);

        assert_eq!(ctx.body, once);
    }
}
