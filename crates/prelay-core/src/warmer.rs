//! Warmer scheduler: keeps upstream cache entries warm while traffic lasts.
//!
//! One scheduler serves every channel in the process. The interceptor feeds
//! it observations synchronously; a single background task periodically
//! selects armed channels and dispatches minimal synthetic requests that
//! refresh each channel's padding-bundle cache entry before it expires.
//!
//! Warmup traffic never touches the user-request pipeline: it goes straight
//! to the upstream with the channel's own key, consumes no user quota, and
//! is marked `is_warmup` in every usage record it produces.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use prelay_wire::{
    CacheControl, ContentBlock, Message, MessageRequest, MessagesResponse, SystemContent,
};
use serde_json::Map;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::{CacheTtl, ChannelConfig, ChannelDirectory};
use crate::eligibility::warmup_model;
use crate::error::{GatewayError, GatewayResult};
use crate::intercept::TrafficObserver;
use crate::metrics::UsageRecorder;
use crate::padding::BundleCache;
use crate::stream::{RelayContext, StreamUsage};

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Traffic-counting window.
const WINDOW: Duration = Duration::from_secs(5 * 60);
/// Traffic must be at most this recent for a refresh to be worth it.
const RECENT_TRAFFIC: Duration = Duration::from_secs(5 * 60);
/// Idle span after which an armed channel disarms.
const IDLE_DISARM: Duration = Duration::from_secs(10 * 60);

/// Scheduler tuning. Warmup intervals must stay strictly below the upstream
/// cache TTL of the matching tier, or the entry expires between refreshes.
#[derive(Debug, Clone)]
pub struct WarmerConfig {
    pub check_interval: Duration,
    pub warmup_interval_short: Duration,
    pub warmup_interval_long: Duration,
    pub dispatch_timeout: Duration,
    /// Used when a channel's threshold is unset (zero).
    pub default_threshold: u32,
    /// Grace period for in-flight warmups on shutdown.
    pub shutdown_grace: Duration,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            warmup_interval_short: Duration::from_secs(4 * 60),
            warmup_interval_long: Duration::from_secs(50 * 60),
            dispatch_timeout: Duration::from_secs(30),
            default_threshold: 10,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Per-channel runtime state, guarded by the scheduler's map lock.
#[derive(Debug)]
struct ChannelActivity {
    name: String,
    requests_5min: u32,
    window_start: Instant,
    last_user_request: Instant,
    last_warmup: Option<Instant>,
    warmup_armed: bool,
    threshold: u32,
    cache_ttl: CacheTtl,
    padding_version: String,
}

impl ChannelActivity {
    fn new(now: Instant, config: &ChannelConfig, padding_version: String) -> Self {
        Self {
            name: config.name.clone(),
            requests_5min: 0,
            window_start: now,
            last_user_request: now,
            last_warmup: None,
            warmup_armed: false,
            threshold: config.warmup_threshold,
            cache_ttl: config.cache_ttl,
            padding_version,
        }
    }
}

/// Read-only view of a channel's warmer state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivitySnapshot {
    pub requests_5min: u32,
    pub warmup_armed: bool,
    pub idle_for: Duration,
    pub last_warmup_age: Option<Duration>,
    pub padding_version: String,
}

/// Everything a dispatched warmup needs, snapshotted outside the lock.
struct WarmupTask {
    channel_id: i64,
    channel_name: String,
    cache_ttl: CacheTtl,
}

/// The process-wide warmer.
pub struct WarmerScheduler {
    channels: RwLock<HashMap<i64, ChannelActivity>>,
    directory: Arc<dyn ChannelDirectory>,
    bundles: Arc<BundleCache>,
    recorder: Option<Arc<UsageRecorder>>,
    http: reqwest::Client,
    config: WarmerConfig,
    inflight: tokio::sync::Mutex<tokio::task::JoinSet<()>>,
}

impl std::fmt::Debug for WarmerScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarmerScheduler").finish_non_exhaustive()
    }
}

impl WarmerScheduler {
    pub fn new(
        directory: Arc<dyn ChannelDirectory>,
        bundles: Arc<BundleCache>,
        recorder: Option<Arc<UsageRecorder>>,
        config: WarmerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            directory,
            bundles,
            recorder,
            http: reqwest::Client::new(),
            config,
            inflight: tokio::sync::Mutex::new(tokio::task::JoinSet::new()),
        })
    }

    /// Observes one optimized user request. Called synchronously from the
    /// interceptor; the critical section is a few field writes.
    pub fn observe(&self, channel: &ChannelConfig) {
        let now = Instant::now();
        let mut channels = self.channels.write().expect("warmer lock poisoned");
        let entry = channels.entry(channel.channel_id).or_insert_with(|| {
            let version = self.bundles.resolve(channel.channel_id).version().to_string();
            ChannelActivity::new(now, channel, version)
        });

        if now.duration_since(entry.window_start) > WINDOW {
            entry.window_start = now;
            entry.requests_5min = 0;
        }
        entry.requests_5min += 1;
        entry.last_user_request = now;
        // Config can change between requests; keep the snapshot fresh.
        entry.threshold = channel.warmup_threshold;
        entry.cache_ttl = channel.cache_ttl;

        let threshold = if entry.threshold == 0 {
            self.config.default_threshold
        } else {
            entry.threshold
        };
        if entry.requests_5min >= threshold && !entry.warmup_armed {
            debug!(
                channel_id = channel.channel_id,
                requests = entry.requests_5min,
                "warmup armed"
            );
            entry.warmup_armed = true;
        }
    }

    /// One scheduler pass: disarm idle channels, select refresh candidates,
    /// stamp them, and dispatch outside the lock. Normally driven by
    /// [`run`](Self::run); exposed so hosts and tests can drive time
    /// themselves.
    pub async fn tick(&self) {
        let now = Instant::now();

        let candidates: Vec<i64> = {
            let channels = self.channels.read().expect("warmer lock poisoned");
            channels
                .iter()
                .filter(|(_, a)| {
                    a.warmup_armed
                        && match a.last_warmup {
                            None => true,
                            Some(last) => {
                                now.duration_since(last) >= self.warmup_interval(a.cache_ttl)
                                    && now.duration_since(a.last_user_request) < RECENT_TRAFFIC
                            }
                        }
                })
                .map(|(id, _)| *id)
                .collect()
        };

        let mut tasks = Vec::new();
        {
            let mut channels = self.channels.write().expect("warmer lock poisoned");
            for activity in channels.values_mut() {
                if activity.warmup_armed
                    && now.duration_since(activity.last_user_request) > IDLE_DISARM
                {
                    debug!(channel = %activity.name, "warmup disarmed after idle");
                    activity.warmup_armed = false;
                }
            }
            for channel_id in candidates {
                if let Some(activity) = channels.get_mut(&channel_id)
                    && activity.warmup_armed
                {
                    activity.last_warmup = Some(now);
                    tasks.push(WarmupTask {
                        channel_id,
                        channel_name: activity.name.clone(),
                        cache_ttl: activity.cache_ttl,
                    });
                }
            }
        }

        if tasks.is_empty() {
            return;
        }
        let mut inflight = self.inflight.lock().await;
        // Reap whatever already finished so the set stays small.
        while inflight.try_join_next().is_some() {}
        for task in tasks {
            let scheduler = self.clone_parts();
            inflight.spawn(async move {
                if let Err(err) = scheduler.dispatch_warmup(&task).await {
                    warn!(
                        channel_id = task.channel_id,
                        error = %err,
                        "warmup dispatch failed; will retry next tick"
                    );
                }
            });
        }
    }

    /// Runs the scheduler until cancelled, then lets in-flight warmups
    /// finish within the configured grace period.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        let mut inflight = self.inflight.lock().await;
        let drain = async {
            while inflight.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("warmer shutdown grace elapsed with warmups still in flight");
        }
    }

    /// Current warmer state for one channel.
    pub fn activity(&self, channel_id: i64) -> Option<ActivitySnapshot> {
        let now = Instant::now();
        let channels = self.channels.read().expect("warmer lock poisoned");
        channels.get(&channel_id).map(|a| ActivitySnapshot {
            requests_5min: a.requests_5min,
            warmup_armed: a.warmup_armed,
            idle_for: now.duration_since(a.last_user_request),
            last_warmup_age: a.last_warmup.map(|t| now.duration_since(t)),
            padding_version: a.padding_version.clone(),
        })
    }

    fn warmup_interval(&self, ttl: CacheTtl) -> Duration {
        let interval = match ttl {
            CacheTtl::Short => self.config.warmup_interval_short,
            CacheTtl::Long => self.config.warmup_interval_long,
        };
        // Refresh must land before the upstream entry expires.
        interval.min(ttl.lifetime().saturating_sub(Duration::from_secs(30)))
    }

    fn clone_parts(&self) -> WarmupDispatcher {
        WarmupDispatcher {
            directory: Arc::clone(&self.directory),
            bundles: Arc::clone(&self.bundles),
            recorder: self.recorder.clone(),
            http: self.http.clone(),
            dispatch_timeout: self.config.dispatch_timeout,
        }
    }
}

impl TrafficObserver for WarmerScheduler {
    fn record(&self, channel: &ChannelConfig) {
        self.observe(channel);
    }
}

/// The parts of the scheduler a spawned warmup actually needs.
struct WarmupDispatcher {
    directory: Arc<dyn ChannelDirectory>,
    bundles: Arc<BundleCache>,
    recorder: Option<Arc<UsageRecorder>>,
    http: reqwest::Client,
    dispatch_timeout: Duration,
}

impl WarmupDispatcher {
    /// Sends one minimal cache-refresh request straight to the upstream.
    async fn dispatch_warmup(&self, task: &WarmupTask) -> GatewayResult<()> {
        let api_key = self.directory.api_key(task.channel_id).ok_or_else(|| {
            GatewayError::warmup(format!("channel {} has no api key", task.channel_id))
        })?;
        let base_url = self.directory.base_url(task.channel_id).ok_or_else(|| {
            GatewayError::warmup(format!("channel {} has no base url", task.channel_id))
        })?;
        let bundle = self.bundles.resolve(task.channel_id);

        let marker = CacheControl::ephemeral_with_ttl(task.cache_ttl.wire_ttl());
        let request = MessageRequest {
            model: warmup_model().to_string(),
            max_tokens: 1,
            messages: vec![Message::user("warmup")],
            system: Some(SystemContent::Blocks(vec![ContentBlock::cached_text(
                bundle.text(),
                marker,
            )])),
            stream: false,
            tools: None,
            tool_choice: None,
            stop_sequences: None,
            thinking: None,
            extra: Map::new(),
        };

        let url = format!("{}/v1/messages", base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .timeout(self.dispatch_timeout)
            .header("content-type", "application/json")
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("x-api-key", &api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| GatewayError::warmup(format!("warmup send failed: {err}")))?;

        let status = response.status();
        let body = response.bytes().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::warmup(format!(
                "warmup got HTTP {status} from {url}"
            )));
        }

        debug!(
            channel_id = task.channel_id,
            padding_version = bundle.version(),
            "warmup refreshed cache entry"
        );

        if let Some(recorder) = &self.recorder {
            let usage = match MessagesResponse::from_slice(&body) {
                Ok(parsed) => StreamUsage {
                    message_id: parsed.id,
                    model: parsed.model,
                    prompt_tokens: parsed.usage.input_tokens,
                    completion_tokens: parsed.usage.output_tokens,
                    cache_read_tokens: parsed.usage.cache_read_input_tokens,
                    cache_creation_tokens: parsed.usage.cache_creation_input_tokens,
                    accounted: true,
                },
                Err(_) => StreamUsage {
                    model: warmup_model().to_string(),
                    ..StreamUsage::default()
                },
            };
            let ctx = RelayContext {
                channel_id: task.channel_id,
                channel_name: task.channel_name.clone(),
                model: warmup_model().to_string(),
                ..RelayContext::default()
            };
            recorder.record(&ctx, &usage, true);
        }
        Ok(())
    }
}
