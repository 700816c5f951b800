//! Usage records, pricing, and effectiveness aggregation.
//!
//! One record per completed request (user or warmup). Writes are
//! queue-and-flush so the request hot path never blocks on persistence; the
//! store behind the queue is abstract and append-only.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{GatewayError, GatewayErrorKind, GatewayResult};
use crate::stream::{RelayContext, StreamUsage};

/// Discount applied to cache-read tokens, relative to the base input price.
pub const CACHE_READ_RATIO: f64 = 0.1;
/// Premium applied to cache-creation tokens.
pub const CACHE_CREATION_RATIO: f64 = 1.25;

/// Token classes handed to the pricing collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenClasses {
    pub cache_read: u64,
    pub cache_creation: u64,
    pub uncached: u64,
    pub completion: u64,
}

/// External pricing function: token classes → abstract quota units.
///
/// Injected so cost math stays unit-testable with fixture pricers.
pub trait Pricer: Send + Sync {
    fn price(&self, model: &str, tokens: &TokenClasses) -> f64;
}

/// Default pricer: per-model base prices with the standard cache multipliers.
/// Assumes short-TTL economics for cache creation.
#[derive(Debug, Clone)]
pub struct RatioPricer {
    /// Longest-prefix-wins table of (model prefix, input, output) prices per
    /// million tokens.
    rates: Vec<(&'static str, f64, f64)>,
    default_input: f64,
    default_output: f64,
}

impl RatioPricer {
    pub fn standard() -> Self {
        Self {
            rates: vec![
                ("claude-3-5-haiku", 0.8, 4.0),
                ("claude-3-5-sonnet", 3.0, 15.0),
                ("claude-3-7-sonnet", 3.0, 15.0),
                ("claude-3-opus", 15.0, 75.0),
                ("claude-3-haiku", 0.25, 1.25),
                ("claude-haiku-4", 1.0, 5.0),
                ("claude-sonnet-4", 3.0, 15.0),
                ("claude-opus-4", 15.0, 75.0),
            ],
            default_input: 3.0,
            default_output: 15.0,
        }
    }

    fn rates_for(&self, model: &str) -> (f64, f64) {
        self.rates
            .iter()
            .filter(|(prefix, _, _)| model.starts_with(prefix))
            .max_by_key(|(prefix, _, _)| prefix.len())
            .map_or((self.default_input, self.default_output), |(_, i, o)| {
                (*i, *o)
            })
    }
}

impl Pricer for RatioPricer {
    fn price(&self, model: &str, tokens: &TokenClasses) -> f64 {
        let (input, output) = self.rates_for(model);
        let per_mtok = |count: u64, rate: f64| (count as f64) * rate / 1_000_000.0;
        per_mtok(tokens.uncached, input)
            + per_mtok(tokens.cache_read, input * CACHE_READ_RATIO)
            + per_mtok(tokens.cache_creation, input * CACHE_CREATION_RATIO)
            + per_mtok(tokens.completion, output)
    }
}

/// One persisted record per completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub channel_id: i64,
    pub channel_name: String,
    pub user_id: i64,
    pub token_id: i64,
    pub log_id: String,
    pub model_name: String,
    pub created_at: DateTime<Utc>,
    pub prompt_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub completion_tokens: u64,
    pub cost_with_cache: f64,
    pub cost_without_cache: f64,
    pub cost_saved: f64,
    /// Synthetic warmup request, invisible to user billing.
    pub is_warmup: bool,
}

impl UsageRecord {
    /// Builds a record from extracted usage, pricing both the real token mix
    /// and the counterfactual all-uncached mix.
    pub fn build(
        ctx: &RelayContext,
        usage: &StreamUsage,
        is_warmup: bool,
        pricer: &dyn Pricer,
        created_at: DateTime<Utc>,
    ) -> Self {
        let uncached = usage
            .prompt_tokens
            .saturating_sub(usage.cache_read_tokens + usage.cache_creation_tokens);
        let classes = TokenClasses {
            cache_read: usage.cache_read_tokens,
            cache_creation: usage.cache_creation_tokens,
            uncached,
            completion: usage.completion_tokens,
        };
        let all_uncached = TokenClasses {
            cache_read: 0,
            cache_creation: 0,
            uncached: usage.prompt_tokens,
            completion: usage.completion_tokens,
        };
        let model = if usage.model.is_empty() {
            ctx.model.clone()
        } else {
            usage.model.clone()
        };
        let cost_with_cache = pricer.price(&model, &classes);
        let cost_without_cache = pricer.price(&model, &all_uncached);
        Self {
            channel_id: ctx.channel_id,
            channel_name: ctx.channel_name.clone(),
            user_id: ctx.user_id,
            token_id: ctx.token_id,
            log_id: ctx.log_id.clone(),
            model_name: model,
            created_at,
            prompt_tokens: usage.prompt_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            completion_tokens: usage.completion_tokens,
            cost_with_cache,
            cost_without_cache,
            cost_saved: cost_without_cache - cost_with_cache,
            is_warmup,
        }
    }

    pub fn uncached_tokens(&self) -> u64 {
        self.prompt_tokens
            .saturating_sub(self.cache_read_tokens + self.cache_creation_tokens)
    }

    /// Cache-read tokens over prompt tokens, in `[0, 1]`.
    pub fn cache_hit_rate(&self) -> f64 {
        let rate = self.cache_read_tokens as f64 / self.prompt_tokens.max(1) as f64;
        rate.clamp(0.0, 1.0)
    }
}

/// Append-only persistence behind the recorder queue.
pub trait UsageStore: Send + Sync {
    /// # Errors
    /// Returns `PersistenceFailed` when the write is lost.
    fn append(&self, record: UsageRecord) -> GatewayResult<()>;

    /// Records with `created_at` inside `[from, to]`.
    ///
    /// # Errors
    /// Returns `PersistenceFailed` when the store cannot be read.
    fn query_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> GatewayResult<Vec<UsageRecord>>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    records: RwLock<Vec<UsageRecord>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UsageStore for MemoryUsageStore {
    fn append(&self, record: UsageRecord) -> GatewayResult<()> {
        self.records
            .write()
            .map_err(|_| GatewayError::new(GatewayErrorKind::PersistenceFailed, "store poisoned"))?
            .push(record);
        Ok(())
    }

    fn query_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> GatewayResult<Vec<UsageRecord>> {
        Ok(self
            .records
            .read()
            .map_err(|_| GatewayError::new(GatewayErrorKind::PersistenceFailed, "store poisoned"))?
            .iter()
            .filter(|r| r.created_at >= from && r.created_at <= to)
            .cloned()
            .collect())
    }
}

/// Non-blocking recorder: the hot path enqueues, a background task flushes.
pub struct UsageRecorder {
    tx: mpsc::UnboundedSender<UsageRecord>,
    pricer: Arc<dyn Pricer>,
}

impl std::fmt::Debug for UsageRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageRecorder").finish_non_exhaustive()
    }
}

impl UsageRecorder {
    /// Spawns the flush task and returns the recorder handle plus the task
    /// handle for bounded shutdown joins.
    pub fn spawn(
        store: Arc<dyn UsageStore>,
        pricer: Arc<dyn Pricer>,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<UsageRecord>();
        let flusher = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(err) = store.append(record) {
                    warn!(error = %err, "usage record write failed");
                }
            }
        });
        (Arc::new(Self { tx, pricer }), flusher)
    }

    /// Enqueues one record for a completed request. Never blocks.
    pub fn record(&self, ctx: &RelayContext, usage: &StreamUsage, is_warmup: bool) {
        let record = UsageRecord::build(ctx, usage, is_warmup, self.pricer.as_ref(), Utc::now());
        // A closed queue means shutdown is in progress; the record is lost
        // by design, matching the persistence failure policy.
        let _ = self.tx.send(record);
    }
}

/// Time bucket for trend queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendBucket {
    Hour,
    Day,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSummary {
    pub requests: u64,
    pub cache_read_tokens: u64,
    pub prompt_tokens: u64,
    pub cost_saved: f64,
    pub mean_hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSummary {
    pub channel_id: i64,
    pub channel_name: String,
    pub summary: UsageSummary,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendPoint {
    pub bucket_start: DateTime<Utc>,
    pub requests: u64,
    pub mean_hit_rate: f64,
    pub cost_saved: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoiReport {
    pub user_cost_saved: f64,
    pub warmup_cost: f64,
    pub net_savings: f64,
    /// `user_cost_saved / warmup_cost − 1`; zero when nothing was spent on
    /// warmups.
    pub roi: f64,
    /// Warmup spend amortized per user request.
    pub break_even_point: f64,
    pub is_cost_effective: bool,
}

/// Aggregation queries over a closed time range.
pub struct UsageAnalytics {
    store: Arc<dyn UsageStore>,
}

impl std::fmt::Debug for UsageAnalytics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageAnalytics").finish_non_exhaustive()
    }
}

impl UsageAnalytics {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    /// Totals over user requests (warmups excluded).
    ///
    /// # Errors
    /// Propagates store read failures.
    pub fn summary(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> GatewayResult<UsageSummary> {
        let records = self.store.query_range(from, to)?;
        Ok(summarize(records.iter().filter(|r| !r.is_warmup)))
    }

    /// Same totals, grouped per channel.
    ///
    /// # Errors
    /// Propagates store read failures.
    pub fn per_channel(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> GatewayResult<Vec<ChannelSummary>> {
        let records = self.store.query_range(from, to)?;
        let mut groups: BTreeMap<i64, (String, Vec<&UsageRecord>)> = BTreeMap::new();
        for record in records.iter().filter(|r| !r.is_warmup) {
            groups
                .entry(record.channel_id)
                .or_insert_with(|| (record.channel_name.clone(), Vec::new()))
                .1
                .push(record);
        }
        Ok(groups
            .into_iter()
            .map(|(channel_id, (channel_name, records))| ChannelSummary {
                channel_id,
                channel_name,
                summary: summarize(records.into_iter()),
            })
            .collect())
    }

    /// Bucketed series of user-request totals.
    ///
    /// # Errors
    /// Propagates store read failures.
    pub fn trend(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        bucket: TrendBucket,
    ) -> GatewayResult<Vec<TrendPoint>> {
        let records = self.store.query_range(from, to)?;
        let mut buckets: BTreeMap<DateTime<Utc>, Vec<&UsageRecord>> = BTreeMap::new();
        for record in records.iter().filter(|r| !r.is_warmup) {
            buckets
                .entry(truncate(record.created_at, bucket))
                .or_default()
                .push(record);
        }
        Ok(buckets
            .into_iter()
            .map(|(bucket_start, records)| {
                let summary = summarize(records.into_iter());
                TrendPoint {
                    bucket_start,
                    requests: summary.requests,
                    mean_hit_rate: summary.mean_hit_rate,
                    cost_saved: summary.cost_saved,
                }
            })
            .collect())
    }

    /// Combines user savings with warmup spend into a return-on-investment
    /// view.
    ///
    /// # Errors
    /// Propagates store read failures.
    pub fn roi(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> GatewayResult<RoiReport> {
        let records = self.store.query_range(from, to)?;
        let mut user_cost_saved = 0.0;
        let mut user_requests = 0u64;
        let mut warmup_cost = 0.0;
        for record in &records {
            if record.is_warmup {
                warmup_cost += record.cost_with_cache;
            } else {
                user_cost_saved += record.cost_saved;
                user_requests += 1;
            }
        }
        let net_savings = user_cost_saved - warmup_cost;
        let roi = if warmup_cost > 0.0 {
            user_cost_saved / warmup_cost - 1.0
        } else {
            0.0
        };
        let break_even_point = if user_requests > 0 {
            warmup_cost / user_requests as f64
        } else {
            0.0
        };
        Ok(RoiReport {
            user_cost_saved,
            warmup_cost,
            net_savings,
            roi,
            break_even_point,
            is_cost_effective: net_savings > 0.0,
        })
    }
}

fn summarize<'a>(records: impl Iterator<Item = &'a UsageRecord>) -> UsageSummary {
    let mut summary = UsageSummary::default();
    let mut hit_rate_sum = 0.0;
    for record in records {
        summary.requests += 1;
        summary.cache_read_tokens += record.cache_read_tokens;
        summary.prompt_tokens += record.prompt_tokens;
        summary.cost_saved += record.cost_saved;
        hit_rate_sum += record.cache_hit_rate();
    }
    if summary.requests > 0 {
        summary.mean_hit_rate = hit_rate_sum / summary.requests as f64;
    }
    summary
}

fn truncate(at: DateTime<Utc>, bucket: TrendBucket) -> DateTime<Utc> {
    let hour = match bucket {
        TrendBucket::Hour => at.hour(),
        TrendBucket::Day => 0,
    };
    Utc.with_ymd_and_hms(at.year(), at.month(), at.day(), hour, 0, 0)
        .single()
        .unwrap_or(at)
}
