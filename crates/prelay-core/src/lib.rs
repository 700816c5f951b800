//! Prompt-cache optimization and keep-alive core for the prelay gateway.
//!
//! The gateway fronts many end-user tokens with a pool of upstream provider
//! accounts. Because the provider discounts reads of previously-seen prompt
//! prefixes, injecting one shared high-token prefix into every request lets
//! all users of a channel share a single upstream cache entry. This crate
//! owns that optimization end to end:
//!
//! - [`intercept`] rewrites eligible request bodies in the proxy pipeline,
//! - [`eligibility`] decides which models qualify,
//! - [`inject`] performs the system-prompt rewrite within the provider's
//!   cache-marker budget,
//! - [`stream`] relays upstream responses while extracting cache telemetry,
//! - [`warmer`] refreshes cache entries between bursts of traffic,
//! - [`metrics`] prices and aggregates the savings.
//!
//! [`subsystem::CacheSubsystem`] wires the pieces together for a host
//! process.

pub mod channel;
pub mod config;
pub mod eligibility;
pub mod error;
pub mod inject;
pub mod intercept;
pub mod metrics;
pub mod padding;
pub mod stream;
pub mod subsystem;
pub mod tokens;
pub mod warmer;

pub use channel::{CacheTtl, ChannelConfig, ChannelDirectory};
pub use config::GatewayConfig;
pub use eligibility::{CacheDecision, decide};
pub use error::{GatewayError, GatewayErrorKind, GatewayResult};
pub use intercept::{Interceptor, RequestContext};
pub use metrics::{UsageAnalytics, UsageRecord, UsageRecorder};
pub use padding::{BundleCache, PaddingBundle};
pub use stream::{RelayContext, RelayOptions, StreamRelay, StreamUsage};
pub use subsystem::CacheSubsystem;
pub use warmer::{WarmerConfig, WarmerScheduler};
