//! The long-lived subsystem handle.
//!
//! One `CacheSubsystem` per process owns the translate pool, the warmer
//! task, and the recorder flush task. There are no hidden globals: tests
//! construct their own handle with their own store, pricer, and directory.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::channel::{ChannelConfig, ChannelDirectory, StaticChannelDirectory};
use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::intercept::{Interceptor, TrafficObserver};
use crate::metrics::{Pricer, RatioPricer, UsageAnalytics, UsageRecorder, UsageStore};
use crate::padding::BundleCache;
use crate::stream::{StreamRelay, TranslatePool};
use crate::warmer::WarmerScheduler;

pub struct CacheSubsystemBuilder {
    config: GatewayConfig,
    store: Option<Arc<dyn UsageStore>>,
    pricer: Arc<dyn Pricer>,
    directory: Option<Arc<dyn ChannelDirectory>>,
    channels: Vec<ChannelConfig>,
}

impl CacheSubsystemBuilder {
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn UsageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn pricer(mut self, pricer: Arc<dyn Pricer>) -> Self {
        self.pricer = pricer;
        self
    }

    pub fn directory(mut self, directory: Arc<dyn ChannelDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Channels to register at build time. Build fails on the first invalid
    /// one; use [`CacheSubsystem::register_channel`] for per-channel error
    /// handling on dynamic reloads.
    pub fn channels(mut self, channels: Vec<ChannelConfig>) -> Self {
        self.channels = channels;
        self
    }

    /// Wires the components together and starts the background tasks.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` when a preloaded channel fails validation.
    pub fn build(self) -> GatewayResult<CacheSubsystem> {
        let bundles = Arc::new(BundleCache::new());
        for channel in &self.channels {
            channel.validate()?;
            bundles.load_channel(channel)?;
        }

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(crate::metrics::MemoryUsageStore::new()));
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(StaticChannelDirectory::new(self.channels.clone())));

        let (recorder, flusher) = UsageRecorder::spawn(Arc::clone(&store), self.pricer);

        let warmer = WarmerScheduler::new(
            directory,
            Arc::clone(&bundles),
            Some(Arc::clone(&recorder)),
            self.config.warmer.clone(),
        );
        let cancel = CancellationToken::new();
        let warmer_task = tokio::spawn(Arc::clone(&warmer).run(cancel.child_token()));

        let interceptor = Interceptor::new(
            Arc::clone(&bundles),
            Some(Arc::clone(&warmer) as Arc<dyn TrafficObserver>),
        );
        let relay = StreamRelay::new(TranslatePool::with_defaults(), self.config.relay.clone());
        let analytics = UsageAnalytics::new(store);

        Ok(CacheSubsystem {
            config: self.config,
            bundles,
            interceptor,
            relay,
            warmer,
            recorder,
            analytics,
            cancel,
            tasks: vec![warmer_task, flusher],
        })
    }
}

/// Owner of the optimization core's shared state and background tasks.
#[derive(Debug)]
pub struct CacheSubsystem {
    config: GatewayConfig,
    bundles: Arc<BundleCache>,
    interceptor: Interceptor,
    relay: StreamRelay,
    warmer: Arc<WarmerScheduler>,
    recorder: Arc<UsageRecorder>,
    analytics: UsageAnalytics,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl CacheSubsystem {
    pub fn builder() -> CacheSubsystemBuilder {
        CacheSubsystemBuilder {
            config: GatewayConfig::default(),
            store: None,
            pricer: Arc::new(RatioPricer::standard()),
            directory: None,
            channels: Vec::new(),
        }
    }

    /// Registers (or re-registers) one channel, resolving its padding
    /// bundle.
    ///
    /// # Errors
    /// Returns `ConfigInvalid` when the channel's settings or padding
    /// override are invalid; the host must then keep optimization off for
    /// that channel. Other channels are unaffected.
    pub fn register_channel(&self, channel: &ChannelConfig) -> GatewayResult<()> {
        channel.validate().and_then(|()| {
            self.bundles.load_channel(channel).map(|_| ())
        }).inspect_err(|err| {
            error!(
                channel_id = channel.channel_id,
                error = %err,
                "channel rejected; optimization stays off for it"
            );
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    pub fn relay(&self) -> &StreamRelay {
        &self.relay
    }

    pub fn warmer(&self) -> &Arc<WarmerScheduler> {
        &self.warmer
    }

    pub fn recorder(&self) -> &Arc<UsageRecorder> {
        &self.recorder
    }

    pub fn analytics(&self) -> &UsageAnalytics {
        &self.analytics
    }

    /// Stops the background tasks, waiting up to the warmer's grace period
    /// for in-flight warmups.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let grace = self.config.warmer.shutdown_grace;
        drop(self.recorder);
        drop(self.warmer);
        for task in self.tasks {
            if tokio::time::timeout(grace, task).await.is_err() {
                // The flusher ends when the last recorder clone drops; a
                // host still holding one keeps it alive past shutdown.
                break;
            }
        }
    }
}
