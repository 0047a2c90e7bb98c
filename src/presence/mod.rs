//! Presence ingestion pipeline.
//!
//! middleware -> `PresenceIngest::submit` -> bounded channel -> `BatchAggregator`
//! -> store <- `LivenessQuery` / `ExpirySweeper`.

pub mod aggregator;
pub mod channel;
pub mod envelope;
pub mod liveness;
pub mod sweeper;

pub use aggregator::{AggregatorSnapshot, AggregatorStats, BatchAggregator, FlushReport};
pub use channel::{ingest_channel, DropReason, IngestSnapshot, PresenceIngest, SubmitOutcome};
pub use envelope::{PresenceRecord, UpdateEnvelope};
pub use liveness::{LivenessQuery, LivenessWindow};
pub use sweeper::ExpirySweeper;

use std::sync::Arc;
use std::time::Duration;

use log::warn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::config::PresenceConfig;
use crate::store::SharedStore;

/// Longest period either background timer accepts.
pub const MAX_TIMER_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Ticker whose first tick lands one full period from now. The period is
/// clamped to `1ms..=MAX_TIMER_PERIOD` so the deadline never overflows `Instant`.
pub(crate) fn delayed_ticker(period: Duration) -> Interval {
    let period = period.clamp(Duration::from_millis(1), MAX_TIMER_PERIOD);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Running aggregator + sweeper pair and the handles request code needs.
pub struct PresencePipeline {
    ingest: PresenceIngest,
    liveness: LivenessQuery,
    aggregator_stats: Arc<AggregatorStats>,
    shutdown: watch::Sender<bool>,
    aggregator: JoinHandle<AggregatorSnapshot>,
    sweeper: JoinHandle<()>,
}

impl PresencePipeline {
    /// Spawn both background tasks on the current runtime.
    pub fn spawn(config: &PresenceConfig, store: SharedStore) -> Self {
        let window = LivenessWindow::new(config.liveness_window);
        let (ingest, rx) = ingest_channel(config.channel_capacity, config.submit_timeout);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let aggregator = BatchAggregator::new(store.clone(), config.batch_size, config.flush_interval);
        let aggregator_stats = aggregator.stats();
        let aggregator = tokio::spawn(aggregator.run(rx, shutdown_rx.clone()));

        let sweeper = ExpirySweeper::new(store.clone(), window, config.sweep_interval);
        let sweeper = tokio::spawn(sweeper.run(shutdown_rx));

        Self {
            ingest,
            liveness: LivenessQuery::new(store, window),
            aggregator_stats,
            shutdown,
            aggregator,
            sweeper,
        }
    }

    pub fn ingest(&self) -> PresenceIngest {
        self.ingest.clone()
    }

    pub fn liveness(&self) -> LivenessQuery {
        self.liveness.clone()
    }

    pub fn aggregator_stats(&self) -> Arc<AggregatorStats> {
        self.aggregator_stats.clone()
    }

    /// Stop both tasks. The aggregator drains the channel and flushes its
    /// buffer before this returns.
    pub async fn shutdown(self) -> AggregatorSnapshot {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.sweeper.await {
            warn!("Presence sweeper task failed: {}", e);
        }
        match self.aggregator.await {
            Ok(totals) => totals,
            Err(e) => {
                warn!("Presence aggregator task failed: {}", e);
                self.aggregator_stats.snapshot()
            }
        }
    }
}
