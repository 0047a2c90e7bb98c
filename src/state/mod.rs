use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::presence::{AggregatorStats, LivenessQuery, PresenceIngest, PresencePipeline};

/// Shared state handed to every handler and middleware.
pub struct AppState {
    pub ingest: PresenceIngest,
    pub liveness: LivenessQuery,
    pub aggregator_stats: Arc<AggregatorStats>,
    /// Which presence backend is live ("memory", "postgres", "redis").
    pub store_backend: &'static str,
    /// When the process started (for uptime / status page).
    pub started_at: Instant,
    /// ISO8601 timestamp when the process started (for status).
    pub started_at_utc: String,
    /// Cached process memory; refreshing sysinfo is too slow to do on every status poll.
    pub memory_cache: Arc<Mutex<Option<(u64, Instant)>>>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(pipeline: &PresencePipeline, store_backend: &'static str) -> Self {
        Self {
            ingest: pipeline.ingest(),
            liveness: pipeline.liveness(),
            aggregator_stats: pipeline.aggregator_stats(),
            store_backend,
            started_at: Instant::now(),
            started_at_utc: chrono::Utc::now().to_rfc3339(),
            memory_cache: Arc::new(Mutex::new(None)),
        }
    }
}
