use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;

use super::delayed_ticker;
use super::liveness::LivenessWindow;
use crate::store::{SharedStore, StoreError};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Periodically deletes presence records that fell out of the liveness window.
/// Shares nothing with the aggregator except the store.
pub struct ExpirySweeper {
    store: SharedStore,
    window: LivenessWindow,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(store: SharedStore, window: LivenessWindow, interval: Duration) -> Self {
        Self { store, window, interval }
    }

    pub async fn sweep_once(&self) -> Result<u64, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.store.delete_presence_older_than(self.window.cutoff(now)).await
    }

    /// Tick until shutdown. A failed sweep is logged and retried on the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = delayed_ticker(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => match self.sweep_once().await {
                    Ok(0) => debug!("Presence sweep: nothing expired"),
                    Ok(removed) => info!("Presence sweep removed {} expired records", removed),
                    Err(e) => warn!("Presence sweep failed: {}", e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Presence sweeper stopped");
    }
}
