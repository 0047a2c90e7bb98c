use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::store::{SharedStore, StoreError};

pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(30 * 60);

/// How long after its last request a user still counts as online.
///
/// The sweeper and the online count both derive their cutoff from one value
/// of this type so the two never disagree on what "online" means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessWindow(Duration);

impl LivenessWindow {
    pub fn new(window: Duration) -> Self {
        Self(window)
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.0)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Default for LivenessWindow {
    fn default() -> Self {
        Self(DEFAULT_LIVENESS_WINDOW)
    }
}

/// Read path for the aggregate online count.
#[derive(Clone)]
pub struct LivenessQuery {
    store: SharedStore,
    window: LivenessWindow,
}

impl LivenessQuery {
    pub fn new(store: SharedStore, window: LivenessWindow) -> Self {
        Self { store, window }
    }

    pub fn window(&self) -> LivenessWindow {
        self.window
    }

    pub async fn count_online(&self) -> Result<u64, StoreError> {
        self.count_online_at(Utc::now()).await
    }

    pub async fn count_online_at(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        self.store.count_presence_newer_than(self.window.cutoff(now)).await
    }
}
