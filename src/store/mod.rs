//! Presence store seam. The pipeline only ever talks to `dyn PresenceStore`;
//! backends are picked at startup from config (Postgres, Redis, or in-memory).

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis-backend")]
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use thiserror::Error;

use crate::config::PresenceConfig;
use crate::presence::PresenceRecord;
use crate::UserId;

pub use memory::InMemoryPresenceStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("presence store backend error: {0}")]
    Backend(String),
    #[error("presence store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt presence record: {0}")]
    Corrupt(String),
}

/// Keyed-by-user record of last-seen time, address and client signature.
///
/// Implementations must tolerate concurrent upserts (aggregator) and deletes
/// (sweeper). Per-user upsert is the only required atomic unit.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Insert or overwrite the record for `user_id`.
    async fn upsert_presence(
        &self,
        user_id: UserId,
        address: &str,
        client_signature: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Delete records with `last_active_time < cutoff`. Returns the number removed.
    async fn delete_presence_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Count records with `last_active_time > cutoff`.
    async fn count_presence_newer_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn get_presence(&self, user_id: UserId) -> Result<Option<PresenceRecord>, StoreError>;

    fn backend_name(&self) -> &'static str;
}

pub type SharedStore = Arc<dyn PresenceStore>;

/// Pick a backend from config. Durable backends are optional: a missing URL or
/// a failed connection logs and falls through to the next one.
#[cfg_attr(not(any(feature = "postgres", feature = "redis-backend")), allow(unused_variables))]
pub async fn connect_store(config: &PresenceConfig) -> SharedStore {
    #[cfg(feature = "postgres")]
    {
        if let Some(db_url) = config.db_url.as_deref() {
            match postgres::PgPresenceStore::connect(db_url).await {
                Ok(store) => {
                    info!("Postgres presence store enabled (PRESENCE_DB_URL set).");
                    return Arc::new(store);
                }
                Err(e) => log::warn!("Postgres presence store failed; continuing without DB: {}", e),
            }
        } else {
            info!("Postgres disabled (PRESENCE_DB_URL not set).");
        }
    }

    #[cfg(feature = "redis-backend")]
    {
        if let Some(redis_url) = config.redis_url.as_deref() {
            let ttl_secs = config.liveness_window.as_secs().saturating_mul(2).max(1);
            match self::redis::RedisPresenceStore::connect(redis_url, ttl_secs).await {
                Ok(store) => {
                    info!("Redis presence store enabled (PRESENCE_REDIS_URL set).");
                    return Arc::new(store);
                }
                Err(e) => log::warn!("Redis presence store failed; continuing without Redis: {}", e),
            }
        } else {
            info!("Redis presence disabled (PRESENCE_REDIS_URL not set).");
        }
    }

    info!("Using in-memory presence store; records do not survive restarts.");
    Arc::new(InMemoryPresenceStore::new())
}
