//! Redis presence backend.
//!
//! Layout: a sorted set `presence:last_seen` (member = user id, score = last
//! active time in unix millis) is the liveness index; `presence:user:{id}` is a
//! hash with the record fields and a TTL so abandoned hashes expire on their own.
//! Range operations on the index are single commands, so a sweep never races
//! a concurrent upsert into a half-deleted record.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::{PresenceStore, StoreError};
use crate::presence::PresenceRecord;
use crate::UserId;

const INDEX_KEY: &str = "presence:last_seen";

pub fn redis_user_key(user_id: UserId) -> String {
    format!("presence:user:{}", user_id)
}

pub struct RedisPresenceStore {
    conn: MultiplexedConnection,
    record_ttl_secs: u64,
}

impl RedisPresenceStore {
    pub async fn connect(redis_url: &str, record_ttl_secs: u64) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {}", e)))?;
        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| StoreError::Unavailable(format!("redis conn: {}", e)))?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(format!("redis ping: {}", e)))?;
        Ok(Self { conn, record_ttl_secs })
    }
}

/// Scores are millisecond-granular; the `(` prefix makes the bound exclusive.
fn exclusive_bound(cutoff: DateTime<Utc>) -> String {
    format!("({}", cutoff.timestamp_millis())
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn upsert_presence(
        &self,
        user_id: UserId,
        address: &str,
        client_signature: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let user_key = redis_user_key(user_id);
        let observed = observed_at.to_rfc3339();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(INDEX_KEY, user_id, observed_at.timestamp_millis())
            .hset_multiple(
                &user_key,
                &[
                    ("address", address),
                    ("client_signature", client_signature),
                    ("last_active_time", observed.as_str()),
                ],
            )
            .expire(&user_key, self.record_ttl_secs as i64);
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("upsert_presence: {}", e)))?;
        Ok(())
    }

    async fn delete_presence_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREMRANGEBYSCORE")
            .arg(INDEX_KEY)
            .arg("-inf")
            .arg(exclusive_bound(cutoff))
            .query_async::<_, u64>(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("delete_presence_older_than: {}", e)))
    }

    async fn count_presence_newer_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("ZCOUNT")
            .arg(INDEX_KEY)
            .arg(exclusive_bound(cutoff))
            .arg("+inf")
            .query_async::<_, u64>(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("count_presence_newer_than: {}", e)))
    }

    async fn get_presence(&self, user_id: UserId) -> Result<Option<PresenceRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let indexed: Option<f64> = conn
            .zscore(INDEX_KEY, user_id)
            .await
            .map_err(|e| StoreError::Backend(format!("get_presence zscore: {}", e)))?;
        if indexed.is_none() {
            return Ok(None);
        }

        let mut fields: HashMap<String, String> = conn
            .hgetall(redis_user_key(user_id))
            .await
            .map_err(|e| StoreError::Backend(format!("get_presence hgetall: {}", e)))?;
        if fields.is_empty() {
            return Ok(None);
        }

        let last_active_time = fields
            .get("last_active_time")
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(|| StoreError::Corrupt(format!("user {} has no valid last_active_time", user_id)))?;

        Ok(Some(PresenceRecord {
            user_id,
            last_active_time,
            address: fields.remove("address").unwrap_or_default(),
            client_signature: fields.remove("client_signature").unwrap_or_default(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
