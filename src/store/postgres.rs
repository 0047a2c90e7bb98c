use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{PresenceStore, StoreError};
use crate::presence::PresenceRecord;
use crate::UserId;

pub struct PgPresenceStore {
    pool: PgPool,
}

impl PgPresenceStore {
    pub async fn connect(db_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(db_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("connect: {}", e)))?;
        init_db(&pool).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub async fn init_db(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_online_status (
          user_id BIGINT PRIMARY KEY,
          last_active_time TIMESTAMPTZ NOT NULL,
          ip TEXT NOT NULL,
          user_agent TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::Backend(format!("init_db user_online_status: {}", e)))?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS user_online_status_last_active_idx
          ON user_online_status (last_active_time);
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::Backend(format!("init_db last_active_idx: {}", e)))?;
    Ok(())
}

fn db_user_id(user_id: UserId) -> Result<i64, StoreError> {
    i64::try_from(user_id).map_err(|_| StoreError::Backend(format!("user id {} out of range", user_id)))
}

#[async_trait]
impl PresenceStore for PgPresenceStore {
    async fn upsert_presence(
        &self,
        user_id: UserId,
        address: &str,
        client_signature: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO user_online_status (user_id, last_active_time, ip, user_agent)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE
            SET last_active_time = EXCLUDED.last_active_time,
                ip = EXCLUDED.ip,
                user_agent = EXCLUDED.user_agent;
            "#,
        )
        .bind(db_user_id(user_id)?)
        .bind(observed_at)
        .bind(address)
        .bind(client_signature)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("upsert_presence: {}", e)))?;
        Ok(())
    }

    async fn delete_presence_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query("DELETE FROM user_online_status WHERE last_active_time < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("delete_presence_older_than: {}", e)))?;
        Ok(res.rows_affected())
    }

    async fn count_presence_newer_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS online FROM user_online_status WHERE last_active_time > $1")
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("count_presence_newer_than: {}", e)))?;
        let online: i64 = row
            .try_get("online")
            .map_err(|e| StoreError::Corrupt(format!("count_presence_newer_than online: {}", e)))?;
        Ok(online.max(0) as u64)
    }

    async fn get_presence(&self, user_id: UserId) -> Result<Option<PresenceRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT last_active_time, ip, user_agent
            FROM user_online_status
            WHERE user_id = $1
            "#,
        )
        .bind(db_user_id(user_id)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("get_presence: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(PresenceRecord {
            user_id,
            last_active_time: row
                .try_get("last_active_time")
                .map_err(|e| StoreError::Corrupt(format!("get_presence last_active_time: {}", e)))?,
            address: row
                .try_get("ip")
                .map_err(|e| StoreError::Corrupt(format!("get_presence ip: {}", e)))?,
            client_signature: row
                .try_get("user_agent")
                .map_err(|e| StoreError::Corrupt(format!("get_presence user_agent: {}", e)))?,
        }))
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
