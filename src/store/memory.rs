use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{PresenceStore, StoreError};
use crate::presence::PresenceRecord;
use crate::UserId;

/// Process-local presence table. Used when no durable backend is configured.
pub struct InMemoryPresenceStore {
    records: RwLock<HashMap<UserId, PresenceRecord>>,
}

impl InMemoryPresenceStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for InMemoryPresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn upsert_presence(
        &self,
        user_id: UserId,
        address: &str,
        client_signature: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        records.insert(
            user_id,
            PresenceRecord {
                user_id,
                last_active_time: observed_at,
                address: address.to_string(),
                client_signature: client_signature.to_string(),
            },
        );
        Ok(())
    }

    async fn delete_presence_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| r.last_active_time >= cutoff);
        Ok((before - records.len()) as u64)
    }

    async fn count_presence_newer_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let records = self.records.read().await;
        Ok(records.values().filter(|r| r.last_active_time > cutoff).count() as u64)
    }

    async fn get_presence(&self, user_id: UserId) -> Result<Option<PresenceRecord>, StoreError> {
        Ok(self.records.read().await.get(&user_id).cloned())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn upsert_overwrites_existing_record() {
        let store = InMemoryPresenceStore::new();
        let t0 = Utc::now();
        store.upsert_presence(1, "10.0.0.1", "ua-a", t0).await.unwrap();
        store
            .upsert_presence(1, "10.0.0.2", "ua-b", t0 + Duration::seconds(3))
            .await
            .unwrap();

        assert_eq!(store.len().await, 1);
        let rec = store.get_presence(1).await.unwrap().unwrap();
        assert_eq!(rec.address, "10.0.0.2");
        assert_eq!(rec.client_signature, "ua-b");
        assert_eq!(rec.last_active_time, t0 + Duration::seconds(3));
    }

    #[tokio::test]
    async fn delete_then_count_never_sees_records_at_or_before_cutoff() {
        let store = InMemoryPresenceStore::new();
        let cutoff = Utc::now() - Duration::minutes(30);
        store.upsert_presence(1, "", "", cutoff - Duration::minutes(10)).await.unwrap();
        store.upsert_presence(2, "", "", cutoff).await.unwrap();
        store.upsert_presence(3, "", "", cutoff + Duration::seconds(1)).await.unwrap();

        let removed = store.delete_presence_older_than(cutoff).await.unwrap();
        assert_eq!(removed, 1);
        // Record exactly at the cutoff survives the delete but is not counted.
        assert_eq!(store.count_presence_newer_than(cutoff).await.unwrap(), 1);
        assert!(store.get_presence(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryPresenceStore::new();
        let now = Utc::now();
        store.upsert_presence(9, "", "", now - Duration::hours(2)).await.unwrap();
        assert_eq!(store.delete_presence_older_than(now - Duration::hours(1)).await.unwrap(), 1);
        assert_eq!(store.delete_presence_older_than(now - Duration::hours(1)).await.unwrap(), 0);
    }
}
