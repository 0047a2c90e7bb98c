use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// One observed liveness signal for a user, submitted once per request.
/// Fields are private: an envelope is never mutated after the middleware builds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEnvelope {
    user_id: UserId,
    address: String,
    client_signature: String,
}

impl UpdateEnvelope {
    /// Returns None for user id 0 (anonymous requests never produce an envelope).
    pub fn new(user_id: UserId, address: impl Into<String>, client_signature: impl Into<String>) -> Option<Self> {
        if user_id == 0 {
            return None;
        }
        Some(Self {
            user_id,
            address: address.into(),
            client_signature: client_signature.into(),
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn client_signature(&self) -> &str {
        &self.client_signature
    }
}

/// Durable per-user presence row. At most one per user; upserts override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub last_active_time: DateTime<Utc>,
    pub address: String,
    pub client_signature: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_user_yields_no_envelope() {
        assert!(UpdateEnvelope::new(0, "10.0.0.1", "curl/8.0").is_none());
    }

    #[test]
    fn empty_address_and_signature_are_allowed() {
        let env = UpdateEnvelope::new(42, "", "").unwrap();
        assert_eq!(env.user_id(), 42);
        assert_eq!(env.address(), "");
        assert_eq!(env.client_signature(), "");
    }
}
