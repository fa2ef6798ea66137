//! Run lock preventing two runs from touching the same stage at once.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Seconds after which an abandoned run lock may be taken over.
pub const LOCK_EXPIRY_SECS: i64 = 3600;

/// Lock file contents for one stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    /// Identifier handed back to release the lock.
    pub lock_id: String,
    /// Process and operation holding the lock.
    pub holder: String,
    /// When the run took the lock.
    pub acquired_at: DateTime<Utc>,
    /// When another run may take it over.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Takes a lock for `holder` with the default expiry.
    #[must_use]
    pub fn new(holder: impl Into<String>) -> Self {
        Self::with_ttl(holder, Duration::seconds(LOCK_EXPIRY_SECS))
    }

    /// Takes a lock for `holder` that expires after `ttl`.
    #[must_use]
    pub fn with_ttl(holder: impl Into<String>, ttl: Duration) -> Self {
        let acquired_at = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.into(),
            acquired_at,
            expires_at: acquired_at + ttl,
        }
    }

    /// Whether the lock was abandoned as of `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the lock was abandoned.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time left before the lock can be taken over, never negative.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).max(Duration::zero())
    }

    /// Whether `lock_id` is the id handed out for this lock.
    #[must_use]
    pub fn is_held_by(&self, lock_id: &str) -> bool {
        self.lock_id == lock_id
    }
}

/// Identifies this process as a lock holder: `host:pid:nonce`.
#[must_use]
pub fn generate_holder_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| String::from("unknown-host"));
    let nonce = Uuid::new_v4().simple().to_string();

    format!("{host}:{}:{}", std::process::id(), &nonce[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_lock_is_live_for_the_default_expiry() {
        let lock = LockInfo::new("deploy");

        assert_eq!(lock.holder, "deploy");
        assert!(!lock.is_expired());
        assert_eq!(
            lock.expires_at - lock.acquired_at,
            Duration::seconds(LOCK_EXPIRY_SECS)
        );
        assert!(lock.remaining() > Duration::zero());
    }

    #[test]
    fn test_lock_expires_at_its_deadline() {
        let lock = LockInfo::with_ttl("deploy", Duration::seconds(30));

        assert!(!lock.is_expired_at(lock.acquired_at + Duration::seconds(29)));
        assert!(lock.is_expired_at(lock.expires_at));
    }

    #[test]
    fn test_abandoned_lock_has_no_time_left() {
        let lock = LockInfo::with_ttl("deploy", Duration::seconds(-5));

        assert!(lock.is_expired());
        assert_eq!(lock.remaining(), Duration::zero());
    }

    #[test]
    fn test_only_the_issued_id_holds_the_lock() {
        let lock = LockInfo::new("remove");
        let other = LockInfo::new("remove");

        assert!(lock.is_held_by(&lock.lock_id));
        assert!(!lock.is_held_by(&other.lock_id));
    }

    #[test]
    fn test_holder_ids_name_the_process() {
        let id = generate_holder_id();
        let parts: Vec<&str> = id.rsplitn(3, ':').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], std::process::id().to_string());
        assert_eq!(parts[0].len(), 8);
        assert_ne!(id, generate_holder_id());
    }
}
