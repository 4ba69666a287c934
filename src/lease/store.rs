//! Lease and lock storage.
//!
//! `CombatLeaseStore` is the only way the combat core touches shared
//! key-value state. `InMemoryLeaseStore` backs a single-process deployment;
//! a networked cache can implement the same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::StoreError;

/// Proof of lock ownership. Releasing with a stale token is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub character_id: i64,
    pub owner: Uuid,
}

#[async_trait]
pub trait CombatLeaseStore: Send + Sync {
    async fn get_lease(&self, character_id: i64) -> Result<Option<Value>, StoreError>;

    async fn put_lease(&self, character_id: i64, payload: Value, ttl: Duration) -> Result<(), StoreError>;

    /// Overwrite only if a lease is still present. Returns false if it was gone.
    async fn replace_lease(&self, character_id: i64, payload: Value, ttl: Duration) -> Result<bool, StoreError>;

    /// Returns true if a lease was removed
    async fn delete_lease(&self, character_id: i64) -> Result<bool, StoreError>;

    async fn leased_characters(&self) -> Result<Vec<i64>, StoreError>;

    /// Single non-blocking attempt
    async fn try_lock(&self, character_id: i64, ttl: Duration) -> Result<Option<LockToken>, StoreError>;

    /// Returns false if the lock had expired or belongs to someone else
    async fn release_lock(&self, token: &LockToken) -> Result<bool, StoreError>;
}

/// Try to take the lock, polling until `wait` elapses.
pub async fn acquire_lock(
    store: &dyn CombatLeaseStore,
    character_id: i64,
    ttl: Duration,
    wait: Duration,
    poll: Duration,
) -> Result<Option<LockToken>, StoreError> {
    let deadline = Instant::now() + wait;
    loop {
        if let Some(token) = store.try_lock(character_id, ttl).await? {
            return Ok(Some(token));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

struct LeaseEntry {
    payload: Value,
    expires_at: Instant,
}

struct LockEntry {
    owner: Uuid,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: DashMap<i64, LeaseEntry>,
    locks: DashMap<i64, LockEntry>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CombatLeaseStore for InMemoryLeaseStore {
    async fn get_lease(&self, character_id: i64) -> Result<Option<Value>, StoreError> {
        let now = Instant::now();
        // Expired entries are dropped lazily
        self.leases.remove_if(&character_id, |_, entry| entry.expires_at <= now);
        Ok(self.leases.get(&character_id).map(|entry| entry.payload.clone()))
    }

    async fn put_lease(&self, character_id: i64, payload: Value, ttl: Duration) -> Result<(), StoreError> {
        self.leases.insert(
            character_id,
            LeaseEntry {
                payload,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn replace_lease(&self, character_id: i64, payload: Value, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        match self.leases.entry(character_id) {
            Entry::Occupied(mut occupied) if occupied.get().expires_at > now => {
                occupied.insert(LeaseEntry {
                    payload,
                    expires_at: now + ttl,
                });
                Ok(true)
            }
            Entry::Occupied(occupied) => {
                occupied.remove();
                Ok(false)
            }
            Entry::Vacant(_) => Ok(false),
        }
    }

    async fn delete_lease(&self, character_id: i64) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .leases
            .remove(&character_id)
            .is_some_and(|(_, entry)| entry.expires_at > now))
    }

    async fn leased_characters(&self) -> Result<Vec<i64>, StoreError> {
        let now = Instant::now();
        self.leases.retain(|_, entry| entry.expires_at > now);
        let mut ids: Vec<i64> = self.leases.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn try_lock(&self, character_id: i64, ttl: Duration) -> Result<Option<LockToken>, StoreError> {
        let now = Instant::now();
        let owner = Uuid::new_v4();
        let fresh = LockEntry {
            owner,
            expires_at: now + ttl,
        };

        // Set-if-absent-or-expired, atomic under the shard lock
        let acquired = match self.locks.entry(character_id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(fresh);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        };

        Ok(acquired.then_some(LockToken { character_id, owner }))
    }

    async fn release_lock(&self, token: &LockToken) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(self
            .locks
            .remove_if(&token.character_id, |_, entry| {
                entry.owner == token.owner && entry.expires_at > now
            })
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_lease_put_get_delete() {
        let store = InMemoryLeaseStore::new();
        assert!(store.get_lease(1).await.unwrap().is_none());

        store.put_lease(1, json!({ "skill_ids": [1] }), TTL).await.unwrap();
        assert_eq!(store.get_lease(1).await.unwrap(), Some(json!({ "skill_ids": [1] })));
        assert_eq!(store.leased_characters().await.unwrap(), vec![1]);

        assert!(store.delete_lease(1).await.unwrap());
        assert!(!store.delete_lease(1).await.unwrap());
        assert!(store.get_lease(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_does_not_resurrect() {
        let store = InMemoryLeaseStore::new();
        assert!(!store.replace_lease(1, json!({}), TTL).await.unwrap());
        assert!(store.get_lease(1).await.unwrap().is_none());

        store.put_lease(1, json!({ "a": 1 }), TTL).await.unwrap();
        assert!(store.replace_lease(1, json!({ "a": 2 }), TTL).await.unwrap());
        assert_eq!(store.get_lease(1).await.unwrap(), Some(json!({ "a": 2 })));
    }

    #[tokio::test]
    async fn test_lease_expires() {
        let store = InMemoryLeaseStore::new();
        store.put_lease(1, json!({}), Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get_lease(1).await.unwrap().is_none());
        assert!(store.leased_characters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_per_character() {
        let store = InMemoryLeaseStore::new();
        let token = store.try_lock(1, TTL).await.unwrap().unwrap();
        assert!(store.try_lock(1, TTL).await.unwrap().is_none());
        // Other characters are independent
        assert!(store.try_lock(2, TTL).await.unwrap().is_some());

        assert!(store.release_lock(&token).await.unwrap());
        assert!(store.try_lock(1, TTL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_token_cannot_release_new_owner() {
        let store = InMemoryLeaseStore::new();
        let old = store.try_lock(1, Duration::from_millis(10)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let new = store.try_lock(1, TTL).await.unwrap().unwrap();
        assert!(!store.release_lock(&old).await.unwrap());
        assert!(store.try_lock(1, TTL).await.unwrap().is_none());
        assert!(store.release_lock(&new).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_lock_waits_for_release() {
        let store = std::sync::Arc::new(InMemoryLeaseStore::new());
        let token = store.try_lock(1, TTL).await.unwrap().unwrap();

        let busy = acquire_lock(store.as_ref(), 1, TTL, Duration::ZERO, Duration::from_millis(5))
            .await
            .unwrap();
        assert!(busy.is_none());

        let releaser = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            releaser.release_lock(&token).await.unwrap();
        });

        let acquired = acquire_lock(
            store.as_ref(),
            1,
            TTL,
            Duration::from_secs(2),
            Duration::from_millis(5),
        )
        .await
        .unwrap();
        assert!(acquired.is_some());
    }
}
