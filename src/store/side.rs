//! Connection-state side store: read / write-with-TTL / delete plus member sets
//!
//! The production deployment points this at a shared key/value service; the
//! in-memory implementation backs single-process runs and tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{self, BoxFuture};
use parking_lot::RwLock;

use crate::game::entity::PlayerId;

/// Per-identity connection record lifetime
pub const CONNECTION_TTL: Duration = Duration::from_secs(120);
/// Per-identity session record lifetime
pub const SESSION_TTL: Duration = Duration::from_secs(300);
/// Per-match member set lifetime
pub const MATCH_MEMBERS_TTL: Duration = Duration::from_secs(3600);

pub fn connection_key(id: PlayerId) -> String {
    format!("conn:{}", id)
}

pub fn session_key(id: PlayerId) -> String {
    format!("session:{}", id)
}

pub fn match_members_key(match_id: &uuid::Uuid) -> String {
    format!("match:{}:members", match_id)
}

/// Side store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Durable key/value store with expiry
pub trait SideStore: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>>;

    fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), StoreError>>;

    /// Reset the expiry of `key` only while it still holds `expected`.
    /// Returns whether the value matched.
    fn refresh_if_matches(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, StoreError>>;

    /// Add to a set, (re)setting the set's expiry
    fn add_member(
        &self,
        key: &str,
        member: String,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), StoreError>>;

    fn members(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, StoreError>>;
}

#[derive(Debug)]
enum Value {
    Text(String),
    Set(HashSet<String>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Instant,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local side store. Expired keys are dropped lazily on access.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slots: Arc<RwLock<HashMap<String, Slot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_text(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let slots = self.slots.read();
        match slots.get(key) {
            Some(Slot {
                value: Value::Text(text),
                expires_at,
            }) if *expires_at > now => Some(text.clone()),
            _ => None,
        }
    }

    /// Remove every expired key
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.write();
        let before = slots.len();
        slots.retain(|_, slot| slot.live(now));
        before - slots.len()
    }
}

impl SideStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, StoreError>> {
        Box::pin(future::ready(Ok(self.read_text(key))))
    }

    fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        self.slots.write().insert(
            key.to_string(),
            Slot {
                value: Value::Text(value),
                expires_at: Instant::now() + ttl,
            },
        );
        Box::pin(future::ready(Ok(())))
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        self.slots.write().remove(key);
        Box::pin(future::ready(Ok(())))
    }

    fn refresh_if_matches(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, StoreError>> {
        let now = Instant::now();
        let mut slots = self.slots.write();
        let refreshed = match slots.get_mut(key) {
            Some(slot) if slot.live(now) => match &slot.value {
                Value::Text(text) if text == expected => {
                    slot.expires_at = now + ttl;
                    true
                }
                _ => false,
            },
            _ => false,
        };
        Box::pin(future::ready(Ok(refreshed)))
    }

    fn add_member(
        &self,
        key: &str,
        member: String,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let now = Instant::now();
        let mut slots = self.slots.write();
        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Set(HashSet::new()),
            expires_at: now,
        });
        if !slot.live(now) || !matches!(slot.value, Value::Set(_)) {
            slot.value = Value::Set(HashSet::new());
        }
        if let Value::Set(set) = &mut slot.value {
            set.insert(member);
        }
        slot.expires_at = now + ttl;
        Box::pin(future::ready(Ok(())))
    }

    fn members(&self, key: &str) -> BoxFuture<'_, Result<Vec<String>, StoreError>> {
        let now = Instant::now();
        let slots = self.slots.read();
        let members = match slots.get(key) {
            Some(Slot {
                value: Value::Set(set),
                expires_at,
            }) if *expires_at > now => {
                let mut members: Vec<String> = set.iter().cloned().collect();
                members.sort();
                members
            }
            _ => Vec::new(),
        };
        Box::pin(future::ready(Ok(members)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_ok, block_on};

    #[tokio::test]
    async fn set_get_delete() {
        let store = MemoryStore::new();
        assert_ok!(
            store
                .set_with_ttl("conn:1", "a".into(), Duration::from_secs(60))
                .await
        );
        assert_eq!(store.get("conn:1").await.unwrap().as_deref(), Some("a"));

        assert_ok!(store.delete("conn:1").await);
        assert_eq!(store.get("conn:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_values_are_invisible() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("conn:1", "a".into(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(store.get("conn:1").await.unwrap(), None);
        assert_eq!(store.purge_expired(), 1);
    }

    #[tokio::test]
    async fn refresh_only_touches_matching_value() {
        let store = MemoryStore::new();
        assert_ok!(
            store
                .set_with_ttl("conn:2", "b".into(), Duration::from_secs(60))
                .await
        );

        assert!(!store.refresh_if_matches("conn:2", "a", CONNECTION_TTL).await.unwrap());
        assert_eq!(store.get("conn:2").await.unwrap().as_deref(), Some("b"));
        assert!(store.refresh_if_matches("conn:2", "b", CONNECTION_TTL).await.unwrap());
        assert!(!store.refresh_if_matches("conn:3", "b", CONNECTION_TTL).await.unwrap());
        assert_eq!(store.get("conn:3").await.unwrap(), None);
    }

    #[test]
    fn member_sets_accumulate() {
        let store = MemoryStore::new();
        let key = match_members_key(&uuid::Uuid::nil());
        block_on(async {
            for member in ["2", "1", "2"] {
                assert_ok!(store.add_member(&key, member.into(), MATCH_MEMBERS_TTL).await);
            }
            assert_eq!(store.members(&key).await.unwrap(), vec!["1", "2"]);
            assert_eq!(store.get(&key).await.unwrap(), None);
        });
    }

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(connection_key(7), "conn:7");
        assert_eq!(session_key(7), "session:7");
    }
}
