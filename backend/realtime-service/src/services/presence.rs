/// Room presence tracking with TTL-based expiry
///
/// Layout in the store:
/// - `presence:room:{room_id}:users`               set of member user ids
/// - `presence:room:{room_id}:user:{user_id}:status` status string with TTL
///
/// A member whose status record has expired is treated as offline and pruned
/// from the set on the next read.
use crate::error::PresenceError;
use crate::models::PresenceStatus;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis_utils::SharedConnectionManager;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

/// Minimal key/value + set store with per-key expiry.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn add_member(&self, key: &str, member: &str) -> Result<(), PresenceError>;
    async fn remove_member(&self, key: &str, member: &str) -> Result<(), PresenceError>;
    async fn members(&self, key: &str) -> Result<Vec<String>, PresenceError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), PresenceError>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), PresenceError>;
    async fn get(&self, key: &str) -> Result<Option<String>, PresenceError>;
    async fn delete(&self, keys: &[String]) -> Result<(), PresenceError>;
}

/// Presence store on Redis.
#[derive(Clone)]
pub struct RedisPresenceStore {
    redis: SharedConnectionManager,
}

impl RedisPresenceStore {
    pub fn new(redis: SharedConnectionManager) -> Self {
        Self { redis }
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn add_member(&self, key: &str, member: &str) -> Result<(), PresenceError> {
        redis_utils::with_timeout(async {
            let mut conn = self.redis.lock().await;
            conn.sadd::<_, _, ()>(key, member).await
        })
        .await?;
        Ok(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), PresenceError> {
        redis_utils::with_timeout(async {
            let mut conn = self.redis.lock().await;
            conn.srem::<_, _, ()>(key, member).await
        })
        .await?;
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, PresenceError> {
        let members = redis_utils::with_timeout(async {
            let mut conn = self.redis.lock().await;
            conn.smembers::<_, Vec<String>>(key).await
        })
        .await?;
        Ok(members)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), PresenceError> {
        redis_utils::with_timeout(async {
            let mut conn = self.redis.lock().await;
            conn.expire::<_, ()>(key, ttl_secs(ttl) as i64).await
        })
        .await?;
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), PresenceError> {
        redis_utils::with_timeout(async {
            let mut conn = self.redis.lock().await;
            conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl)).await
        })
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PresenceError> {
        let value = redis_utils::with_timeout(async {
            let mut conn = self.redis.lock().await;
            conn.get::<_, Option<String>>(key).await
        })
        .await?;
        Ok(value)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), PresenceError> {
        if keys.is_empty() {
            return Ok(());
        }
        redis_utils::with_timeout(async {
            let mut conn = self.redis.lock().await;
            conn.del::<_, ()>(keys).await
        })
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// In-process presence store with lazy expiry on tokio time.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        entries.retain(|_, entry| entry.live(now));
        f(&mut entries)
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn add_member(&self, key: &str, member: &str) -> Result<(), PresenceError> {
        self.with_entries(|entries| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Set(HashSet::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Value::Set(set) => {
                    set.insert(member.to_string());
                    Ok(())
                }
                Value::Text(_) => Err(PresenceError::Store(format!("{key} is not a set"))),
            }
        })
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), PresenceError> {
        self.with_entries(|entries| {
            let now_empty = match entries.get_mut(key).map(|e| &mut e.value) {
                Some(Value::Set(set)) => {
                    set.remove(member);
                    set.is_empty()
                }
                Some(Value::Text(_)) => {
                    return Err(PresenceError::Store(format!("{key} is not a set")))
                }
                None => false,
            };
            // Redis drops empty sets
            if now_empty {
                entries.remove(key);
            }
            Ok(())
        })
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, PresenceError> {
        self.with_entries(|entries| match entries.get(key).map(|e| &e.value) {
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(Value::Text(_)) => Err(PresenceError::Store(format!("{key} is not a set"))),
            None => Ok(Vec::new()),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), PresenceError> {
        self.with_entries(|entries| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
            Ok(())
        })
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), PresenceError> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Text(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(())
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, PresenceError> {
        self.with_entries(|entries| match entries.get(key).map(|e| &e.value) {
            Some(Value::Text(text)) => Ok(Some(text.clone())),
            Some(Value::Set(_)) => Err(PresenceError::Store(format!("{key} is not a string"))),
            None => Ok(None),
        })
    }

    async fn delete(&self, keys: &[String]) -> Result<(), PresenceError> {
        self.with_entries(|entries| {
            for key in keys {
                entries.remove(key);
            }
            Ok(())
        })
    }
}

fn members_key(room_id: &str) -> String {
    format!("presence:room:{room_id}:users")
}

fn status_key(room_id: &str, user_id: &str) -> String {
    format!("presence:room:{room_id}:user:{user_id}:status")
}

/// Who is in which room, and what they are doing.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PresenceStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn join(&self, room_id: &str, user_id: &str) -> Result<(), PresenceError> {
        self.mark(room_id, user_id, PresenceStatus::Online).await?;
        tracing::debug!(room_id = %room_id, user_id = %user_id, "joined room presence");
        Ok(())
    }

    pub async fn leave(&self, room_id: &str, user_id: &str) -> Result<(), PresenceError> {
        self.store
            .remove_member(&members_key(room_id), user_id)
            .await?;
        self.store.delete(&[status_key(room_id, user_id)]).await?;
        tracing::debug!(room_id = %room_id, user_id = %user_id, "left room presence");
        Ok(())
    }

    /// Members with a live status record, sorted. Expired members are pruned.
    pub async fn get_online_users(&self, room_id: &str) -> Result<Vec<String>, PresenceError> {
        let key = members_key(room_id);
        let mut online = Vec::new();

        for user_id in self.store.members(&key).await? {
            match self.store.get(&status_key(room_id, &user_id)).await? {
                Some(_) => online.push(user_id),
                None => {
                    tracing::debug!(room_id = %room_id, user_id = %user_id, "pruning expired presence");
                    self.store.remove_member(&key, &user_id).await?;
                }
            }
        }

        online.sort();
        Ok(online)
    }

    pub async fn get_online_count(&self, room_id: &str) -> Result<usize, PresenceError> {
        Ok(self.get_online_users(room_id).await?.len())
    }

    pub async fn is_online(&self, room_id: &str, user_id: &str) -> Result<bool, PresenceError> {
        Ok(self.get_status(room_id, user_id).await? != PresenceStatus::Offline)
    }

    /// Set a member's status. `Offline` is the same as leaving.
    pub async fn update_status(
        &self,
        room_id: &str,
        user_id: &str,
        status: PresenceStatus,
    ) -> Result<(), PresenceError> {
        if status == PresenceStatus::Offline {
            return self.leave(room_id, user_id).await;
        }
        self.mark(room_id, user_id, status).await
    }

    /// Status of a member; `Offline` when no live record exists.
    pub async fn get_status(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<PresenceStatus, PresenceError> {
        match self.store.get(&status_key(room_id, user_id)).await? {
            Some(raw) => raw.parse().map_err(PresenceError::InvalidStatus),
            None => Ok(PresenceStatus::Offline),
        }
    }

    /// Extend a member's TTL. Returns `false` if the record already expired.
    pub async fn refresh(&self, room_id: &str, user_id: &str) -> Result<bool, PresenceError> {
        let key = status_key(room_id, user_id);
        let Some(current) = self.store.get(&key).await? else {
            return Ok(false);
        };

        self.store.set_with_ttl(&key, &current, self.ttl).await?;
        let members = members_key(room_id);
        self.store.add_member(&members, user_id).await?;
        self.store.expire(&members, self.ttl).await?;
        Ok(true)
    }

    /// Remove every presence record for a room.
    pub async fn cleanup(&self, room_id: &str) -> Result<(), PresenceError> {
        let key = members_key(room_id);
        let mut keys: Vec<String> = self
            .store
            .members(&key)
            .await?
            .iter()
            .map(|user_id| status_key(room_id, user_id))
            .collect();
        keys.push(key);
        self.store.delete(&keys).await?;
        tracing::info!(room_id = %room_id, "room presence cleaned up");
        Ok(())
    }

    async fn mark(
        &self,
        room_id: &str,
        user_id: &str,
        status: PresenceStatus,
    ) -> Result<(), PresenceError> {
        let members = members_key(room_id);
        self.store.add_member(&members, user_id).await?;
        self.store.expire(&members, self.ttl).await?;
        self.store
            .set_with_ttl(&status_key(room_id, user_id), status.as_str(), self.ttl)
            .await
    }
}
