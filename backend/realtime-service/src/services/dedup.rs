/// Envelope deduplication for the message bridge
///
/// Two backends:
/// 1. LocalDeduplicator: bounded in-process window (default)
/// 2. RedisDeduplicator: cross-instance window using SET NX EX
use async_trait::async_trait;
use redis_utils::SharedConnectionManager;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

#[async_trait]
pub trait Deduplicator: Send + Sync {
    /// Record `id` as processed. Returns `true` the first time an id is seen
    /// within the retention window.
    async fn first_seen(&self, id: &str) -> bool;

    /// Drop entries older than the retention window. Returns how many were removed.
    async fn purge_expired(&self) -> usize;
}

#[derive(Debug, Default)]
struct Window {
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

/// Bounded, time-windowed set of processed ids.
///
/// Expired entries are ignored on lookup and removed by `purge_expired`; once
/// `capacity` is reached the oldest entry is evicted.
#[derive(Debug)]
pub struct LocalDeduplicator {
    capacity: usize,
    retention: Duration,
    window: Mutex<Window>,
}

impl LocalDeduplicator {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            window: Mutex::new(Window::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark(&self, id: &str, now: Instant) -> bool {
        let mut window = self.lock();

        if let Some(seen_at) = window.seen.get(id) {
            if now.saturating_duration_since(*seen_at) < self.retention {
                return false;
            }
        }

        while window.seen.len() >= self.capacity {
            match window.order.pop_front() {
                Some((old_id, at)) => {
                    // Only evict if the queue entry is the live one for this id
                    if window.seen.get(&old_id) == Some(&at) {
                        window.seen.remove(&old_id);
                    }
                }
                None => break,
            }
        }

        window.seen.insert(id.to_string(), now);
        window.order.push_back((id.to_string(), now));
        true
    }

    fn purge(&self, now: Instant) -> usize {
        let mut window = self.lock();
        let before = window.seen.len();

        while let Some((_, at)) = window.order.front() {
            if now.saturating_duration_since(*at) < self.retention {
                break;
            }
            if let Some((id, at)) = window.order.pop_front() {
                if window.seen.get(&id) == Some(&at) {
                    window.seen.remove(&id);
                }
            }
        }

        before - window.seen.len()
    }
}

#[async_trait]
impl Deduplicator for LocalDeduplicator {
    async fn first_seen(&self, id: &str) -> bool {
        self.mark(id, Instant::now())
    }

    async fn purge_expired(&self) -> usize {
        self.purge(Instant::now())
    }
}

/// Redis-backed deduplication shared by every bridge instance.
///
/// Key format: `dedup:bridge:{envelope_id}`. Redis errors fail open.
#[derive(Clone)]
pub struct RedisDeduplicator {
    redis: SharedConnectionManager,
    ttl: Duration,
}

impl RedisDeduplicator {
    pub fn new(redis: SharedConnectionManager, ttl: Duration) -> Self {
        Self { redis, ttl }
    }

    fn key(id: &str) -> String {
        format!("dedup:bridge:{id}")
    }
}

#[async_trait]
impl Deduplicator for RedisDeduplicator {
    async fn first_seen(&self, id: &str) -> bool {
        let key = Self::key(id);
        let ttl_secs = self.ttl.as_secs().max(1);

        // SET key 1 NX EX ttl -> "OK" when set, nil when the key exists
        let result: redis::RedisResult<Option<String>> = redis_utils::with_timeout(async {
            let mut conn = self.redis.lock().await;
            redis::cmd("SET")
                .arg(&key)
                .arg(1)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query_async(&mut *conn)
                .await
        })
        .await;

        match result {
            Ok(reply) => reply.is_some(),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "redis dedup check failed; allowing envelope");
                true
            }
        }
    }

    async fn purge_expired(&self) -> usize {
        // Keys expire server-side
        0
    }
}
