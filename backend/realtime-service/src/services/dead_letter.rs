use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis_utils::SharedConnectionManager;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Envelope the bridge gave up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub envelope_id: String,
    pub channel: String,
    pub payload: String,
    pub attempts: u32,
    pub error: String,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: DeadLetter);
}

fn log_dead_letter(letter: &DeadLetter) {
    tracing::error!(
        envelope_id = %letter.envelope_id,
        channel = %letter.channel,
        attempts = letter.attempts,
        error = %letter.error,
        "notification dead-lettered"
    );
}

/// Emits each dead letter as a structured error event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn record(&self, letter: DeadLetter) {
        log_dead_letter(&letter);
    }
}

/// Pushes dead letters onto a capped Redis list, newest first.
#[derive(Clone)]
pub struct RedisDeadLetterSink {
    redis: SharedConnectionManager,
    key: String,
    max_len: isize,
}

impl RedisDeadLetterSink {
    pub fn new(redis: SharedConnectionManager, key: impl Into<String>, max_len: usize) -> Self {
        Self {
            redis,
            key: key.into(),
            max_len: max_len.max(1) as isize,
        }
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterSink {
    async fn record(&self, letter: DeadLetter) {
        log_dead_letter(&letter);

        let record = match serde_json::to_string(&letter) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode dead letter");
                return;
            }
        };

        let result: redis::RedisResult<()> = redis_utils::with_timeout(async {
            let mut conn = self.redis.lock().await;
            redis::pipe()
                .lpush(&self.key, record)
                .ignore()
                .ltrim(&self.key, 0, self.max_len - 1)
                .ignore()
                .query_async(&mut *conn)
                .await
        })
        .await;

        if let Err(e) = result {
            tracing::warn!(key = %self.key, error = %e, "failed to persist dead letter");
        }
    }
}

/// Keeps dead letters in memory; used by tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(&self, letter: DeadLetter) {
        log_dead_letter(&letter);
        self.letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(letter);
    }
}
