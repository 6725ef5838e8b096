/// Message bridge: broker pattern subscription -> connection registry
///
/// Pipeline per broker message:
/// 1. Classify the channel (user / role / system)
/// 2. Deserialize and validate the notification envelope
/// 3. Deduplicate by envelope id
/// 4. Wrap in the client wire envelope with receipt metadata
/// 5. Route through the registry with linear-backoff retry
/// 6. Dead-letter on exhaustion
use super::broker::{Broker, BrokerMessage};
use super::dead_letter::{DeadLetter, DeadLetterSink};
use super::dedup::Deduplicator;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, DeliveryError};
use crate::metrics;
use crate::models::{ChannelName, NotificationEnvelope};
use crate::websocket::session::tick_period;
use crate::websocket::{ConnectionRegistry, DeliveryReport, OutboundEnvelope};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const WORKER_QUEUE_SIZE: usize = 1024;
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(2);

/// Where the bridge hands routed notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(
        &self,
        channel: &ChannelName,
        payload: String,
    ) -> Result<DeliveryReport, DeliveryError>;
}

#[async_trait]
impl NotificationSink for ConnectionRegistry {
    async fn deliver(
        &self,
        channel: &ChannelName,
        payload: String,
    ) -> Result<DeliveryReport, DeliveryError> {
        match channel {
            ChannelName::User(user_id) => {
                let report = self.send_to_user(user_id, payload).await?;
                if report.dropped > 0 {
                    return Err(DeliveryError::QueueFull);
                }
                Ok(report)
            }
            // Fan-outs are best-effort per recipient and never retried
            ChannelName::Role(role) => Ok(self.send_to_role(role, payload).await?),
            ChannelName::System => Ok(self.send_to_all(payload).await?),
        }
    }
}

/// Linear backoff: the wait after attempt `n` is `n × backoff_unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl From<&BridgeConfig> for RetryPolicy {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            backoff_unit: config.retry_backoff,
        }
    }
}

/// What happened to one broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Processed {
    Delivered(DeliveryReport),
    Duplicate,
}

pub struct MessageBridge {
    sink: Arc<dyn NotificationSink>,
    dedup: Arc<dyn Deduplicator>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
    config: BridgeConfig,
    sequence: AtomicU64,
}

impl MessageBridge {
    pub fn new(
        config: BridgeConfig,
        sink: Arc<dyn NotificationSink>,
        dedup: Arc<dyn Deduplicator>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            retry: RetryPolicy::from(&config),
            config,
            sink,
            dedup,
            dead_letters,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run one broker message through the full pipeline.
    pub async fn process(&self, message: &BrokerMessage) -> Result<Processed, BridgeError> {
        self.process_until(message, &CancellationToken::new()).await
    }

    /// Like [`process`](Self::process), but a retry backoff ends early when
    /// `cancel` fires. The envelope is then dead-lettered.
    pub async fn process_until(
        &self,
        message: &BrokerMessage,
        cancel: &CancellationToken,
    ) -> Result<Processed, BridgeError> {
        let result = self.process_inner(message, cancel).await;
        let outcome = match &result {
            Ok(Processed::Delivered(_)) => "delivered",
            Ok(Processed::Duplicate) => "duplicate",
            Err(BridgeError::MalformedEnvelope(_)) => "malformed",
            Err(BridgeError::ValidationError(_)) => "invalid",
            Err(BridgeError::RetryExhausted { .. }) => "dead_lettered",
            Err(BridgeError::Cancelled { .. }) => "cancelled",
        };
        metrics::record_bridge_outcome(outcome);
        result
    }

    async fn process_inner(
        &self,
        message: &BrokerMessage,
        cancel: &CancellationToken,
    ) -> Result<Processed, BridgeError> {
        let channel = ChannelName::parse(&message.channel).ok_or_else(|| {
            BridgeError::ValidationError(format!("unrecognised channel {}", message.channel))
        })?;

        let envelope: NotificationEnvelope = serde_json::from_str(&message.payload)
            .map_err(|e| BridgeError::MalformedEnvelope(e.to_string()))?;

        validate(&channel, &envelope)?;

        if !self.dedup.first_seen(&envelope.id).await {
            tracing::debug!(envelope_id = %envelope.id, channel = %message.channel, "duplicate envelope skipped");
            return Ok(Processed::Duplicate);
        }

        let wire = self.wrap(&channel, &envelope)?;
        self.route(&channel, &envelope, message, wire, cancel).await
    }

    fn wrap(
        &self,
        channel: &ChannelName,
        envelope: &NotificationEnvelope,
    ) -> Result<String, BridgeError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        OutboundEnvelope::success(
            "notification",
            Some(json!({
                "notification": envelope,
                "channel": channel.to_string(),
                "received_at": Utc::now(),
                "sequence": sequence,
            })),
        )
        .to_json()
        .map_err(|e| BridgeError::MalformedEnvelope(e.to_string()))
    }

    async fn route(
        &self,
        channel: &ChannelName,
        envelope: &NotificationEnvelope,
        message: &BrokerMessage,
        wire: String,
        cancel: &CancellationToken,
    ) -> Result<Processed, BridgeError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sink.deliver(channel, wire.clone()).await {
                Ok(report) => {
                    tracing::debug!(
                        envelope_id = %envelope.id,
                        channel = %channel,
                        attempt,
                        delivered = report.delivered,
                        "notification routed"
                    );
                    return Ok(Processed::Delivered(report));
                }
                Err(e) if self.retry.should_retry(attempt) => {
                    let backoff = self.retry.backoff(attempt);
                    tracing::warn!(
                        envelope_id = %envelope.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "delivery failed; retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.dead_letter(channel, envelope, message, attempt, &e).await;
                            return Err(BridgeError::Cancelled { attempts: attempt });
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    self.dead_letter(channel, envelope, message, attempt, &e).await;
                    return Err(BridgeError::RetryExhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        channel: &ChannelName,
        envelope: &NotificationEnvelope,
        message: &BrokerMessage,
        attempts: u32,
        error: &DeliveryError,
    ) {
        metrics::record_dead_letter(channel.kind().as_str());
        self.dead_letters
            .record(DeadLetter {
                envelope_id: envelope.id.clone(),
                channel: message.channel.clone(),
                payload: message.payload.clone(),
                attempts,
                error: error.to_string(),
                recorded_at: Utc::now(),
            })
            .await;
    }

    /// Subscribe and process until `cancel` fires.
    ///
    /// Messages are sharded across workers by channel so each user's
    /// notifications stay in order. A lost subscription is re-established.
    pub async fn run(self: Arc<Self>, broker: Arc<dyn Broker>, cancel: CancellationToken) {
        let workers = self.config.workers.max(1);
        let mut tasks = JoinSet::new();
        let mut queues = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_SIZE);
            queues.push(tx);
            tasks.spawn(self.clone().worker(worker_id, rx, cancel.clone()));
        }
        tasks.spawn(self.clone().purge_loop(cancel.clone()));

        tracing::info!(pattern = %self.config.subscribe_pattern, workers, "message bridge started");

        while !cancel.is_cancelled() {
            let mut stream = match broker.psubscribe(&self.config.subscribe_pattern).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "bridge subscription failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                    }
                }
            };

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(message) => {
                            let shard = shard_for(&message.channel, workers);
                            if queues[shard].send(message).await.is_err() {
                                tracing::error!(shard, "bridge worker stopped unexpectedly");
                            }
                        }
                        None => {
                            tracing::warn!("bridge subscription ended; resubscribing");
                            break;
                        }
                    },
                }
            }

            if !cancel.is_cancelled() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                }
            }
        }

        drop(queues);
        while tasks.join_next().await.is_some() {}
        tracing::info!("message bridge stopped");
    }

    async fn worker(
        self: Arc<Self>,
        worker_id: usize,
        mut queue: mpsc::Receiver<BrokerMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = queue.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match self.process_until(&message, &cancel).await {
                Ok(_) => {}
                Err(BridgeError::RetryExhausted { .. } | BridgeError::Cancelled { .. }) => {}
                Err(e) => {
                    tracing::warn!(worker_id, channel = %message.channel, error = %e, "dropping broker message");
                }
            }
        }
        tracing::debug!(worker_id, "bridge worker stopped");
    }

    async fn purge_loop(self: Arc<Self>, cancel: CancellationToken) {
        let every = tick_period(self.config.dedup_purge_interval);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.dedup.purge_expired().await;
                    if removed > 0 {
                        tracing::debug!(removed, "purged expired dedup entries");
                    }
                }
            }
        }
    }
}

fn validate(channel: &ChannelName, envelope: &NotificationEnvelope) -> Result<(), BridgeError> {
    if envelope.id.trim().is_empty() {
        return Err(BridgeError::ValidationError("missing id".into()));
    }
    if envelope.notification_type.trim().is_empty() {
        return Err(BridgeError::ValidationError("missing type".into()));
    }
    if envelope.title.trim().is_empty() {
        return Err(BridgeError::ValidationError("missing title".into()));
    }
    if let ChannelName::User(user_id) = channel {
        if envelope.user_id.is_empty() {
            return Err(BridgeError::ValidationError("missing user_id".into()));
        }
        if envelope.user_id != *user_id {
            return Err(BridgeError::ValidationError(format!(
                "user_id {} does not match channel user {}",
                envelope.user_id, user_id
            )));
        }
    }
    if envelope.is_expired(Utc::now()) {
        return Err(BridgeError::ValidationError("notification expired".into()));
    }
    Ok(())
}

fn shard_for(channel: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    channel.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}
