/// Pub/sub broker abstraction plus Redis and in-process implementations
use crate::error::BrokerError;
use crate::models::{ChannelName, NotificationEnvelope};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::AsyncCommands;
use redis_utils::SharedConnectionManager;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// One message received from a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

pub type BrokerStream = BoxStream<'static, BrokerMessage>;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError>;

    /// Subscribe to every channel matching a glob `pattern` (`*` and `?`).
    ///
    /// The stream ends when the underlying subscription is lost.
    async fn psubscribe(&self, pattern: &str) -> Result<BrokerStream, BrokerError>;
}

/// Redis PUBLISH / PSUBSCRIBE.
///
/// Publishing goes through the shared connection manager; each subscription
/// opens its own dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    publisher: SharedConnectionManager,
}

impl RedisBroker {
    pub fn new(client: redis::Client, publisher: SharedConnectionManager) -> Self {
        Self { client, publisher }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let result: redis::RedisResult<i64> = redis_utils::with_timeout(async {
            let mut conn = self.publisher.lock().await;
            conn.publish(channel, payload).await
        })
        .await;

        match result {
            Ok(receivers) => {
                tracing::trace!(channel = %channel, receivers, "published");
                Ok(())
            }
            Err(e) => Err(BrokerError::Publish(e.to_string())),
        }
    }

    async fn psubscribe(&self, pattern: &str) -> Result<BrokerStream, BrokerError> {
        // PubSub requires a dedicated connection, not the multiplexed one
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        pubsub
            .psubscribe(pattern)
            .await
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        tracing::info!(pattern = %pattern, "redis pattern subscription established");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BrokerMessage { channel, payload }),
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "skipping non-text pub/sub payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// In-process broker for tests and single-node development.
///
/// Keeps the most recent published messages so tests can assert on them.
pub struct MemoryBroker {
    sender: broadcast::Sender<BrokerMessage>,
    history: Mutex<VecDeque<BrokerMessage>>,
    history_limit: usize,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            history_limit: capacity,
        }
    }

    /// Messages published so far, oldest first.
    pub fn published(&self) -> Vec<BrokerMessage> {
        self.history_guard().iter().cloned().collect()
    }

    /// Messages published on exactly `channel`.
    pub fn published_on(&self, channel: &str) -> Vec<BrokerMessage> {
        self.history_guard()
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }

    /// Live subscriptions, across all patterns.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn clear_history(&self) {
        self.history_guard().clear();
    }

    fn history_guard(&self) -> std::sync::MutexGuard<'_, VecDeque<BrokerMessage>> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BrokerError> {
        let message = BrokerMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };

        {
            let mut history = self.history_guard();
            if history.len() >= self.history_limit {
                history.pop_front();
            }
            history.push_back(message.clone());
        }

        // No subscribers is not an error for pub/sub
        let _ = self.sender.send(message);
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<BrokerStream, BrokerError> {
        let pattern = pattern.to_string();
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |item| {
            let matched = match item {
                Ok(message) if glob_match(&pattern, &message.channel) => Some(message),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "memory broker subscriber lagged");
                    None
                }
            };
            async move { matched }
        });
        Ok(stream.boxed())
    }
}

/// Redis-style glob match supporting `*` and `?`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Publishes notification envelopes onto the channel convention.
#[derive(Clone)]
pub struct NotificationPublisher {
    broker: Arc<dyn Broker>,
}

impl NotificationPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    pub async fn publish(
        &self,
        channel: &ChannelName,
        envelope: &NotificationEnvelope,
    ) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(envelope)?;
        self.broker.publish(&channel.to_string(), &payload).await
    }

    pub async fn to_user(&self, envelope: &NotificationEnvelope) -> Result<(), BrokerError> {
        self.publish(&ChannelName::user(envelope.user_id.clone()), envelope)
            .await
    }

    pub async fn to_role(
        &self,
        role: &str,
        envelope: &NotificationEnvelope,
    ) -> Result<(), BrokerError> {
        self.publish(&ChannelName::role(role), envelope).await
    }

    pub async fn to_system(&self, envelope: &NotificationEnvelope) -> Result<(), BrokerError> {
        self.publish(&ChannelName::System, envelope).await
    }
}
