pub mod auth;
pub mod bridge;
pub mod broker;
pub mod chat;
pub mod dead_letter;
pub mod dedup;
pub mod presence;
pub mod rate_limit;
pub mod room_events;

pub use auth::{Authenticator, JwtAuthenticator};
pub use bridge::{MessageBridge, NotificationSink, Processed, RetryPolicy};
pub use broker::{Broker, BrokerMessage, MemoryBroker, NotificationPublisher, RedisBroker};
pub use chat::{ChatMessage, ChatService, InMemoryChatService, RoomRepository};
pub use dead_letter::{
    DeadLetter, DeadLetterSink, LogDeadLetterSink, MemoryDeadLetterSink, RedisDeadLetterSink,
};
pub use dedup::{Deduplicator, LocalDeduplicator, RedisDeduplicator};
pub use presence::{MemoryPresenceStore, PresenceStore, PresenceTracker, RedisPresenceStore};
pub use rate_limit::{AllowAllRateLimiter, RateLimiter};
pub use room_events::{RoomEvent, RoomEventComposer};
