use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Top-level service error, surfaced by startup code and HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("redis error: {0}")]
    Redis(String),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("internal server error")]
    Internal,
}

impl AppError {
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::BadRequest(_) => 400,
            AppError::NotFound(_) => 404,
            AppError::Registry(RegistryError::Closed) => 503,
            _ => 500,
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(AppError::status_code(self))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(ResponseError::status_code(self)).json(json!({
            "success": false,
            "error": self.to_string(),
        }))
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::Redis(e.to_string())
    }
}

/// Failures of the connection registry control loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The control loop has shut down; no further commands are accepted.
    #[error("connection registry is closed")]
    Closed,
}

/// Failures writing to a single client transport. Always fatal to that session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport write failed: {0}")]
    Write(String),
}

/// Outcome of trying to place one message on a session's outbound queue.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("outbound queue full")]
    Full,

    #[error("session closed")]
    Closed,
}

/// Broker publish/subscribe failures.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker publish failed: {0}")]
    Publish(String),

    #[error("broker subscribe failed: {0}")]
    Subscribe(String),

    #[error("failed to encode broker payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        BrokerError::Connection(e.to_string())
    }
}

/// Why a broker message was not delivered by the bridge.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("shutdown interrupted delivery after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

/// A single routing attempt failed; eligible for retry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("registry unavailable: {0}")]
    Unavailable(#[from] RegistryError),

    #[error("recipient queue full")]
    QueueFull,

    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Presence store failures.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence store error: {0}")]
    Store(String),

    #[error("invalid presence status: {0}")]
    InvalidStatus(String),
}

impl From<redis::RedisError> for PresenceError {
    fn from(e: redis::RedisError) -> Self {
        PresenceError::Store(e.to_string())
    }
}

/// Credential problems reported by an authenticator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credential")]
    MissingToken,

    #[error("invalid credential: {0}")]
    InvalidToken(String),

    #[error("credential expired")]
    Expired,
}

/// Reasons a WebSocket upgrade is refused. Maps onto an HTTP status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("origin not allowed: {0}")]
    Origin(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("rate limited")]
    RateLimited,
}

impl HandshakeError {
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::Origin(_) => StatusCode::FORBIDDEN,
            HandshakeError::Auth(_) => StatusCode::UNAUTHORIZED,
            HandshakeError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            HandshakeError::Origin(_) => "origin",
            HandshakeError::Auth(_) => "auth",
            HandshakeError::RateLimited => "rate_limited",
        }
    }
}

/// Per-message failures while handling an inbound envelope. Never fatal.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Room(#[from] ComposerError),

    #[error(transparent)]
    Presence(#[from] PresenceError),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::UnknownMessageType(_) => "unknown_message_type",
            DispatchError::Malformed(_) => "malformed_message",
            DispatchError::Room(ComposerError::Chat(_)) => "chat_rejected",
            DispatchError::Room(ComposerError::RoomNotFound(_)) => "room_not_found",
            DispatchError::Room(_) | DispatchError::Presence(_) => "room_action_failed",
        }
    }
}

/// Errors reported by the chat-service collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("message exceeds {max} characters")]
    TooLong { max: usize },

    #[error("user {user_id} is not a member of room {room_id}")]
    NotMember { room_id: String, user_id: String },

    #[error("room {0} not found")]
    RoomNotFound(String),

    #[error("chat storage error: {0}")]
    Storage(String),
}

/// Errors from room orchestration.
#[derive(Debug, Error)]
pub enum ComposerError {
    #[error("room {0} not found")]
    RoomNotFound(String),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}
