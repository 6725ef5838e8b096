#![allow(dead_code)]

use async_trait::async_trait;
use realtime_service::config::WebSocketConfig;
use realtime_service::error::{AuthError, TransportError};
use realtime_service::models::Identity;
use realtime_service::services::{
    AllowAllRateLimiter, Authenticator, InMemoryChatService, MemoryBroker, MemoryPresenceStore,
    PresenceTracker, RoomEventComposer,
};
use realtime_service::websocket::{CloseReason, ConnectionRegistry, RegistryConfig, Transport};
use realtime_service::AppState;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Transport that records frames instead of writing to a socket.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<String>>,
    pub pings: Mutex<usize>,
    pub closed: Mutex<Option<CloseReason>>,
    pub fail_writes: Mutex<bool>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn closed_with(&self) -> Option<CloseReason> {
        *self.closed.lock().unwrap()
    }

    pub fn break_writes(&self) {
        *self.fail_writes.lock().unwrap() = true;
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if *self.fail_writes.lock().unwrap() {
            return Err(TransportError::Write("broken pipe".into()));
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        *self.pings.lock().unwrap() += 1;
        Ok(())
    }

    async fn close(&self, reason: CloseReason) {
        *self.closed.lock().unwrap() = Some(reason);
    }
}

/// Accepts tokens of the form `user_id:role`.
pub struct StaticAuthenticator;

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn validate_token(&self, token: &str) -> Result<Identity, AuthError> {
        match token.split_once(':') {
            Some((user, role)) if !user.is_empty() => Ok(Identity::new(user, role)),
            _ => Err(AuthError::InvalidToken("expected user:role".into())),
        }
    }
}

pub fn spawn_registry(config: RegistryConfig) -> (ConnectionRegistry, JoinHandle<()>, CancellationToken) {
    let root = CancellationToken::new();
    let (registry, handle) = ConnectionRegistry::spawn(config, &root);
    (registry, handle, root)
}

pub struct Fixture {
    pub registry: ConnectionRegistry,
    pub broker: Arc<MemoryBroker>,
    pub chat: Arc<InMemoryChatService>,
    pub composer: RoomEventComposer,
    pub root: CancellationToken,
    pub registry_task: Option<JoinHandle<()>>,
}

impl Fixture {
    pub async fn new(presence_ttl: Duration, max_message_length: usize) -> Self {
        let (registry, registry_task, root) = spawn_registry(RegistryConfig::default());
        let broker = Arc::new(MemoryBroker::default());
        let chat = Arc::new(InMemoryChatService::new(max_message_length));
        let presence = PresenceTracker::new(Arc::new(MemoryPresenceStore::new()), presence_ttl);
        let composer = RoomEventComposer::new(presence, chat.clone(), chat.clone(), broker.clone());
        Self {
            registry,
            broker,
            chat,
            composer,
            root,
            registry_task: Some(registry_task),
        }
    }

    pub fn app_state(&self, websocket: WebSocketConfig) -> AppState {
        AppState {
            registry: self.registry.clone(),
            composer: self.composer.clone(),
            authenticator: Arc::new(StaticAuthenticator),
            rate_limiter: Arc::new(AllowAllRateLimiter),
            websocket: Arc::new(websocket),
        }
    }
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
