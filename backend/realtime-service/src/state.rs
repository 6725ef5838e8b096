use crate::config::WebSocketConfig;
use crate::services::{Authenticator, PresenceTracker, RateLimiter, RoomEventComposer};
use crate::websocket::ConnectionRegistry;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub composer: RoomEventComposer,
    pub authenticator: Arc<dyn Authenticator>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub websocket: Arc<WebSocketConfig>,
}

impl AppState {
    pub fn presence(&self) -> &PresenceTracker {
        self.composer.presence()
    }
}
