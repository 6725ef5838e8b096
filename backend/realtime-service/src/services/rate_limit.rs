use crate::models::Identity;
use async_trait::async_trait;

/// Hook consulted once per handshake, after authentication.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// `true` admits the connection.
    async fn allow(&self, identity: &Identity, remote_addr: Option<&str>) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllRateLimiter;

#[async_trait]
impl RateLimiter for AllowAllRateLimiter {
    async fn allow(&self, _identity: &Identity, _remote_addr: Option<&str>) -> bool {
        true
    }
}
