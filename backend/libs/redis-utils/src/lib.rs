use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, IntoConnectionInfo, RedisError, RedisResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::{info, warn};

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

/// Upper bound applied by [`with_timeout`] to a single Redis round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Redis connection pool.
///
/// Keeps the originating [`Client`] next to the multiplexed connection manager
/// because pub/sub needs a dedicated connection that cannot be multiplexed.
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    manager: SharedConnectionManager,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let info = redis_url
            .into_connection_info()
            .context("failed to parse REDIS_URL connection string")?;
        let label = format!("{:?}", info.addr);

        let client = Client::open(info).context("failed to construct Redis client")?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .context("failed to initialize Redis connection manager")?;

        info!(addr = %label, "Redis connection manager ready");

        Ok(Self {
            client,
            manager: Arc::new(Mutex::new(manager)),
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

/// Run a Redis operation bounded by [`DEFAULT_COMMAND_TIMEOUT`].
///
/// A timeout surfaces as an `IoError` so callers handle it like any other
/// connection failure.
pub async fn with_timeout<F, T>(future: F) -> RedisResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    with_custom_timeout(DEFAULT_COMMAND_TIMEOUT, future).await
}

pub async fn with_custom_timeout<F, T>(limit: Duration, future: F) -> RedisResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_ms = limit.as_millis() as u64, "Redis command timed out");
            Err(RedisError::from((
                ErrorKind::IoError,
                "redis command timed out",
            )))
        }
    }
}
