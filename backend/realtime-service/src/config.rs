use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// Transport and liveness settings for client sessions.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Exact origins, `*`, or prefixes ending in `*`. Empty allows every origin.
    pub allowed_origins: Vec<String>,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
    pub ping_interval: Duration,
    pub dead_timeout: Duration,
    pub sweep_interval: Duration,
    pub read_timeout: Duration,
    pub outbound_queue_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            max_message_size: 64 * 1024,
            ping_interval: Duration::from_secs(30),
            dead_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(60),
            read_timeout: Duration::from_secs(60),
            outbound_queue_size: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupBackend {
    Local,
    Redis,
}

impl FromStr for DedupBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "memory" => Ok(DedupBackend::Local),
            "redis" => Ok(DedupBackend::Redis),
            other => Err(format!("unknown dedup backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub subscribe_pattern: String,
    pub workers: usize,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub dedup_capacity: usize,
    pub dedup_retention: Duration,
    pub dedup_purge_interval: Duration,
    pub dedup_backend: DedupBackend,
    /// Redis list receiving dead letters; `None` logs them only.
    pub dead_letter_key: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            subscribe_pattern: crate::models::NOTIFICATION_PATTERN.to_string(),
            workers: 4,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(100),
            dedup_capacity: 10_000,
            dedup_retention: Duration::from_secs(300),
            dedup_purge_interval: Duration::from_secs(60),
            dedup_backend: DedupBackend::Local,
            dead_letter_key: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub ttl: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub max_message_length: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_length: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub redis: RedisConfig,
    pub websocket: WebSocketConfig,
    pub bridge: BridgeConfig,
    pub presence: PresenceConfig,
    pub chat: ChatConfig,
    pub auth: AuthConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let ws_defaults = WebSocketConfig::default();
        let bridge_defaults = BridgeConfig::default();

        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| AppError::Config("JWT_SECRET missing".into()))?;
        if jwt_secret.trim().is_empty() {
            return Err(AppError::Config("JWT_SECRET must not be empty".into()));
        }

        Ok(Config {
            app: AppConfig {
                env: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
                host: env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("APP_PORT", 8085)?,
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
            },
            websocket: WebSocketConfig {
                allowed_origins: parse_list(&env::var("WS_ALLOWED_ORIGINS").unwrap_or_default()),
                max_message_size: parse_var("WS_MAX_MESSAGE_SIZE", ws_defaults.max_message_size)?,
                ping_interval: secs_var("WS_PING_INTERVAL_SECS", ws_defaults.ping_interval)?,
                dead_timeout: secs_var("WS_DEAD_TIMEOUT_SECS", ws_defaults.dead_timeout)?,
                sweep_interval: secs_var("WS_SWEEP_INTERVAL_SECS", ws_defaults.sweep_interval)?,
                read_timeout: secs_var("WS_READ_TIMEOUT_SECS", ws_defaults.read_timeout)?,
                outbound_queue_size: parse_var(
                    "WS_OUTBOUND_QUEUE_SIZE",
                    ws_defaults.outbound_queue_size,
                )?,
            },
            bridge: BridgeConfig {
                subscribe_pattern: env::var("BRIDGE_SUBSCRIBE_PATTERN")
                    .unwrap_or(bridge_defaults.subscribe_pattern),
                workers: parse_var("BRIDGE_WORKERS", bridge_defaults.workers)?.max(1),
                retry_attempts: parse_var("BRIDGE_RETRY_ATTEMPTS", bridge_defaults.retry_attempts)?
                    .max(1),
                retry_backoff: Duration::from_millis(parse_var(
                    "BRIDGE_RETRY_BACKOFF_MS",
                    bridge_defaults.retry_backoff.as_millis() as u64,
                )?),
                dedup_capacity: parse_var("BRIDGE_DEDUP_CAPACITY", bridge_defaults.dedup_capacity)?,
                dedup_retention: secs_var(
                    "BRIDGE_DEDUP_RETENTION_SECS",
                    bridge_defaults.dedup_retention,
                )?,
                dedup_purge_interval: secs_var(
                    "BRIDGE_DEDUP_PURGE_INTERVAL_SECS",
                    bridge_defaults.dedup_purge_interval,
                )?,
                dedup_backend: parse_var("BRIDGE_DEDUP_BACKEND", bridge_defaults.dedup_backend)?,
                dead_letter_key: env::var("BRIDGE_DEAD_LETTER_KEY")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
            },
            presence: PresenceConfig {
                ttl: secs_var("PRESENCE_TTL_SECS", PresenceConfig::default().ttl)?,
            },
            chat: ChatConfig {
                max_message_length: parse_var(
                    "CHAT_MAX_MESSAGE_LENGTH",
                    ChatConfig::default().max_message_length,
                )?,
            },
            auth: AuthConfig { jwt_secret },
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{name} is invalid: {e}"))),
        _ => Ok(default),
    }
}

/// Whole seconds, at least one.
fn secs_var(name: &str, default: Duration) -> Result<Duration, AppError> {
    match parse_var(name, default.as_secs())? {
        0 => Err(AppError::Config(format!("{name} must be at least 1 second"))),
        secs => Ok(Duration::from_secs(secs)),
    }
}

pub(crate) fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
