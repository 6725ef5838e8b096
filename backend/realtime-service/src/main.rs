use actix_web::{middleware, web, App, HttpServer};
use realtime_service::{
    config::{Config, DedupBackend},
    handlers, logging, metrics, shutdown,
    services::{
        Broker, DeadLetterSink, Deduplicator, InMemoryChatService, LocalDeduplicator,
        LogDeadLetterSink, MessageBridge, PresenceTracker, RedisBroker, RedisDeadLetterSink,
        RedisDeduplicator, RedisPresenceStore, RoomEventComposer, AllowAllRateLimiter,
        JwtAuthenticator,
    },
    websocket::{ConnectionRegistry, RegistryConfig},
    AppState,
};
use redis_utils::RedisPool;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DEAD_LETTER_MAX_LEN: usize = 10_000;

#[actix_web::main]
async fn main() -> io::Result<()> {
    logging::init_tracing();
    tracing::info!("Starting realtime service");

    let config = Config::from_env().map_err(|e| {
        tracing::error!(error = %e, "invalid configuration");
        io::Error::new(io::ErrorKind::Other, e.to_string())
    })?;

    let redis = RedisPool::connect(&config.redis.url).await.map_err(|e| {
        tracing::error!(error = %e, "failed to connect to Redis");
        io::Error::new(io::ErrorKind::Other, format!("Redis connection failed: {e}"))
    })?;

    let root = CancellationToken::new();

    let (registry, registry_task) =
        ConnectionRegistry::spawn(RegistryConfig::from(&config.websocket), &root);

    let broker: Arc<dyn Broker> = Arc::new(RedisBroker::new(redis.client(), redis.manager()));

    let presence = PresenceTracker::new(
        Arc::new(RedisPresenceStore::new(redis.manager())),
        config.presence.ttl,
    );
    let chat = Arc::new(InMemoryChatService::new(config.chat.max_message_length));
    let composer = RoomEventComposer::new(presence, chat.clone(), chat, broker.clone());

    let dedup: Arc<dyn Deduplicator> = match config.bridge.dedup_backend {
        DedupBackend::Local => Arc::new(LocalDeduplicator::new(
            config.bridge.dedup_capacity,
            config.bridge.dedup_retention,
        )),
        DedupBackend::Redis => Arc::new(RedisDeduplicator::new(
            redis.manager(),
            config.bridge.dedup_retention,
        )),
    };
    let dead_letters: Arc<dyn DeadLetterSink> = match &config.bridge.dead_letter_key {
        Some(key) => Arc::new(RedisDeadLetterSink::new(
            redis.manager(),
            key.clone(),
            DEAD_LETTER_MAX_LEN,
        )),
        None => Arc::new(LogDeadLetterSink),
    };

    let bridge = Arc::new(MessageBridge::new(
        config.bridge.clone(),
        Arc::new(registry.clone()),
        dedup,
        dead_letters,
    ));
    let bridge_task = tokio::spawn(bridge.run(broker, root.child_token()));

    let state = AppState {
        registry: registry.clone(),
        composer,
        authenticator: Arc::new(JwtAuthenticator::new(&config.auth.jwt_secret)),
        rate_limiter: Arc::new(AllowAllRateLimiter),
        websocket: Arc::new(config.websocket.clone()),
    };

    let addr = (config.app.host.clone(), config.app.port);
    tracing::info!(host = %addr.0, port = addr.1, env = %config.app.env, "Starting HTTP server");

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(middleware::Logger::default())
            .wrap(metrics::MetricsMiddleware)
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .configure(handlers::configure)
    })
    .bind(addr)?
    .disable_signals()
    .run();

    let server_handle = server.handle();
    let mut server_task = actix_web::rt::spawn(server);
    let mut registry_task = Some(registry_task);

    let signal = shutdown::shutdown_signal();
    tokio::pin!(signal);

    let result = tokio::select! {
        joined = &mut server_task => flatten(joined),
        _ = &mut signal => {
            tracing::info!("Shutdown signal received");
            if let Some(task) = registry_task.take() {
                shutdown::close_sessions_then_stop(&root, task, server_handle).await;
            }
            flatten(server_task.await)
        }
    };

    tracing::info!("HTTP server stopped; shutting down realtime components");
    root.cancel();

    let drain = async {
        if let Err(e) = bridge_task.await {
            tracing::error!(error = %e, "bridge task failed");
        }
        if let Some(task) = registry_task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "registry task failed");
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!("timed out waiting for realtime components to stop");
    }

    result
}

fn flatten(joined: Result<io::Result<()>, tokio::task::JoinError>) -> io::Result<()> {
    joined.unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e.to_string())))
}
