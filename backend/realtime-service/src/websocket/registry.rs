use super::session::{run_writer, tick_period, CloseReason, Session, Transport, WriterExit};
use crate::config::WebSocketConfig;
use crate::error::{EnqueueError, RegistryError};
use crate::metrics;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const COMMAND_BUFFER: usize = 1024;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub ping_interval: Duration,
    pub dead_timeout: Duration,
    pub sweep_interval: Duration,
    pub outbound_queue_size: usize,
}

impl From<&WebSocketConfig> for RegistryConfig {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            ping_interval: config.ping_interval,
            dead_timeout: config.dead_timeout,
            sweep_interval: config.sweep_interval,
            outbound_queue_size: config.outbound_queue_size,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from(&WebSocketConfig::default())
    }
}

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub recipients: usize,
    pub delivered: usize,
    pub dropped: usize,
}

impl DeliveryReport {
    fn record(&mut self, result: Result<(), EnqueueError>) {
        self.recipients += 1;
        match result {
            Ok(()) => self.delivered += 1,
            Err(EnqueueError::Full) => {
                self.dropped += 1;
                metrics::record_outbound_dropped("queue_full");
            }
            Err(EnqueueError::Closed) => {
                self.dropped += 1;
                metrics::record_outbound_dropped("session_closed");
            }
        }
    }
}

enum Command {
    Register {
        session: Arc<Session>,
        receiver: mpsc::Receiver<String>,
        transport: Arc<dyn Transport>,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        session: Arc<Session>,
        reason: CloseReason,
        reply: oneshot::Sender<bool>,
    },
    SendToUser {
        user_id: String,
        payload: String,
        reply: oneshot::Sender<DeliveryReport>,
    },
    SendToRole {
        role: String,
        payload: String,
        reply: oneshot::Sender<DeliveryReport>,
    },
    SendToAll {
        payload: String,
        reply: oneshot::Sender<DeliveryReport>,
    },
    Sweep {
        reply: oneshot::Sender<usize>,
    },
}

type SessionMap = Arc<RwLock<HashMap<String, Arc<Session>>>>;

/// Authoritative map of user → live session.
///
/// Every mutation runs on a single control task reached through a command
/// channel; the map itself is only written by that task. Cloning the handle is
/// cheap.
#[derive(Clone)]
pub struct ConnectionRegistry {
    commands: mpsc::Sender<Command>,
    sessions: SessionMap,
    config: Arc<RegistryConfig>,
    cancel: CancellationToken,
}

impl ConnectionRegistry {
    /// Start the control loop. It stops when `shutdown` is called or `parent`
    /// is cancelled, closing every session with [`CloseReason::Shutdown`].
    pub fn spawn(config: RegistryConfig, parent: &CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let config = Arc::new(config);
        let cancel = parent.child_token();

        let control = ControlLoop {
            sessions: sessions.clone(),
            config: config.clone(),
            cancel: cancel.clone(),
            writers: JoinSet::new(),
        };
        let handle = tokio::spawn(control.run(rx));

        (
            Self {
                commands: tx,
                sessions,
                config,
                cancel,
            },
            handle,
        )
    }

    /// Register a new session for `user_id`, replacing any existing one.
    ///
    /// The returned session's writer task is already running.
    pub async fn register(
        &self,
        user_id: &str,
        role: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Session>, RegistryError> {
        if self.cancel.is_cancelled() {
            return Err(RegistryError::Closed);
        }

        let (session, receiver) = Session::new(
            user_id.to_string(),
            role.to_string(),
            self.config.outbound_queue_size,
            &self.cancel,
        );
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Register {
                session: session.clone(),
                receiver,
                transport,
                reply,
            },
            rx,
        )
        .await?;
        Ok(session)
    }

    /// Remove `session` if it is still the user's current one, and close it.
    ///
    /// Returns `true` if the session was removed from the map.
    pub async fn unregister(
        &self,
        session: &Arc<Session>,
        reason: CloseReason,
    ) -> Result<bool, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Unregister {
                session: session.clone(),
                reason,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn lookup(&self, user_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(user_id).cloned()
    }

    pub async fn is_connected(&self, user_id: &str) -> bool {
        self.sessions.read().await.contains_key(user_id)
    }

    /// Deliver to one user. A user without a session yields an empty report.
    pub async fn send_to_user(
        &self,
        user_id: &str,
        payload: String,
    ) -> Result<DeliveryReport, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::SendToUser {
                user_id: user_id.to_string(),
                payload,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn send_to_role(
        &self,
        role: &str,
        payload: String,
    ) -> Result<DeliveryReport, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::SendToRole {
                role: role.to_string(),
                payload,
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn send_to_all(&self, payload: String) -> Result<DeliveryReport, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::SendToAll { payload, reply }, rx).await
    }

    /// Run a liveness sweep immediately. Returns the number of sessions removed.
    pub async fn sweep_now(&self) -> Result<usize, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Sweep { reply }, rx).await
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn connected_user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop the control loop and close every session. Safe to call repeatedly.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn request<T>(
        &self,
        command: Command,
        reply: oneshot::Receiver<T>,
    ) -> Result<T, RegistryError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RegistryError::Closed)?;
        reply.await.map_err(|_| RegistryError::Closed)
    }
}

struct ControlLoop {
    sessions: SessionMap,
    config: Arc<RegistryConfig>,
    cancel: CancellationToken,
    writers: JoinSet<(Arc<Session>, WriterExit)>,
}

impl ControlLoop {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let sweep_every = tick_period(self.config.sweep_interval);
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            ping_interval_secs = self.config.ping_interval.as_secs(),
            dead_timeout_secs = self.config.dead_timeout.as_secs(),
            "connection registry started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    self.sweep().await;
                }
                Some(joined) = self.writers.join_next(), if !self.writers.is_empty() => {
                    match joined {
                        Ok((session, exit)) => self.on_writer_exit(session, exit).await,
                        // Panics are caught inside the task; only aborts land here
                        Err(e) => tracing::warn!(error = %e, "session writer task aborted"),
                    }
                }
            }
        }

        commands.close();
        self.close_all().await;
        tracing::info!("connection registry stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Register {
                session,
                receiver,
                transport,
                reply,
            } => {
                self.register(session, receiver, transport).await;
                let _ = reply.send(());
            }
            Command::Unregister {
                session,
                reason,
                reply,
            } => {
                let removed = self.remove(&session, reason).await;
                let _ = reply.send(removed);
            }
            Command::SendToUser {
                user_id,
                payload,
                reply,
            } => {
                let mut report = DeliveryReport::default();
                match self.sessions.read().await.get(&user_id) {
                    Some(session) => {
                        let result = session.enqueue(payload);
                        if let Err(e) = result {
                            tracing::warn!(user_id = %user_id, session_id = %session.id(), error = %e, "dropping message for user");
                        }
                        report.record(result);
                    }
                    None => {
                        tracing::debug!(user_id = %user_id, "user not connected; message dropped");
                    }
                }
                let _ = reply.send(report);
            }
            Command::SendToRole {
                role,
                payload,
                reply,
            } => {
                let report = self.fan_out(&payload, |s| s.role() == role).await;
                tracing::debug!(role = %role, delivered = report.delivered, dropped = report.dropped, "role fan-out");
                let _ = reply.send(report);
            }
            Command::SendToAll { payload, reply } => {
                let report = self.fan_out(&payload, |_| true).await;
                tracing::debug!(delivered = report.delivered, dropped = report.dropped, "broadcast fan-out");
                let _ = reply.send(report);
            }
            Command::Sweep { reply } => {
                let removed = self.sweep().await;
                let _ = reply.send(removed);
            }
        }
    }

    async fn register(
        &mut self,
        session: Arc<Session>,
        receiver: mpsc::Receiver<String>,
        transport: Arc<dyn Transport>,
    ) {
        let previous = {
            let mut sessions = self.sessions.write().await;
            let previous = sessions.insert(session.user_id().to_string(), session.clone());
            metrics::set_active_sessions(sessions.len());
            previous
        };

        if let Some(previous) = previous {
            tracing::info!(
                user_id = %session.user_id(),
                old_session = %previous.id(),
                new_session = %session.id(),
                "replacing existing session"
            );
            if previous.close(CloseReason::Replaced) {
                metrics::record_session_closed(CloseReason::Replaced.as_str());
            }
        }

        let ping_interval = self.config.ping_interval;
        let writer_session = session.clone();
        self.writers.spawn(async move {
            let writer = run_writer(writer_session.clone(), receiver, transport.clone(), ping_interval);
            let exit = match AssertUnwindSafe(writer).catch_unwind().await {
                Ok(exit) => exit,
                Err(_) => {
                    transport.close(CloseReason::TransportFailure).await;
                    WriterExit::Panicked
                }
            };
            (writer_session, exit)
        });

        tracing::info!(user_id = %session.user_id(), role = %session.role(), session_id = %session.id(), "session registered");
    }

    /// Remove only if the map still points at this exact session; always close it.
    async fn remove(&mut self, session: &Arc<Session>, reason: CloseReason) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let current = sessions
                .get(session.user_id())
                .map(|s| s.id() == session.id())
                .unwrap_or(false);
            if current {
                sessions.remove(session.user_id());
                metrics::set_active_sessions(sessions.len());
            }
            current
        };

        if session.close(reason) {
            metrics::record_session_closed(reason.as_str());
            tracing::info!(
                user_id = %session.user_id(),
                session_id = %session.id(),
                reason = reason.as_str(),
                "session closed"
            );
        }
        removed
    }

    async fn fan_out<F>(&self, payload: &str, mut matches: F) -> DeliveryReport
    where
        F: FnMut(&Session) -> bool,
    {
        let mut report = DeliveryReport::default();
        for session in self.sessions.read().await.values() {
            if !matches(session) {
                continue;
            }
            let result = session.enqueue(payload.to_string());
            if let Err(e) = result {
                tracing::warn!(user_id = %session.user_id(), error = %e, "dropping fan-out message");
            }
            report.record(result);
        }
        report
    }

    async fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let dead_timeout = self.config.dead_timeout;
        let stale: Vec<Arc<Session>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.idle_for(now) > dead_timeout)
            .cloned()
            .collect();

        let mut removed = 0;
        for session in stale {
            tracing::warn!(
                user_id = %session.user_id(),
                session_id = %session.id(),
                idle_secs = session.idle_for(now).as_secs(),
                "session missed liveness deadline"
            );
            if self.remove(&session, CloseReason::LivenessTimeout).await {
                removed += 1;
            }
        }
        removed
    }

    async fn on_writer_exit(&mut self, session: Arc<Session>, exit: WriterExit) {
        match exit {
            WriterExit::TransportFailed(e) => {
                tracing::warn!(user_id = %session.user_id(), session_id = %session.id(), error = %e, "session transport failed");
                self.remove(&session, CloseReason::TransportFailure).await;
            }
            WriterExit::Closed(reason) => {
                self.remove(&session, reason).await;
            }
            WriterExit::Panicked => {
                tracing::error!(user_id = %session.user_id(), session_id = %session.id(), "session writer panicked");
                self.remove(&session, CloseReason::TransportFailure).await;
                session.mark_closed();
            }
        }
    }

    async fn close_all(&mut self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let drained = sessions.drain().map(|(_, s)| s).collect();
            metrics::set_active_sessions(0);
            drained
        };

        for session in &drained {
            if session.close(CloseReason::Shutdown) {
                metrics::record_session_closed(CloseReason::Shutdown.as_str());
            }
        }

        let writers = &mut self.writers;
        let drain = async { while writers.join_next().await.is_some() {} };
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, drain).await.is_err() {
            tracing::warn!("timed out waiting for session writers; aborting");
            self.writers.abort_all();
        }
        tracing::info!(closed = drained.len(), "closed all sessions");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::websocket::SessionState;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Panics on the first write, as a buggy transport would.
    struct PanickingTransport;

    #[async_trait]
    impl Transport for PanickingTransport {
        async fn send_text(&self, _text: String) -> Result<(), TransportError> {
            panic!("transport bug");
        }

        async fn ping(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self, _reason: CloseReason) {}
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<String>>,
        closed: Mutex<Option<CloseReason>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_text(&self, text: String) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn ping(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self, reason: CloseReason) {
            *self.closed.lock().unwrap() = Some(reason);
        }
    }

    fn spawn_registry() -> (ConnectionRegistry, JoinHandle<()>, CancellationToken) {
        let root = CancellationToken::new();
        let (registry, handle) = ConnectionRegistry::spawn(RegistryConfig::default(), &root);
        (registry, handle, root)
    }

    #[tokio::test]
    async fn second_registration_replaces_first() {
        let (registry, _handle, _root) = spawn_registry();
        let first_transport = Arc::new(RecordingTransport::default());
        let second_transport = Arc::new(RecordingTransport::default());

        let first = registry.register("u1", "student", first_transport.clone()).await.unwrap();
        let second = registry.register("u1", "student", second_transport.clone()).await.unwrap();

        assert_eq!(registry.session_count().await, 1);
        assert_eq!(registry.lookup("u1").await.unwrap().id(), second.id());
        assert!(first.is_closed());
        assert_eq!(first.close_reason(), Some(CloseReason::Replaced));
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn stale_unregister_keeps_newer_session() {
        let (registry, _handle, _root) = spawn_registry();
        let first = registry
            .register("u1", "student", Arc::new(RecordingTransport::default()))
            .await
            .unwrap();
        let second = registry
            .register("u1", "student", Arc::new(RecordingTransport::default()))
            .await
            .unwrap();

        assert!(!registry.unregister(&first, CloseReason::Normal).await.unwrap());
        assert_eq!(registry.lookup("u1").await.unwrap().id(), second.id());

        assert!(registry.unregister(&second, CloseReason::Normal).await.unwrap());
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn send_to_missing_user_is_a_noop() {
        let (registry, _handle, _root) = spawn_registry();
        let report = registry.send_to_user("ghost", "{}".into()).await.unwrap();
        assert_eq!(report, DeliveryReport::default());
    }

    #[tokio::test]
    async fn role_fan_out_only_reaches_matching_sessions() {
        let (registry, _handle, _root) = spawn_registry();
        registry
            .register("t1", "teacher", Arc::new(RecordingTransport::default()))
            .await
            .unwrap();
        registry
            .register("s1", "student", Arc::new(RecordingTransport::default()))
            .await
            .unwrap();
        registry
            .register("s2", "student", Arc::new(RecordingTransport::default()))
            .await
            .unwrap();

        let report = registry.send_to_role("student", "hello".into()).await.unwrap();
        assert_eq!(report.recipients, 2);
        assert_eq!(report.delivered, 2);

        let report = registry.send_to_all("all".into()).await.unwrap();
        assert_eq!(report.recipients, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_session_is_swept() {
        let (registry, _handle, _root) = spawn_registry();
        let transport = Arc::new(RecordingTransport::default());
        let session = registry.register("u1", "student", transport.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(150)).await;

        assert!(registry.lookup("u1").await.is_none());
        assert_eq!(session.close_reason(), Some(CloseReason::LivenessTimeout));
    }

    #[tokio::test]
    async fn zero_intervals_are_clamped_instead_of_killing_the_loop() {
        let root = CancellationToken::new();
        let config = RegistryConfig {
            ping_interval: Duration::ZERO,
            sweep_interval: Duration::ZERO,
            ..RegistryConfig::default()
        };
        let (registry, handle) = ConnectionRegistry::spawn(config, &root);
        let transport = Arc::new(RecordingTransport::default());
        registry.register("u1", "student", transport.clone()).await.unwrap();

        let report = registry.send_to_user("u1", "hello".into()).await.unwrap();
        assert_eq!(report.delivered, 1);
        for _ in 0..100 {
            if !transport.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*transport.sent.lock().unwrap(), vec!["hello".to_string()]);
        assert!(!handle.is_finished());
        assert!(registry.is_connected("u1").await);
    }

    #[tokio::test]
    async fn panicking_writer_unregisters_its_session() {
        let (registry, handle, _root) = spawn_registry();
        let session = registry
            .register("u1", "student", Arc::new(PanickingTransport))
            .await
            .unwrap();

        registry.send_to_user("u1", "boom".into()).await.unwrap();
        for _ in 0..100 {
            if !registry.is_connected("u1").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(!registry.is_connected("u1").await);
        assert_eq!(session.close_reason(), Some(CloseReason::TransportFailure));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!handle.is_finished());

        // The user can reconnect afterwards
        let transport = Arc::new(RecordingTransport::default());
        registry.register("u1", "student", transport).await.unwrap();
        assert!(registry.is_connected("u1").await);
    }

    #[tokio::test]
    async fn shutdown_closes_sessions_and_rejects_commands() {
        let (registry, handle, _root) = spawn_registry();
        let transport = Arc::new(RecordingTransport::default());
        let session = registry.register("u1", "student", transport.clone()).await.unwrap();

        registry.shutdown();
        registry.shutdown();
        handle.await.unwrap();

        assert_eq!(session.close_reason(), Some(CloseReason::Shutdown));
        assert_eq!(*transport.closed.lock().unwrap(), Some(CloseReason::Shutdown));
        assert_eq!(
            registry.send_to_all("x".into()).await,
            Err(RegistryError::Closed)
        );
    }
}
