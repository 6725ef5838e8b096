/// Client session state and its outbound writer task
use super::OutboundEnvelope;
use crate::error::{EnqueueError, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub type SessionId = Uuid;

/// Floor for every periodic timer; tokio intervals panic on a zero period.
pub(crate) const MIN_TICK: Duration = Duration::from_secs(1);

pub(crate) fn tick_period(period: Duration) -> Duration {
    period.max(MIN_TICK)
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Client disconnected or the handler finished normally.
    Normal,
    /// A newer session for the same user took over.
    Replaced,
    /// No liveness response within the dead timeout.
    LivenessTimeout,
    /// A read or write on the transport failed.
    TransportFailure,
    /// Process-wide shutdown.
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::Replaced => "replaced",
            CloseReason::LivenessTimeout => "liveness_timeout",
            CloseReason::TransportFailure => "transport_failure",
            CloseReason::Shutdown => "shutdown",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CloseReason::Normal => "session closed",
            CloseReason::Replaced => "session replaced by a newer connection",
            CloseReason::LivenessTimeout => "heartbeat timeout",
            CloseReason::TransportFailure => "transport failure",
            CloseReason::Shutdown => "server shutting down",
        }
    }
}

/// Lifecycle of a session.
///
/// `Connecting` and `Authenticated` happen in the handshake before a
/// [`Session`] exists; a registered session starts at `Registered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Registered,
    Active,
    Disconnecting,
    Closed,
}

/// Byte-level connection to one client, driven by the session writer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Liveness probe; the answer arrives through [`Session::touch`].
    async fn ping(&self) -> Result<(), TransportError>;

    async fn close(&self, reason: CloseReason);
}

/// One live client connection owned by the registry.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    user_id: String,
    role: String,
    connected_at: DateTime<Utc>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    last_heartbeat: Mutex<Instant>,
    state: Mutex<SessionState>,
    close_reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Session {
    /// Create a session with a bounded outbound queue.
    ///
    /// The session's cancellation token is a child of `parent`, so cancelling
    /// the registry tears every session down with it.
    pub(crate) fn new(
        user_id: String,
        role: String,
        queue_capacity: usize,
        parent: &CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            user_id,
            role,
            connected_at: Utc::now(),
            outbound: Mutex::new(Some(tx)),
            last_heartbeat: Mutex::new(Instant::now()),
            state: Mutex::new(SessionState::Registered),
            close_reason: Mutex::new(None),
            cancel: parent.child_token(),
        });
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn state(&self) -> SessionState {
        *guard(&self.state)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *guard(&self.close_reason)
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when this session closes.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Place a frame on the outbound queue without waiting.
    ///
    /// A full queue drops the frame; delivery is best-effort.
    pub fn enqueue(&self, text: String) -> Result<(), EnqueueError> {
        let outbound = guard(&self.outbound);
        let Some(sender) = outbound.as_ref() else {
            return Err(EnqueueError::Closed);
        };

        match sender.try_send(text) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(EnqueueError::Full),
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    pub fn send_envelope(&self, envelope: &OutboundEnvelope) -> Result<(), EnqueueError> {
        match envelope.to_json() {
            Ok(text) => self.enqueue(text),
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "failed to encode outbound envelope");
                Err(EnqueueError::Closed)
            }
        }
    }

    /// Record a liveness response (pong or any inbound frame).
    pub fn touch(&self) {
        *guard(&self.last_heartbeat) = Instant::now();
        let mut state = guard(&self.state);
        if *state == SessionState::Registered {
            *state = SessionState::Active;
        }
    }

    pub fn last_heartbeat(&self) -> Instant {
        *guard(&self.last_heartbeat)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat())
    }

    /// Close the outbound queue and cancel the session's tasks.
    ///
    /// Returns `false` if the session was already closing.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut close_reason = guard(&self.close_reason);
            if close_reason.is_some() {
                return false;
            }
            *close_reason = Some(reason);
        }

        guard(&self.outbound).take();
        {
            let mut state = guard(&self.state);
            if *state != SessionState::Closed {
                *state = SessionState::Disconnecting;
            }
        }
        self.cancel.cancel();
        true
    }

    pub(crate) fn mark_closed(&self) {
        *guard(&self.state) = SessionState::Closed;
    }
}

/// How a writer task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WriterExit {
    Closed(CloseReason),
    TransportFailed(TransportError),
    /// The writer future panicked; the transport was closed by the supervisor.
    Panicked,
}

/// Drain the session queue to the transport and probe liveness.
///
/// FIFO order of the queue is preserved. Any transport error ends the writer;
/// the caller is responsible for unregistering the session.
pub(crate) async fn run_writer(
    session: Arc<Session>,
    mut outbound: mpsc::Receiver<String>,
    transport: Arc<dyn Transport>,
    ping_interval: Duration,
) -> WriterExit {
    let cancel = session.cancellation();
    let ping_interval = tick_period(ping_interval);
    let mut probe = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                break WriterExit::Closed(session.close_reason().unwrap_or(CloseReason::Shutdown));
            }
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if let Err(e) = transport.send_text(text).await {
                        break WriterExit::TransportFailed(e);
                    }
                }
                None => {
                    break WriterExit::Closed(session.close_reason().unwrap_or(CloseReason::Normal));
                }
            },
            _ = probe.tick() => {
                if let Err(e) = transport.ping().await {
                    break WriterExit::TransportFailed(e);
                }
            }
        }
    };

    let reason = match &exit {
        WriterExit::Closed(reason) => *reason,
        WriterExit::TransportFailed(_) | WriterExit::Panicked => CloseReason::TransportFailure,
    };
    transport.close(reason).await;
    session.mark_closed();
    exit
}
