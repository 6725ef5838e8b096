/// WebSocket endpoint: handshake checks and the per-connection actor
///
/// Endpoint: GET /ws?token=...
///
/// Handshake order: origin allow-list (403), credential lookup
/// (query `token`, then `Authorization: Bearer`, then cookie `auth_token`),
/// token validation (401), rate-limit hook (429).
use super::dispatch::Dispatcher;
use crate::error::{AuthError, HandshakeError, TransportError};
use crate::metrics;
use crate::models::Identity;
use crate::state::AppState;
use crate::websocket::{
    CloseReason, ConnectionRegistry, OutboundEnvelope, Session, Transport,
};
use actix::fut::{wrap_future, ActorFutureExt};
use actix::{Actor, ActorContext, Addr, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web::{http::header, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

const READ_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const MIN_READ_CHECK_INTERVAL: Duration = Duration::from_millis(100);
const AUTH_COOKIE: &str = "auth_token";

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// `true` if `origin` passes the allow-list.
///
/// An empty list allows everything. Entries are exact origins, `*`, or a
/// prefix ending in `*`. A missing origin only passes an empty list.
pub fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Some(origin) = origin else {
        return false;
    };

    allowed.iter().any(|entry| {
        if entry == "*" {
            return true;
        }
        match entry.strip_suffix('*') {
            Some(prefix) => origin.starts_with(prefix),
            None => entry == origin,
        }
    })
}

/// Pick the credential: query parameter, then bearer header, then cookie.
pub fn extract_token(
    query: Option<&str>,
    authorization: Option<&str>,
    cookie: Option<&str>,
) -> Option<String> {
    let non_empty = |s: &str| {
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_string())
    };

    query
        .and_then(non_empty)
        .or_else(|| {
            authorization
                .and_then(|h| h.strip_prefix("Bearer "))
                .and_then(non_empty)
        })
        .or_else(|| cookie.and_then(non_empty))
}

/// Run every handshake check and return the authenticated identity.
pub async fn authorize_handshake(
    req: &HttpRequest,
    params: &WsParams,
    state: &AppState,
) -> Result<Identity, HandshakeError> {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    if !origin_allowed(origin, &state.websocket.allowed_origins) {
        return Err(HandshakeError::Origin(origin.unwrap_or("<none>").to_string()));
    }

    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let cookie = req.cookie(AUTH_COOKIE);
    let token = extract_token(
        params.token.as_deref(),
        authorization,
        cookie.as_ref().map(|c| c.value()),
    )
    .ok_or(AuthError::MissingToken)?;

    let identity = state.authenticator.validate_token(&token).await?;

    let remote = req.connection_info().realip_remote_addr().map(str::to_string);
    if !state.rate_limiter.allow(&identity, remote.as_deref()).await {
        return Err(HandshakeError::RateLimited);
    }

    Ok(identity)
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    params: web::Query<WsParams>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    if state.registry.is_shutdown() {
        return Ok(HttpResponse::ServiceUnavailable().json(json!({
            "success": false,
            "error": "server shutting down"
        })));
    }

    let identity = match authorize_handshake(&req, &params, &state).await {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(reason = e.reason(), error = %e, "websocket handshake rejected");
            metrics::record_handshake_rejected(e.reason());
            return Ok(HttpResponse::build(e.status()).json(json!({
                "success": false,
                "error": e.to_string()
            })));
        }
    };

    tracing::info!(user_id = %identity.user_id, role = %identity.role, "websocket handshake accepted");

    let actor = WsSession::new(
        identity,
        state.registry.clone(),
        Dispatcher::new(state.composer.clone()),
        state.websocket.read_timeout,
    );

    ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(state.websocket.max_message_size)
        .start()
}

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct OutboundText(String);

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct Probe;

#[derive(ActixMessage)]
#[rtype(result = "()")]
struct CloseSession(CloseReason);

/// Transport backed by the connection actor's mailbox.
struct ActorTransport {
    addr: Addr<WsSession>,
}

#[async_trait]
impl Transport for ActorTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.addr
            .send(OutboundText(text))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.addr.send(Probe).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&self, reason: CloseReason) {
        self.addr.do_send(CloseSession(reason));
    }
}

fn close_code(reason: CloseReason) -> ws::CloseCode {
    match reason {
        CloseReason::Normal | CloseReason::Replaced | CloseReason::Shutdown => ws::CloseCode::Normal,
        CloseReason::LivenessTimeout => ws::CloseCode::Policy,
        CloseReason::TransportFailure => ws::CloseCode::Error,
    }
}

/// One client connection.
///
/// Reads are handled here; writes go through the registry-owned session
/// queue and come back as [`OutboundText`] from the writer task.
pub struct WsSession {
    identity: Identity,
    registry: ConnectionRegistry,
    dispatcher: Dispatcher,
    session: Option<Arc<Session>>,
    last_read: Instant,
    read_timeout: Duration,
    close_reason: CloseReason,
}

impl WsSession {
    fn new(
        identity: Identity,
        registry: ConnectionRegistry,
        dispatcher: Dispatcher,
        read_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            registry,
            dispatcher,
            session: None,
            last_read: Instant::now(),
            read_timeout,
            close_reason: CloseReason::Normal,
        }
    }

    fn on_read(&mut self) {
        self.last_read = Instant::now();
        if let Some(session) = &self.session {
            session.touch();
        }
    }

    fn read_deadline(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let every = READ_CHECK_INTERVAL
            .min(self.read_timeout)
            .max(MIN_READ_CHECK_INTERVAL);
        ctx.run_interval(every, |act, ctx| {
            if act.last_read.elapsed() > act.read_timeout {
                tracing::warn!(user_id = %act.identity.user_id, "websocket read timeout");
                act.close_with(ctx, CloseReason::LivenessTimeout);
            }
        });
    }

    /// Send a close frame for `reason` and stop the actor.
    fn close_with(&mut self, ctx: &mut ws::WebsocketContext<Self>, reason: CloseReason) {
        self.close_reason = reason;
        ctx.close(Some(ws::CloseReason {
            code: close_code(reason),
            description: Some(reason.description().to_string()),
        }));
        ctx.stop();
    }

    fn reply(&self, envelope: &OutboundEnvelope) {
        let Some(session) = &self.session else {
            return;
        };
        if let Err(e) = session.send_envelope(envelope) {
            metrics::record_outbound_dropped("reply");
            tracing::warn!(user_id = %self.identity.user_id, error = %e, "dropping reply");
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.read_deadline(ctx);

        let registry = self.registry.clone();
        let user_id = self.identity.user_id.clone();
        let role = self.identity.role.clone();
        let transport: Arc<dyn Transport> = Arc::new(ActorTransport {
            addr: ctx.address(),
        });

        // Frames are not processed until registration completes
        let register = async move { registry.register(&user_id, &role, transport).await };
        ctx.wait(wrap_future::<_, Self>(register).map(|result, act, ctx| match result {
            Ok(session) => {
                tracing::info!(
                    user_id = %act.identity.user_id,
                    session_id = %session.id(),
                    "websocket session started"
                );
                let welcome = OutboundEnvelope::connected(
                    &session.id().to_string(),
                    &act.identity.user_id,
                );
                act.session = Some(session);
                act.reply(&welcome);
            }
            Err(e) => {
                tracing::error!(user_id = %act.identity.user_id, error = %e, "session registration failed");
                act.close_reason = CloseReason::Shutdown;
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Away,
                    description: Some(e.to_string()),
                }));
                ctx.stop();
            }
        }));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let Some(session) = self.session.take() else {
            return;
        };
        tracing::info!(
            user_id = %self.identity.user_id,
            session_id = %session.id(),
            reason = self.close_reason.as_str(),
            "websocket session stopped"
        );

        let registry = self.registry.clone();
        let reason = self.close_reason;
        actix::spawn(async move {
            if let Err(e) = registry.unregister(&session, reason).await {
                tracing::debug!(error = %e, "unregister after registry shutdown");
            }
        });
    }
}

impl Handler<OutboundText> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: OutboundText, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<Probe> for WsSession {
    type Result = ();

    fn handle(&mut self, _msg: Probe, ctx: &mut Self::Context) {
        ctx.ping(b"");
    }
}

impl Handler<CloseSession> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: CloseSession, ctx: &mut Self::Context) {
        self.close_with(ctx, msg.0);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(ws::ProtocolError::Overflow) => {
                tracing::warn!(user_id = %self.identity.user_id, "inbound frame exceeds size limit");
                self.close_reason = CloseReason::TransportFailure;
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Size,
                    description: Some("frame too large".to_string()),
                }));
                ctx.stop();
                return;
            }
            Err(e) => {
                tracing::warn!(user_id = %self.identity.user_id, error = %e, "websocket protocol error");
                self.close_with(ctx, CloseReason::TransportFailure);
                return;
            }
        };

        match msg {
            ws::Message::Ping(bytes) => {
                self.on_read();
                ctx.pong(&bytes);
            }
            ws::Message::Pong(_) => {
                self.on_read();
            }
            ws::Message::Text(text) => {
                self.on_read();
                let dispatcher = self.dispatcher.clone();
                let identity = self.identity.clone();
                let text = text.to_string();

                // Serialize handling so replies keep request order
                let work = async move { dispatcher.handle_text(&identity, &text).await };
                ctx.wait(wrap_future::<_, Self>(work).map(|reply, act, _ctx| {
                    if let Some(reply) = reply {
                        act.reply(&reply);
                    }
                }));
            }
            ws::Message::Binary(_) => {
                self.on_read();
                tracing::warn!(user_id = %self.identity.user_id, "binary frames not supported");
                self.reply(&OutboundEnvelope::error(
                    "unsupported_frame",
                    "binary frames are not supported",
                ));
            }
            ws::Message::Close(reason) => {
                tracing::info!(user_id = %self.identity.user_id, reason = ?reason, "client closed websocket");
                self.close_reason = CloseReason::Normal;
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Continuation(_) | ws::Message::Nop => {}
        }
    }
}
