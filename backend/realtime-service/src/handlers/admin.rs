/// Operational HTTP endpoints over the registry and presence state
use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Get WebSocket connection status for a user
///
/// Endpoint: GET /api/v1/ws/status/{user_id}
pub async fn ws_status(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let user_id = path.into_inner();
    let session = state.registry.lookup(&user_id).await;

    Ok(HttpResponse::Ok().json(json!({
        "user_id": user_id,
        "connected": session.is_some(),
        "session_id": session.as_ref().map(|s| s.id().to_string()),
        "role": session.as_ref().map(|s| s.role().to_string()),
        "connected_at": session.as_ref().map(|s| s.connected_at()),
    })))
}

/// Get list of all connected user IDs
///
/// Endpoint: GET /api/v1/ws/users
pub async fn list_connected_users(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let user_ids = state.registry.connected_user_ids().await;

    Ok(HttpResponse::Ok().json(json!({
        "count": user_ids.len(),
        "users": user_ids,
    })))
}

/// Endpoint: GET /api/v1/rooms/{room_id}/presence
pub async fn room_presence(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let room_id = path.into_inner();
    if room_id.trim().is_empty() {
        return Err(AppError::BadRequest("room_id must not be empty".into()));
    }

    let online = state.presence().get_online_users(&room_id).await?;
    let mut members = Vec::with_capacity(online.len());
    for user_id in &online {
        let status = state.presence().get_status(&room_id, user_id).await?;
        members.push(json!({ "user_id": user_id, "status": status }));
    }

    Ok(HttpResponse::Ok().json(json!({
        "room_id": room_id,
        "participant_count": online.len(),
        "online_users": members,
    })))
}

pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": if state.registry.is_shutdown() { "shutting_down" } else { "ok" },
        "sessions": state.registry.session_count().await,
    }))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .service(
            web::scope("/api/v1/ws")
                .route("/status/{user_id}", web::get().to(ws_status))
                .route("/users", web::get().to(list_connected_users)),
        )
        .route(
            "/api/v1/rooms/{room_id}/presence",
            web::get().to(room_presence),
        );
}
