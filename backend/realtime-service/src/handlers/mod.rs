pub mod admin;
pub mod dispatch;
pub mod websocket;

pub use dispatch::Dispatcher;

use actix_web::web;

/// Mount every route except `/metrics`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws", web::get().to(websocket::ws_handler));
    admin::register_routes(cfg);
}
