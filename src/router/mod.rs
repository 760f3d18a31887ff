//! Control Surface (C6): HTTP+JSON API and WebSocket push, path prefix
//! `/api/watchtower` (spec §4.6, §6).

mod handlers;
mod middleware;
mod websocket;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::SharedConfig;
use crate::events::EventBus;
use crate::registry::Registry;
use crate::runtime::RuntimeAdapter;
use crate::updater::UpdateEngine;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub events: EventBus,
    pub runtime: Arc<dyn RuntimeAdapter>,
    pub updater: Arc<UpdateEngine>,
    pub config: SharedConfig,
}

pub fn build_router(state: AppState) -> Router {
    // Reads require no principal (spec: reject *mutating* operations when
    // unauthenticated; GETs and the WebSocket upgrade stay open).
    let reads = Router::new()
        .route("/status", get(handlers::status))
        .route("/containers", get(handlers::list_containers))
        .route("/containers/:id", get(handlers::get_container))
        .route("/updates", get(handlers::update_history))
        .route("/stats", get(handlers::stats))
        .route("/config", get(handlers::get_config))
        .route("/images", get(handlers::list_images))
        .route("/ws", get(websocket::ws_handler));

    let mutations = Router::new()
        .route("/containers/:id", delete(handlers::remove_container))
        .route("/containers/:id/update", post(handlers::update_container))
        .route("/containers/:id/restart", post(handlers::restart_container))
        .route("/containers/:id/stop", post(handlers::stop_container))
        .route("/containers/:id/start", post(handlers::start_container))
        .route("/check-updates", post(handlers::check_updates))
        .route("/config", put(handlers::put_config))
        .route("/images/:name/pull", post(handlers::pull_image))
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::auth::require_auth));

    let api = reads.merge(mutations);

    Router::new()
        .nest("/api/watchtower", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}
