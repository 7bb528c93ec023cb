//! The minimal REST + WebSocket surface actually owned by this core: the
//! agent hub's connection endpoint, the agent's tunnel callback endpoint,
//! session creation, and the browser VNC endpoint. Auth, users, template
//! CRUD, and quota accounting are external collaborators and are not
//! routed here.

mod agent_ws;
mod rest;
mod tunnel_ws;
mod vnc_ws;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Builds the Axum router: routes composed first, then CORS and request
/// tracing layered on, since this service has several independent
/// WebSocket surfaces worth distinguishing in logs.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/agents/connect", get(agent_ws::agent_ws_handler))
        .route("/api/v1/agents/tunnels/{tunnel_id}", get(tunnel_ws::tunnel_ws_handler))
        .route("/api/v1/agents", get(rest::list_agents))
        .route("/api/v1/sessions", post(rest::create_session_handler))
        .route("/api/v1/sessions/{id}/vnc", get(vnc_ws::vnc_ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
