//! `GET /api/v1/sessions/{id}/vnc` — the browser side of a VNC tunnel.
//! Authenticates the caller and verifies session ownership, opens a
//! fresh tunnel against the session's agent, waits for the agent to dial
//! back through `tunnel_ws`, then bridges raw RFB bytes between the two
//! WebSockets until either side closes.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::vnc::{self, VncError};
use crate::AppState;

const BROWSER_CHANNEL_CAPACITY: usize = 32;

/// Private-use WebSocket close codes (RFC 6455 §7.4.2 reserves 4000-4999
/// for applications) distinguishing *why* the VNC endpoint refused the
/// connection, so the browser client gets an explanatory code rather than
/// a bare close.
mod close_code {
    pub const UNAUTHENTICATED: u16 = 4401;
    pub const FORBIDDEN: u16 = 4403;
    pub const SESSION_NOT_FOUND: u16 = 4404;
    pub const SESSION_NOT_RUNNING: u16 = 4409;
    pub const NO_ROUTE: u16 = 4503;
    pub const MATCH_TIMEOUT: u16 = 4408;
}

/// Header carrying the caller's identity as validated by an upstream
/// authenticating gateway — this core does not issue or verify bearer
/// tokens/cookies itself (auth is an external collaborator); it
/// trusts this header the same way `rest.rs` trusts `owner` in the
/// session-creation body.
const CALLER_IDENTITY_HEADER: &str = "x-streamspace-user";

async fn close_with(sink: &mut (impl futures::Sink<Message> + Unpin), code: u16, reason: &'static str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
        .await;
}

pub async fn vnc_ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let caller = headers
        .get(CALLER_IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| handle_vnc_connection(socket, state, session_id, caller))
}

async fn handle_vnc_connection(socket: WebSocket, state: AppState, session_id: String, caller: Option<String>) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let Some(caller) = caller else {
        warn!(session_id = %session_id, "vnc requested with no caller identity");
        close_with(&mut ws_sink, close_code::UNAUTHENTICATED, "missing caller identity").await;
        return;
    };

    match state.store.get_session(&session_id).await {
        Ok(Some(session)) if session.owner != caller => {
            warn!(session_id = %session_id, caller = %caller, owner = %session.owner, "vnc requested by non-owner");
            close_with(&mut ws_sink, close_code::FORBIDDEN, "not the session owner").await;
            return;
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!(session_id = %session_id, "vnc requested for unknown session");
            close_with(&mut ws_sink, close_code::SESSION_NOT_FOUND, "session not found").await;
            return;
        }
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "store error resolving vnc session owner");
            close_with(&mut ws_sink, close_code::SESSION_NOT_FOUND, "session not found").await;
            return;
        }
    }

    let base_url = &state.config.tunnel_ws_base_url;
    let tunnel_id = match state.vnc.open_tunnel(state.store.as_ref(), state.hub.as_ref(), &session_id, base_url).await {
        Ok(id) => id,
        Err(VncError::SessionNotFound(_)) => {
            warn!(session_id = %session_id, "vnc requested for unknown session");
            close_with(&mut ws_sink, close_code::SESSION_NOT_FOUND, "session not found").await;
            return;
        }
        Err(VncError::SessionNotRunning(_)) => {
            warn!(session_id = %session_id, "vnc requested for a session that is not running");
            close_with(&mut ws_sink, close_code::SESSION_NOT_RUNNING, "session is not running").await;
            return;
        }
        Err(VncError::NoRoute) => {
            warn!(session_id = %session_id, "no route to the session's agent");
            close_with(&mut ws_sink, close_code::NO_ROUTE, "no route to agent").await;
            return;
        }
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "failed to open vnc tunnel");
            close_with(&mut ws_sink, close_code::NO_ROUTE, "failed to open tunnel").await;
            return;
        }
    };

    let agent_side = match tokio::time::timeout(state.config.vnc_tunnel_match_deadline(), state.vnc.await_agent_side(&tunnel_id)).await {
        Ok(Ok(side)) => side,
        Ok(Err(_)) | Err(_) => {
            warn!(session_id = %session_id, %tunnel_id, "agent side did not arrive before the match deadline");
            state.vnc.close_tunnel(&tunnel_id);
            close_with(&mut ws_sink, close_code::MATCH_TIMEOUT, "agent tunnel match timeout").await;
            return;
        }
    };
    info!(session_id = %session_id, %tunnel_id, "vnc tunnel bridging");

    let (browser_in_tx, browser_in_rx) = mpsc::channel::<Vec<u8>>(BROWSER_CHANNEL_CAPACITY);
    let (browser_out_tx, mut browser_out_rx) = mpsc::channel::<Vec<u8>>(BROWSER_CHANNEL_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(frame) = browser_out_rx.recv().await {
            if ws_sink.send(Message::Binary(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let reader = tokio::spawn(async move {
        loop {
            match ws_stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if browser_in_tx.send(data.into()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {}
            }
        }
    });

    vnc::bridge(browser_in_rx, browser_out_tx, agent_side.from_agent, agent_side.to_agent).await;

    reader.abort();
    writer.abort();
    state.vnc.close_tunnel(&tunnel_id);
    info!(session_id = %session_id, %tunnel_id, "vnc tunnel closed");
}
