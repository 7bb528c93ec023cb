//! `GET /api/v1/agents/tunnels/{tunnel_id}` — the agent-initiated side of
//! a VNC tunnel. The agent dials this endpoint in response to an
//! `open_vnc_tunnel` command; once matched against a waiting browser
//! connection, raw binary frames are piped through `vnc::bridge` in both
//! directions until either side closes.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::vnc::AgentSide;
use crate::AppState;

const TUNNEL_CHANNEL_CAPACITY: usize = 32;

pub async fn tunnel_ws_handler(
    ws: WebSocketUpgrade,
    Path(tunnel_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_tunnel_connection(socket, state, tunnel_id))
}

async fn handle_tunnel_connection(socket: WebSocket, state: AppState, tunnel_id: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (to_agent_tx, mut to_agent_rx) = mpsc::channel::<Vec<u8>>(TUNNEL_CHANNEL_CAPACITY);
    let (from_agent_tx, from_agent_rx) = mpsc::channel::<Vec<u8>>(TUNNEL_CHANNEL_CAPACITY);

    if !state.vnc.match_agent_side(
        &tunnel_id,
        AgentSide {
            to_agent: to_agent_tx,
            from_agent: from_agent_rx,
        },
    ) {
        warn!(%tunnel_id, "agent tunnel arrived with no waiting browser side; closing");
        let _ = ws_sink.close().await;
        return;
    }
    info!(%tunnel_id, "agent tunnel matched");

    let writer = tokio::spawn(async move {
        while let Some(frame) = to_agent_rx.recv().await {
            if ws_sink.send(Message::Binary(frame.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        match ws_stream.next().await {
            Some(Ok(Message::Binary(data))) => {
                if from_agent_tx.send(data.into()).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!(%tunnel_id, error = %e, "agent tunnel websocket error");
                break;
            }
            _ => {}
        }
    }

    writer.abort();
    state.vnc.close_tunnel(&tunnel_id);
    info!(%tunnel_id, "agent tunnel closed");
}
