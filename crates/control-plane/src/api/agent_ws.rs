//! `GET /api/v1/agents/connect` — the agent side of the Agent Hub. Runs a
//! reader loop paired with an outbound-forwarding task, implementing the
//! handshake → heartbeat → liveness protocol, with the per-connection
//! state machine `handshaking → active → draining → closed` collapsed
//! into this single task: `draining` is the short window between
//! detecting a close condition and actually returning, during which no
//! new outbound sends are attempted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use streamspace_protocol::{AgentMessage, AgentStatus, HubMessage};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatcher;
use crate::session;
use crate::AppState;

const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

pub async fn agent_ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_connection(socket, state))
}

async fn handle_agent_connection(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let register = match timeout(HANDSHAKE_DEADLINE, ws_stream.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<AgentMessage>(&text).ok(),
        _ => None,
    };
    let register = match register {
        Some(AgentMessage::Register(r)) => r,
        _ => {
            warn!("agent handshake missing or invalid within deadline; closing");
            let _ = ws_sink.close().await;
            return;
        }
    };
    let identity = register.identity.clone();

    match state.hub.register(&identity, register.platform).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(identity = %identity, "agent registration rejected: bound fresh on another replica");
            let _ = ws_sink.close().await;
            return;
        }
        Err(e) => {
            warn!(identity = %identity, error = %e, "agent registration store error");
            let _ = ws_sink.close().await;
            return;
        }
    }

    if let Err(e) = dispatcher::reconcile_agent_reconnect(state.store.as_ref(), &identity).await {
        warn!(identity = %identity, error = %e, "reconnection reconciliation failed");
    }
    info!(identity = %identity, platform = ?register.platform, "agent registered");

    let (tx, mut rx) = mpsc::channel::<HubMessage>(64);
    state.hub.attach_local(&identity, tx.clone());

    let outbound = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize hub message");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = tx
        .send(HubMessage::Config {
            heartbeat_interval_s: state.config.heartbeat_interval_s,
            ping_timeout_s: state.config.ping_timeout_s,
        })
        .await;

    let missed_pings = AtomicU32::new(0);
    // Two missed pings close the socket, so the ping cadence is
    // half the configured timeout.
    let mut ticker = tokio::time::interval(state.config.ping_timeout() / 2);
    ticker.tick().await;

    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<AgentMessage>(&text) {
                            Ok(msg) => handle_agent_message(&state, &identity, &missed_pings, msg).await,
                            Err(e) => warn!(identity = %identity, error = %e, "dropping malformed agent message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(identity = %identity, error = %e, "agent websocket error");
                        break;
                    }
                    _ => {}
                }
            }
            _ = ticker.tick() => {
                if missed_pings.fetch_add(1, Ordering::SeqCst) >= 2 {
                    warn!(identity = %identity, "two missed pings; closing agent connection");
                    break;
                }
                let nonce = Uuid::new_v4().to_string();
                if tx.send(HubMessage::Ping { nonce }).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(identity = %identity, "agent disconnected");
    outbound.abort();
    // Liveness is the sweeper's job, not this task's: a reconnect may
    // already have re-registered this identity (possibly on another
    // replica) before this task notices its own socket is gone, and
    // marking offline/clearing the registry here would clobber that
    // fresh binding. `detach_local` only drops this replica's transient
    // connection-table entry, same as hub.rs documents.
    state.hub.detach_local(&identity);
}

async fn handle_agent_message(state: &AppState, identity: &str, missed_pings: &AtomicU32, msg: AgentMessage) {
    match msg {
        AgentMessage::Register(_) => {
            // Re-handshake on an already-active connection; nothing to do.
        }
        AgentMessage::Heartbeat { status: AgentStatus::Online, active_sessions, .. } => {
            if let Err(e) = state.store.record_heartbeat(identity, active_sessions, Utc::now()).await {
                warn!(identity = %identity, error = %e, "failed to record heartbeat");
            }
        }
        AgentMessage::CommandAck { command_id, result, detail } => {
            if let Err(e) = dispatcher::acknowledge(state.store.as_ref(), command_id, result, detail).await {
                warn!(identity = %identity, command_id, error = %e, "failed to acknowledge command");
            }
        }
        AgentMessage::SessionEvent { session_id, phase, detail } => {
            if let Err(e) =
                session::apply_agent_event(state.store.as_ref(), state.quota.as_ref(), &session_id, phase, detail).await
            {
                warn!(identity = %identity, session_id = %session_id, error = %e, "contract violation applying session event");
            }
        }
        AgentMessage::Activity { session_id, .. } => {
            if let Err(e) = session::record_activity(state.store.as_ref(), &session_id).await {
                warn!(identity = %identity, session_id = %session_id, error = %e, "failed to record activity");
            }
        }
        AgentMessage::Pong { .. } => {
            missed_pings.store(0, Ordering::SeqCst);
        }
    }
}
