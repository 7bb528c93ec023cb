//! VNC Proxy: bridges a browser WebSocket to an agent-initiated tunnel
//! carrying the opaque RFB byte stream. Tunnel ownership is scoped to the
//! replica that accepted the browser connection — this module's `DashMap`
//! is intentionally per-process, unlike the cross-replica `Registry`,
//! since a global shared map of open tunnels would make every replica a
//! single point of failure for every other replica's tunnels.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use streamspace_protocol::{CommandPayload, HubMessage, SessionPhase};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::Store;
use crate::hub::{AgentHub, SendOutcome};

#[derive(Debug, Error)]
pub enum VncError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session {0} is not running")]
    SessionNotRunning(String),
    #[error("no route to the session's agent")]
    NoRoute,
    #[error("agent tunnel did not arrive within the match deadline")]
    MatchTimeout,
    #[error("store error: {0}")]
    Store(#[from] crate::db::StoreError),
}

/// One frame of RFB traffic, passed through opaquely in either direction.
pub type TunnelFrame = Vec<u8>;

/// The two ends the agent's tunnel connection task hands over once
/// matched: a sender the bridge uses to push browser-origin frames to
/// the agent, and a receiver fed by the agent connection's own reader
/// loop.
pub struct AgentSide {
    pub to_agent: mpsc::Sender<TunnelFrame>,
    pub from_agent: mpsc::Receiver<TunnelFrame>,
}

struct PendingMatch {
    agent_side_tx: oneshot::Sender<AgentSide>,
}

/// Tracks tunnels awaiting their agent-side WebSocket and open tunnels'
/// liveness, all scoped to this replica: transient tunnel handles never
/// outlive the process that opened them.
#[derive(Default)]
pub struct VncProxy {
    pending: DashMap<String, PendingMatch>,
    open_tunnel_ids_by_session: DashMap<String, Vec<String>>,
    tunnel_session: DashMap<String, String>,
}

impl VncProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the session, verifies it's `running`, allocates a tunnel
    /// id, and dispatches `open_vnc_tunnel` directly through the Hub
    /// (non-persisted: it is not subject to per-session serialization).
    pub async fn open_tunnel(
        &self,
        store: &dyn Store,
        hub: &AgentHub,
        session_id: &str,
        tunnel_ws_base_url: &str,
    ) -> Result<String, VncError> {
        let session = store
            .get_session(session_id)
            .await?
            .ok_or_else(|| VncError::SessionNotFound(session_id.to_string()))?;
        if session.phase != SessionPhase::Running {
            return Err(VncError::SessionNotRunning(session_id.to_string()));
        }

        let tunnel_id = Uuid::new_v4().to_string();
        let command_id = rand::thread_rng().gen_range(0..i64::MAX);
        let outcome = hub
            .send_to_agent(
                &session.agent_identity,
                HubMessage::Command {
                    command_id,
                    payload: CommandPayload::OpenVncTunnel {
                        session_id: session_id.to_string(),
                        tunnel_id: tunnel_id.clone(),
                        ws_url: format!("{tunnel_ws_base_url}/{tunnel_id}"),
                    },
                },
            )
            .await;

        if !matches!(outcome, SendOutcome::Delivered) {
            warn!(session_id, %tunnel_id, "open_vnc_tunnel could not be delivered to agent");
            return Err(VncError::NoRoute);
        }
        info!(session_id, %tunnel_id, agent = %session.agent_identity, "dispatched open_vnc_tunnel");

        self.open_tunnel_ids_by_session
            .entry(session_id.to_string())
            .or_default()
            .push(tunnel_id.clone());
        self.tunnel_session.insert(tunnel_id.clone(), session_id.to_string());
        Ok(tunnel_id)
    }

    /// Registers that the browser side is waiting for `tunnel_id`'s
    /// agent-side socket; returns the receiver end the browser task
    /// pipes frames into once matched.
    pub fn await_agent_side(&self, tunnel_id: &str) -> oneshot::Receiver<AgentSide> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(tunnel_id.to_string(), PendingMatch { agent_side_tx: tx });
        rx
    }

    /// Called when the agent's tunnel WebSocket arrives.
    /// `agent_side` carries both channel halves fed by that connection's
    /// reader/writer tasks. Returns `false` if no browser side is waiting
    /// (late or unknown tunnel id), in which case the caller should close
    /// the agent socket immediately.
    pub fn match_agent_side(&self, tunnel_id: &str, agent_side: AgentSide) -> bool {
        match self.pending.remove(tunnel_id) {
            Some((_, pending)) => pending.agent_side_tx.send(agent_side).is_ok(),
            None => false,
        }
    }

    fn forget_tunnel(&self, session_id: &str, tunnel_id: &str) {
        if let Some(mut ids) = self.open_tunnel_ids_by_session.get_mut(session_id) {
            ids.retain(|t| t != tunnel_id);
        }
        self.pending.remove(tunnel_id);
        self.tunnel_session.remove(tunnel_id);
    }

    /// Called by the bridging task once `bridge` returns for a single
    /// tunnel (either side closed). No retries: the browser must open a
    /// fresh VNC endpoint to get a new tunnel. Takes only the tunnel id
    /// since the agent-side WebSocket handler only has that from the URL
    /// path, not the owning session.
    pub fn close_tunnel(&self, tunnel_id: &str) {
        if let Some((_, session_id)) = self.tunnel_session.remove(tunnel_id) {
            self.forget_tunnel(&session_id, tunnel_id);
        } else {
            self.pending.remove(tunnel_id);
        }
    }

    /// A session leaving `running` must close all of its tunnels.
    /// Closing here just drops the bookkeeping; the
    /// actual sockets are closed by their bridging tasks noticing the
    /// channel close (see `bridge`).
    pub fn close_tunnels_for_session(&self, session_id: &str) -> Vec<String> {
        let ids = self
            .open_tunnel_ids_by_session
            .remove(session_id)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        for id in &ids {
            self.pending.remove(id);
            self.tunnel_session.remove(id);
        }
        ids
    }
}

/// Pipes frames bidirectionally between the browser and the agent
/// tunnel. Each direction has its own bounded channel; a slow
/// receiver's full channel makes the forwarding send block, which is the
/// backpressure — the sender naturally stops reading its own source
/// while waiting. Returns when either side closes.
pub async fn bridge(
    mut browser_in: mpsc::Receiver<TunnelFrame>,
    browser_out: mpsc::Sender<TunnelFrame>,
    mut agent_in: mpsc::Receiver<TunnelFrame>,
    agent_out: mpsc::Sender<TunnelFrame>,
) {
    loop {
        tokio::select! {
            frame = browser_in.recv() => {
                match frame {
                    Some(f) => if agent_out.send(f).await.is_err() { break },
                    None => break,
                }
            }
            frame = agent_in.recv() => {
                match frame {
                    Some(f) => if browser_out.send(f).await.is_err() { break },
                    None => break,
                }
            }
        }
    }
}
