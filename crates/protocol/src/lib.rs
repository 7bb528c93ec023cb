//! Wire types for the agent-to-control-plane WebSocket protocol.
//!
//! Messages are serialized as JSON text frames, one message per frame,
//! using serde's internally-tagged representation (`"type": "..."` field).
//! This crate is pure data: no I/O, no tokio. It is shared by the control
//! plane and by any agent-side implementation (the agent process itself is
//! an external collaborator, out of scope for this repository).

use serde::{Deserialize, Serialize};

/// Platform kind an agent runs on. Used by the Agent Selector to match a
/// session's template requirement against eligible agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    KubernetesCluster,
    DockerHost,
    Other,
}

/// Resource request for a session, carried in `start_session` payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_millis: u32,
    pub memory_bytes: u64,
}

/// Observed session phase, as reported by an agent in `session_event`.
///
/// Distinct from `DesiredState`: the agent reports where the session
/// *is*, the control plane (via REST, out of scope) or the agent's idle
/// detection requests where it *should be*.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Pending,
    Starting,
    Running,
    Hibernating,
    Hibernated,
    Waking,
    Terminating,
    Terminated,
    Failed,
}

impl SessionPhase {
    /// True for phases from which no further transition is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Terminated | SessionPhase::Failed)
    }

}

/// Desired state, as set by the user (via the REST layer, out of scope) or
/// by this control plane on `CreateSession`/`terminate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Hibernated,
    Terminated,
}

/// One of the kinds of durable command a control plane can send to an
/// agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    StartSession,
    StopSession,
    HibernateSession,
    WakeSession,
    OpenVncTunnel,
    Ping,
}

/// Structured, kind-specific command payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandPayload {
    StartSession {
        session_id: String,
        owner: String,
        template_name: String,
        image: String,
        #[serde(default)]
        env: Vec<String>,
        resources: ResourceRequest,
        persistent_home: bool,
    },
    StopSession {
        session_id: String,
    },
    HibernateSession {
        session_id: String,
    },
    WakeSession {
        session_id: String,
    },
    OpenVncTunnel {
        session_id: String,
        tunnel_id: String,
        ws_url: String,
    },
}

impl CommandPayload {
    pub fn kind(&self) -> CommandKind {
        match self {
            CommandPayload::StartSession { .. } => CommandKind::StartSession,
            CommandPayload::StopSession { .. } => CommandKind::StopSession,
            CommandPayload::HibernateSession { .. } => CommandKind::HibernateSession,
            CommandPayload::WakeSession { .. } => CommandKind::WakeSession,
            CommandPayload::OpenVncTunnel { .. } => CommandKind::OpenVncTunnel,
        }
    }

    /// The session this command mutates, if any. `open_vnc_tunnel` is
    /// deliberately excluded even though it names a session: it is treated
    /// as non-mutating and is not subject to per-session serialization.
    pub fn correlated_session_id(&self) -> Option<&str> {
        match self {
            CommandPayload::StartSession { session_id, .. }
            | CommandPayload::StopSession { session_id }
            | CommandPayload::HibernateSession { session_id }
            | CommandPayload::WakeSession { session_id } => Some(session_id),
            CommandPayload::OpenVncTunnel { .. } => None,
        }
    }
}

/// Outcome of a dispatched command, reported back via `command_ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandResult {
    Completed,
    Failed,
}

/// Agent handshake/registration frame: the first message on a new
/// connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub identity: String,
    pub platform: PlatformKind,
    pub version: String,
    #[serde(default)]
    pub capabilities: serde_json::Map<String, serde_json::Value>,
}

/// Messages sent by the agent to the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Register(RegisterMessage),
    Heartbeat {
        status: AgentStatus,
        active_sessions: u32,
        ts: String,
    },
    CommandAck {
        command_id: i64,
        result: CommandResult,
        detail: Option<String>,
    },
    SessionEvent {
        session_id: String,
        phase: SessionPhase,
        detail: Option<String>,
    },
    Activity {
        session_id: String,
        last_active_ts: String,
    },
    Pong {
        nonce: String,
    },
}

/// Status reported in a heartbeat; always "online" today but modeled as
/// an enum for forward compatibility and because `serde`'s tag matching
/// needs a concrete type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
}

/// Messages sent by the hub to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    Config {
        heartbeat_interval_s: u64,
        ping_timeout_s: u64,
    },
    Command {
        command_id: i64,
        payload: CommandPayload,
    },
    Ping {
        nonce: String,
    },
    Shutdown {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases_are_terminated_and_failed_only() {
        assert!(SessionPhase::Terminated.is_terminal());
        assert!(SessionPhase::Failed.is_terminal());
        assert!(!SessionPhase::Running.is_terminal());
    }

    #[test]
    fn command_payload_round_trips_as_tagged_json() {
        let payload = CommandPayload::StartSession {
            session_id: "alice-firefox-abc123".into(),
            owner: "alice".into(),
            template_name: "firefox-browser".into(),
            image: "ghcr.io/streamspace/firefox:latest".into(),
            env: vec![],
            resources: ResourceRequest {
                cpu_millis: 250,
                memory_bytes: 512 * 1024 * 1024,
            },
            persistent_home: false,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"kind\":\"start_session\""));
        let back: CommandPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.kind(), CommandKind::StartSession);
        assert_eq!(back.correlated_session_id(), Some("alice-firefox-abc123"));
    }

    #[test]
    fn open_vnc_tunnel_has_no_correlated_session() {
        let payload = CommandPayload::OpenVncTunnel {
            session_id: "s1".into(),
            tunnel_id: "t1".into(),
            ws_url: "ws://agent/tunnel/t1".into(),
        };
        assert_eq!(payload.correlated_session_id(), None);
    }

    #[test]
    fn hub_message_command_serializes_with_nested_payload() {
        let msg = HubMessage::Command {
            command_id: 42,
            payload: CommandPayload::StopSession {
                session_id: "s1".into(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: HubMessage = serde_json::from_str(&json).unwrap();
        match back {
            HubMessage::Command { command_id, .. } => assert_eq!(command_id, 42),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn agent_message_session_event_round_trips() {
        let msg = AgentMessage::SessionEvent {
            session_id: "s1".into(),
            phase: SessionPhase::Running,
            detail: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
