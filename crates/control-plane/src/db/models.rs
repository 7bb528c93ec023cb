//! Entity types for the relational store. These are plain data
//! structs shared by the `sqlx`-backed store and the in-memory fake used in
//! tests; no derive here depends on `sqlx::FromRow` directly so the fake
//! store can construct them without a database connection.

use chrono::{DateTime, Utc};
use streamspace_protocol::{DesiredState, PlatformKind, SessionPhase};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOnlineStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub identity: String,
    pub platform_kind: PlatformKind,
    pub status: AgentOnlineStatus,
    pub active_sessions: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub owning_replica: Option<String>,
    pub cordoned: bool,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub identity: String,
    pub owner: String,
    pub template_name: String,
    pub agent_identity: String,
    pub desired_state: DesiredState,
    pub phase: SessionPhase,
    pub cpu_millis: u32,
    pub memory_bytes: u64,
    pub persistent_home: bool,
    pub last_activity: DateTime<Utc>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Dispatched,
    Acknowledged,
    Completed,
    Failed,
    Expired,
}

impl CommandStatus {
    /// Terminal statuses are sinks: no further transition is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Expired
        )
    }
}

#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub id: i64,
    pub target_agent: String,
    pub payload: streamspace_protocol::CommandPayload,
    pub status: CommandStatus,
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_by_replica: Option<String>,
    pub ack_deadline: Option<DateTime<Utc>>,
    pub correlated_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for enqueueing a new command.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub target_agent: String,
    pub payload: streamspace_protocol::CommandPayload,
}

impl NewCommand {
    pub fn correlated_session_id(&self) -> Option<String> {
        self.payload.correlated_session_id().map(str::to_owned)
    }
}
