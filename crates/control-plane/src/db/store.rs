//! The `Store` trait: the single authoritative boundary onto durable
//! state. The relational store is the only authoritative state; every
//! other component (Agent Hub, Command Dispatcher, Agent Selector, Session
//! State Machine) depends on this trait, not on `sqlx` directly, so that
//! unit tests can run against `MemStore` without a live Postgres instance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use streamspace_protocol::{DesiredState, PlatformKind, SessionPhase};
use thiserror::Error;

use super::models::{Agent, AgentCommand, CommandStatus, NewCommand, Session};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Everything the control plane needs from durable storage, grouped by
/// component. Implemented by `SqlxStore` (production) and `MemStore`
/// (tests).
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // ---- Agent Hub ----

    /// Upsert an agent's registration row, binding it to `replica`.
    /// Returns `true` if accepted. Rejects only when the agent
    /// is bound to a *different*, still-fresh replica; re-registering
    /// under the same replica, or taking over from a stale binding, is
    /// always accepted.
    async fn upsert_agent_registration(
        &self,
        identity: &str,
        platform_kind: PlatformKind,
        replica: &str,
        now: DateTime<Utc>,
        registry_ttl: chrono::Duration,
    ) -> Result<bool, StoreError>;

    async fn record_heartbeat(
        &self,
        identity: &str,
        active_sessions: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get_agent(&self, identity: &str) -> Result<Option<Agent>, StoreError>;

    /// Online agents, optionally filtered by platform kind and always
    /// excluding cordoned agents.
    async fn list_eligible_agents(
        &self,
        platform_kind: Option<PlatformKind>,
    ) -> Result<Vec<Agent>, StoreError>;

    /// Agents whose `last_heartbeat` is older than `now - ttl` and are
    /// still marked online; input to the sweeper.
    async fn list_stale_online_agents(
        &self,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<Vec<Agent>, StoreError>;

    /// Atomically transition to offline and clear the owning replica.
    async fn mark_agent_offline(&self, identity: &str) -> Result<(), StoreError>;

    /// Sets or clears an agent's cordon flag. A cordoned agent is excluded
    /// from `list_eligible_agents` but stays `online` and keeps receiving
    /// commands for sessions already assigned to it. Operator action; not
    /// exposed over REST by this core (the wider auth/CRUD surface is an
    /// external collaborator).
    async fn set_cordoned(&self, identity: &str, cordoned: bool) -> Result<(), StoreError>;

    // ---- Session State Machine ----

    async fn insert_session(&self, session: Session) -> Result<(), StoreError>;

    async fn get_session(&self, identity: &str) -> Result<Option<Session>, StoreError>;

    /// Update the observed phase (and failure reason, if any). Callers
    /// are responsible for the late-event check; this method is a plain
    /// write, not itself idempotent-aware.
    async fn update_session_phase(
        &self,
        identity: &str,
        phase: SessionPhase,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn update_session_desired_state(
        &self,
        identity: &str,
        desired: DesiredState,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn record_activity(
        &self,
        identity: &str,
        ts: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ---- Command Dispatcher ----

    async fn enqueue_command(
        &self,
        cmd: NewCommand,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    async fn get_command(&self, id: i64) -> Result<Option<AgentCommand>, StoreError>;

    /// Atomically claim up to `limit` eligible commands for `replica`:
    /// `status = pending AND next_attempt_at <= now`, ordered by
    /// `next_attempt_at` then id, excluding any session that already has
    /// an in-flight (`dispatched`, unacknowledged) mutating command.
    async fn claim_commands(
        &self,
        replica: &str,
        limit: u32,
        now: DateTime<Utc>,
        ack_deadline: DateTime<Utc>,
    ) -> Result<Vec<AgentCommand>, StoreError>;

    /// Return a dispatched-but-undelivered command to `pending` with a
    /// bumped attempt count and backoff-computed `next_attempt_at`.
    async fn requeue_command(
        &self,
        id: i64,
        next_attempt_at: DateTime<Utc>,
        attempt: u32,
    ) -> Result<(), StoreError>;

    /// Record an ack. Idempotent: acking an already-terminal command is a
    /// no-op.
    async fn acknowledge_command(
        &self,
        id: i64,
        status: CommandStatus,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Commands whose `ack_deadline` has passed: requeue (if under
    /// `max_attempts`) or expire. Returns the ids that were requeued and
    /// the ids that were expired, for the reaper to log.
    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        backoff_next_attempt_at: DateTime<Utc>,
    ) -> Result<ReapOutcome, StoreError>;

    /// Reset to `pending` all commands targeting `agent_identity` that are
    /// `pending` or timed-out `dispatched` (reconnection reconciliation),
    /// preserving attempt counts. Returns how many rows were reset.
    async fn reconcile_agent_reconnect(
        &self,
        agent_identity: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError>;
}

#[derive(Debug, Default, Clone)]
pub struct ReapOutcome {
    pub requeued: Vec<i64>,
    pub expired: Vec<i64>,
}
