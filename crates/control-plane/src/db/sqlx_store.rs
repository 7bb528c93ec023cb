//! Postgres-backed `Store`, using runtime-checked `sqlx::query` (not the
//! `query!` macro) so the crate builds without a live database or a
//! checked-in `.sqlx` offline cache — the same tradeoff
//! `agentsphere-platform` makes with compile-time macros, inverted because
//! this exercise has no database to check queries against at build time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use streamspace_protocol::{CommandPayload, DesiredState, PlatformKind, SessionPhase};

use super::models::{Agent, AgentCommand, AgentOnlineStatus, CommandStatus, NewCommand, Session};
use super::store::{ReapOutcome, Store, StoreError};

pub struct SqlxStore {
    pool: PgPool,
}

impl SqlxStore {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn platform_kind_to_str(p: PlatformKind) -> &'static str {
    match p {
        PlatformKind::KubernetesCluster => "kubernetes-cluster",
        PlatformKind::DockerHost => "docker-host",
        PlatformKind::Other => "other",
    }
}

fn platform_kind_from_str(s: &str) -> PlatformKind {
    match s {
        "kubernetes-cluster" => PlatformKind::KubernetesCluster,
        "docker-host" => PlatformKind::DockerHost,
        _ => PlatformKind::Other,
    }
}

fn agent_status_to_str(s: AgentOnlineStatus) -> &'static str {
    match s {
        AgentOnlineStatus::Online => "online",
        AgentOnlineStatus::Offline => "offline",
    }
}

fn agent_status_from_str(s: &str) -> AgentOnlineStatus {
    match s {
        "online" => AgentOnlineStatus::Online,
        _ => AgentOnlineStatus::Offline,
    }
}

fn phase_to_str(p: SessionPhase) -> &'static str {
    match p {
        SessionPhase::Pending => "pending",
        SessionPhase::Starting => "starting",
        SessionPhase::Running => "running",
        SessionPhase::Hibernating => "hibernating",
        SessionPhase::Hibernated => "hibernated",
        SessionPhase::Waking => "waking",
        SessionPhase::Terminating => "terminating",
        SessionPhase::Terminated => "terminated",
        SessionPhase::Failed => "failed",
    }
}

fn phase_from_str(s: &str) -> SessionPhase {
    match s {
        "pending" => SessionPhase::Pending,
        "starting" => SessionPhase::Starting,
        "running" => SessionPhase::Running,
        "hibernating" => SessionPhase::Hibernating,
        "hibernated" => SessionPhase::Hibernated,
        "waking" => SessionPhase::Waking,
        "terminating" => SessionPhase::Terminating,
        "terminated" => SessionPhase::Terminated,
        _ => SessionPhase::Failed,
    }
}

fn desired_to_str(d: DesiredState) -> &'static str {
    match d {
        DesiredState::Running => "running",
        DesiredState::Hibernated => "hibernated",
        DesiredState::Terminated => "terminated",
    }
}

fn desired_from_str(s: &str) -> DesiredState {
    match s {
        "hibernated" => DesiredState::Hibernated,
        "terminated" => DesiredState::Terminated,
        _ => DesiredState::Running,
    }
}

fn command_status_to_str(s: CommandStatus) -> &'static str {
    match s {
        CommandStatus::Pending => "pending",
        CommandStatus::Dispatched => "dispatched",
        CommandStatus::Acknowledged => "acknowledged",
        CommandStatus::Completed => "completed",
        CommandStatus::Failed => "failed",
        CommandStatus::Expired => "expired",
    }
}

fn command_status_from_str(s: &str) -> CommandStatus {
    match s {
        "pending" => CommandStatus::Pending,
        "dispatched" => CommandStatus::Dispatched,
        "acknowledged" => CommandStatus::Acknowledged,
        "completed" => CommandStatus::Completed,
        "failed" => CommandStatus::Failed,
        _ => CommandStatus::Expired,
    }
}

fn row_to_agent(row: &sqlx::postgres::PgRow) -> Result<Agent, sqlx::Error> {
    Ok(Agent {
        identity: row.try_get("identity")?,
        platform_kind: platform_kind_from_str(row.try_get::<String, _>("platform_kind")?.as_str()),
        status: agent_status_from_str(row.try_get::<String, _>("status")?.as_str()),
        active_sessions: row.try_get::<i32, _>("active_sessions")? as u32,
        last_heartbeat: row.try_get("last_heartbeat")?,
        owning_replica: row.try_get("owning_replica")?,
        cordoned: row.try_get("cordoned")?,
    })
}

fn row_to_session(row: &sqlx::postgres::PgRow) -> Result<Session, sqlx::Error> {
    Ok(Session {
        identity: row.try_get("identity")?,
        owner: row.try_get("owner")?,
        template_name: row.try_get("template_name")?,
        agent_identity: row.try_get("agent_identity")?,
        desired_state: desired_from_str(row.try_get::<String, _>("desired_state")?.as_str()),
        phase: phase_from_str(row.try_get::<String, _>("phase")?.as_str()),
        cpu_millis: row.try_get::<i32, _>("cpu_millis")? as u32,
        memory_bytes: row.try_get::<i64, _>("memory_bytes")? as u64,
        persistent_home: row.try_get("persistent_home")?,
        last_activity: row.try_get("last_activity")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_command(row: &sqlx::postgres::PgRow) -> Result<AgentCommand, sqlx::Error> {
    let payload_json: serde_json::Value = row.try_get("payload")?;
    let payload: CommandPayload = serde_json::from_value(payload_json)
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    Ok(AgentCommand {
        id: row.try_get("id")?,
        target_agent: row.try_get("target_agent")?,
        payload,
        status: command_status_from_str(row.try_get::<String, _>("status")?.as_str()),
        attempt: row.try_get::<i32, _>("attempt")? as u32,
        next_attempt_at: row.try_get("next_attempt_at")?,
        claimed_by_replica: row.try_get("claimed_by_replica")?,
        ack_deadline: row.try_get("ack_deadline")?,
        correlated_session_id: row.try_get("correlated_session_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Store for SqlxStore {
    async fn upsert_agent_registration(
        &self,
        identity: &str,
        platform_kind: PlatformKind,
        replica: &str,
        now: DateTime<Utc>,
        registry_ttl: chrono::Duration,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT * FROM agents WHERE identity = $1 FOR UPDATE")
            .bind(identity)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = &existing {
            let agent = row_to_agent(row)?;
            let fresh = now - agent.last_heartbeat < registry_ttl;
            if let Some(owner) = &agent.owning_replica {
                if owner != replica && fresh && agent.status == AgentOnlineStatus::Online {
                    tx.rollback().await?;
                    return Ok(false);
                }
            }
        }

        sqlx::query(
            r#"
            INSERT INTO agents (identity, platform_kind, status, active_sessions, last_heartbeat, owning_replica, cordoned)
            VALUES ($1, $2, 'online', 0, $3, $4, false)
            ON CONFLICT (identity) DO UPDATE SET
                platform_kind = EXCLUDED.platform_kind,
                status = 'online',
                last_heartbeat = EXCLUDED.last_heartbeat,
                owning_replica = EXCLUDED.owning_replica
            "#,
        )
        .bind(identity)
        .bind(platform_kind_to_str(platform_kind))
        .bind(now)
        .bind(replica)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn record_heartbeat(
        &self,
        identity: &str,
        active_sessions: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE agents SET active_sessions = $2, last_heartbeat = $3 WHERE identity = $1",
        )
        .bind(identity)
        .bind(active_sessions as i32)
        .bind(now)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn get_agent(&self, identity: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query("SELECT * FROM agents WHERE identity = $1")
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_agent).transpose().map_err(Into::into)
    }

    async fn list_eligible_agents(
        &self,
        platform_kind: Option<PlatformKind>,
    ) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM agents WHERE status = 'online' AND cordoned = false AND ($1::text IS NULL OR platform_kind = $1)",
        )
        .bind(platform_kind.map(platform_kind_to_str))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_agent).collect::<Result<_, _>>().map_err(Into::into)
    }

    async fn list_stale_online_agents(
        &self,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<Vec<Agent>, StoreError> {
        let cutoff = now - ttl;
        let rows = sqlx::query("SELECT * FROM agents WHERE status = 'online' AND last_heartbeat <= $1")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_agent).collect::<Result<_, _>>().map_err(Into::into)
    }

    async fn mark_agent_offline(&self, identity: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE agents SET status = 'offline', owning_replica = NULL WHERE identity = $1")
            .bind(identity)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_cordoned(&self, identity: &str, cordoned: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE agents SET cordoned = $2 WHERE identity = $1")
            .bind(identity)
            .bind(cordoned)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn insert_session(&self, session: Session) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (identity, owner, template_name, agent_identity, desired_state, phase,
                                   cpu_millis, memory_bytes, persistent_home, last_activity,
                                   failure_reason, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(&session.identity)
        .bind(&session.owner)
        .bind(&session.template_name)
        .bind(&session.agent_identity)
        .bind(desired_to_str(session.desired_state))
        .bind(phase_to_str(session.phase))
        .bind(session.cpu_millis as i32)
        .bind(session.memory_bytes as i64)
        .bind(session.persistent_home)
        .bind(session.last_activity)
        .bind(&session.failure_reason)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, identity: &str) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE identity = $1")
            .bind(identity)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_session).transpose().map_err(Into::into)
    }

    async fn update_session_phase(
        &self,
        identity: &str,
        phase: SessionPhase,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sessions SET phase = $2, failure_reason = COALESCE($3, failure_reason), updated_at = $4 WHERE identity = $1",
        )
        .bind(identity)
        .bind(phase_to_str(phase))
        .bind(failure_reason)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_session_desired_state(
        &self,
        identity: &str,
        desired: DesiredState,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET desired_state = $2, updated_at = $3 WHERE identity = $1")
            .bind(identity)
            .bind(desired_to_str(desired))
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_activity(&self, identity: &str, ts: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET last_activity = $2 WHERE identity = $1")
            .bind(identity)
            .bind(ts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn enqueue_command(
        &self,
        cmd: NewCommand,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let payload_json = serde_json::to_value(&cmd.payload)
            .map_err(|e| StoreError::Database(sqlx::Error::Encode(Box::new(e))))?;
        let row = sqlx::query(
            r#"
            INSERT INTO agent_commands (target_agent, payload, status, attempt, next_attempt_at,
                                         correlated_session_id, created_at, updated_at)
            VALUES ($1, $2, 'pending', 0, $3, $4, $3, $3)
            RETURNING id
            "#,
        )
        .bind(&cmd.target_agent)
        .bind(payload_json)
        .bind(now)
        .bind(cmd.correlated_session_id())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn get_command(&self, id: i64) -> Result<Option<AgentCommand>, StoreError> {
        let row = sqlx::query("SELECT * FROM agent_commands WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_command).transpose().map_err(Into::into)
    }

    async fn claim_commands(
        &self,
        replica: &str,
        limit: u32,
        now: DateTime<Utc>,
        ack_deadline: DateTime<Utc>,
    ) -> Result<Vec<AgentCommand>, StoreError> {
        // The session-serialization predicate is expressed directly in SQL:
        // exclude any pending command whose correlated session already has
        // a dispatched, unacknowledged command. `FOR UPDATE SKIP LOCKED`
        // makes the claim race-free across any number of workers on any
        // number of replicas.
        let rows = sqlx::query(
            r#"
            WITH eligible AS (
                SELECT c.id
                FROM agent_commands c
                WHERE c.status = 'pending'
                  AND c.next_attempt_at <= $3
                  AND NOT EXISTS (
                      SELECT 1 FROM agent_commands d
                      WHERE d.status = 'dispatched'
                        AND d.correlated_session_id IS NOT NULL
                        AND d.correlated_session_id = c.correlated_session_id
                  )
                ORDER BY c.next_attempt_at, c.id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE agent_commands
            SET status = 'dispatched', claimed_by_replica = $1, ack_deadline = $2, updated_at = $3
            WHERE id IN (SELECT id FROM eligible)
            RETURNING *
            "#,
        )
        .bind(replica)
        .bind(ack_deadline)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_command).collect::<Result<_, _>>().map_err(Into::into)
    }

    async fn requeue_command(
        &self,
        id: i64,
        next_attempt_at: DateTime<Utc>,
        attempt: u32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE agent_commands
            SET status = 'pending', attempt = $2, next_attempt_at = $3,
                claimed_by_replica = NULL, ack_deadline = NULL, updated_at = $3
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'expired')
            "#,
        )
        .bind(id)
        .bind(attempt as i32)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn acknowledge_command(
        &self,
        id: i64,
        status: CommandStatus,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let _ = detail;
        sqlx::query(
            r#"
            UPDATE agent_commands
            SET status = $2, ack_deadline = NULL, updated_at = $3
            WHERE id = $1 AND status NOT IN ('completed', 'failed', 'expired')
            "#,
        )
        .bind(id)
        .bind(command_status_to_str(status))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        backoff_next_attempt_at: DateTime<Utc>,
    ) -> Result<ReapOutcome, StoreError> {
        let expired_rows = sqlx::query(
            r#"
            UPDATE agent_commands
            SET status = 'expired', updated_at = $1
            WHERE status = 'dispatched' AND ack_deadline <= $1 AND attempt + 1 >= $2
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(max_attempts as i32)
        .fetch_all(&self.pool)
        .await?;

        let requeued_rows = sqlx::query(
            r#"
            UPDATE agent_commands
            SET status = 'pending', attempt = attempt + 1, next_attempt_at = $3,
                claimed_by_replica = NULL, ack_deadline = NULL, updated_at = $1
            WHERE status = 'dispatched' AND ack_deadline <= $1 AND attempt + 1 < $2
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(max_attempts as i32)
        .bind(backoff_next_attempt_at)
        .fetch_all(&self.pool)
        .await?;

        Ok(ReapOutcome {
            requeued: requeued_rows
                .iter()
                .map(|r| r.try_get::<i64, _>("id"))
                .collect::<Result<_, _>>()?,
            expired: expired_rows
                .iter()
                .map(|r| r.try_get::<i64, _>("id"))
                .collect::<Result<_, _>>()?,
        })
    }

    async fn reconcile_agent_reconnect(
        &self,
        agent_identity: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE agent_commands
            SET status = 'pending', next_attempt_at = $2, claimed_by_replica = NULL, ack_deadline = NULL, updated_at = $2
            WHERE target_agent = $1 AND status IN ('pending', 'dispatched')
            "#,
        )
        .bind(agent_identity)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as u32)
    }
}
