//! In-memory `Store` implementation used by unit and integration tests so
//! state-machine, selector, and dispatcher claim-predicate logic can be
//! exercised without a live Postgres instance. Gated behind a
//! `test-support` feature, and built on `DashMap` for lock-free concurrent
//! registries, matching the production store's concurrency story.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use streamspace_protocol::{DesiredState, PlatformKind, SessionPhase};

use super::models::{Agent, AgentCommand, AgentOnlineStatus, CommandStatus, NewCommand, Session};
use super::store::{ReapOutcome, Store, StoreError};

#[derive(Default)]
pub struct MemStore {
    agents: DashMap<String, Agent>,
    sessions: DashMap<String, Session>,
    commands: DashMap<i64, AgentCommand>,
    next_id: AtomicI64,
}

impl MemStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Test helper: seed an agent directly, bypassing the registration
    /// handshake.
    pub fn seed_agent(&self, agent: Agent) {
        self.agents.insert(agent.identity.clone(), agent);
    }

    /// Test helper: total number of session rows, for asserting that a
    /// failed write path left no row behind.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn upsert_agent_registration(
        &self,
        identity: &str,
        platform_kind: PlatformKind,
        replica: &str,
        now: DateTime<Utc>,
        registry_ttl: chrono::Duration,
    ) -> Result<bool, StoreError> {
        if let Some(existing) = self.agents.get(identity) {
            let fresh = now - existing.last_heartbeat < registry_ttl;
            if let Some(owner) = &existing.owning_replica {
                if owner != replica && fresh && existing.status == AgentOnlineStatus::Online {
                    return Ok(false);
                }
            }
        }
        self.agents.insert(
            identity.to_string(),
            Agent {
                identity: identity.to_string(),
                platform_kind,
                status: AgentOnlineStatus::Online,
                active_sessions: self
                    .agents
                    .get(identity)
                    .map(|a| a.active_sessions)
                    .unwrap_or(0),
                last_heartbeat: now,
                owning_replica: Some(replica.to_string()),
                cordoned: self
                    .agents
                    .get(identity)
                    .map(|a| a.cordoned)
                    .unwrap_or(false),
            },
        );
        Ok(true)
    }

    async fn record_heartbeat(
        &self,
        identity: &str,
        active_sessions: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut agent = self.agents.get_mut(identity).ok_or(StoreError::NotFound)?;
        agent.active_sessions = active_sessions;
        agent.last_heartbeat = now;
        Ok(())
    }

    async fn get_agent(&self, identity: &str) -> Result<Option<Agent>, StoreError> {
        Ok(self.agents.get(identity).map(|a| a.clone()))
    }

    async fn list_eligible_agents(
        &self,
        platform_kind: Option<PlatformKind>,
    ) -> Result<Vec<Agent>, StoreError> {
        Ok(self
            .agents
            .iter()
            .map(|e| e.value().clone())
            .filter(|a| a.status == AgentOnlineStatus::Online && !a.cordoned)
            .filter(|a| platform_kind.map_or(true, |pk| pk == a.platform_kind))
            .collect())
    }

    async fn list_stale_online_agents(
        &self,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<Vec<Agent>, StoreError> {
        Ok(self
            .agents
            .iter()
            .map(|e| e.value().clone())
            .filter(|a| a.status == AgentOnlineStatus::Online)
            .filter(|a| now - a.last_heartbeat >= ttl)
            .collect())
    }

    async fn mark_agent_offline(&self, identity: &str) -> Result<(), StoreError> {
        if let Some(mut agent) = self.agents.get_mut(identity) {
            agent.status = AgentOnlineStatus::Offline;
            agent.owning_replica = None;
        }
        Ok(())
    }

    async fn set_cordoned(&self, identity: &str, cordoned: bool) -> Result<(), StoreError> {
        let mut agent = self.agents.get_mut(identity).ok_or(StoreError::NotFound)?;
        agent.cordoned = cordoned;
        Ok(())
    }

    async fn insert_session(&self, session: Session) -> Result<(), StoreError> {
        self.sessions.insert(session.identity.clone(), session);
        Ok(())
    }

    async fn get_session(&self, identity: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(identity).map(|s| s.clone()))
    }

    async fn update_session_phase(
        &self,
        identity: &str,
        phase: SessionPhase,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut s = self.sessions.get_mut(identity).ok_or(StoreError::NotFound)?;
        s.phase = phase;
        if failure_reason.is_some() {
            s.failure_reason = failure_reason;
        }
        s.updated_at = now;
        Ok(())
    }

    async fn update_session_desired_state(
        &self,
        identity: &str,
        desired: DesiredState,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut s = self.sessions.get_mut(identity).ok_or(StoreError::NotFound)?;
        s.desired_state = desired;
        s.updated_at = now;
        Ok(())
    }

    async fn record_activity(&self, identity: &str, ts: DateTime<Utc>) -> Result<(), StoreError> {
        let mut s = self.sessions.get_mut(identity).ok_or(StoreError::NotFound)?;
        s.last_activity = ts;
        Ok(())
    }

    async fn enqueue_command(
        &self,
        cmd: NewCommand,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.commands.insert(
            id,
            AgentCommand {
                id,
                target_agent: cmd.target_agent,
                correlated_session_id: cmd.payload.correlated_session_id().map(str::to_owned),
                payload: cmd.payload,
                status: CommandStatus::Pending,
                attempt: 0,
                next_attempt_at: now,
                claimed_by_replica: None,
                ack_deadline: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn get_command(&self, id: i64) -> Result<Option<AgentCommand>, StoreError> {
        Ok(self.commands.get(&id).map(|c| c.clone()))
    }

    async fn claim_commands(
        &self,
        replica: &str,
        limit: u32,
        now: DateTime<Utc>,
        ack_deadline: DateTime<Utc>,
    ) -> Result<Vec<AgentCommand>, StoreError> {
        // Sessions that already have an in-flight dispatched command are
        // excluded from claiming a second mutating command.
        let in_flight_sessions: std::collections::HashSet<String> = self
            .commands
            .iter()
            .filter(|c| c.status == CommandStatus::Dispatched)
            .filter_map(|c| c.correlated_session_id.clone())
            .collect();

        let mut eligible: Vec<_> = self
            .commands
            .iter()
            .map(|e| e.value().clone())
            .filter(|c| c.status == CommandStatus::Pending && c.next_attempt_at <= now)
            .filter(|c| {
                c.correlated_session_id
                    .as_ref()
                    .map_or(true, |sid| !in_flight_sessions.contains(sid))
            })
            .collect();
        eligible.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at).then(a.id.cmp(&b.id)));
        eligible.truncate(limit as usize);

        // Re-check in-flight exclusion within this batch too: two pending
        // commands for the same session must not both be claimed in one pass.
        let mut claimed_sessions: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut claimed = Vec::new();
        for c in eligible {
            if let Some(sid) = &c.correlated_session_id {
                if claimed_sessions.contains(sid) {
                    continue;
                }
                claimed_sessions.insert(sid.clone());
            }
            let mut row = self.commands.get_mut(&c.id).unwrap();
            row.status = CommandStatus::Dispatched;
            row.claimed_by_replica = Some(replica.to_string());
            row.ack_deadline = Some(ack_deadline);
            row.updated_at = now;
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn requeue_command(
        &self,
        id: i64,
        next_attempt_at: DateTime<Utc>,
        attempt: u32,
    ) -> Result<(), StoreError> {
        let mut c = self.commands.get_mut(&id).ok_or(StoreError::NotFound)?;
        if c.status.is_terminal() {
            return Ok(());
        }
        c.status = CommandStatus::Pending;
        c.attempt = attempt;
        c.next_attempt_at = next_attempt_at;
        c.claimed_by_replica = None;
        c.ack_deadline = None;
        Ok(())
    }

    async fn acknowledge_command(
        &self,
        id: i64,
        status: CommandStatus,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut c = self.commands.get_mut(&id).ok_or(StoreError::NotFound)?;
        if c.status.is_terminal() {
            // Acking an already-terminal command twice is a no-op.
            return Ok(());
        }
        let _ = detail;
        c.status = status;
        c.updated_at = now;
        c.ack_deadline = None;
        Ok(())
    }

    async fn reap_expired(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        backoff_next_attempt_at: DateTime<Utc>,
    ) -> Result<ReapOutcome, StoreError> {
        let mut outcome = ReapOutcome::default();
        let expired_ids: Vec<i64> = self
            .commands
            .iter()
            .filter(|c| c.status == CommandStatus::Dispatched)
            .filter(|c| c.ack_deadline.is_some_and(|d| d <= now))
            .map(|c| c.id)
            .collect();

        for id in expired_ids {
            let mut c = self.commands.get_mut(&id).unwrap();
            if c.attempt + 1 >= max_attempts {
                c.status = CommandStatus::Expired;
                c.updated_at = now;
                outcome.expired.push(id);
            } else {
                c.status = CommandStatus::Pending;
                c.attempt += 1;
                c.next_attempt_at = backoff_next_attempt_at;
                c.claimed_by_replica = None;
                c.ack_deadline = None;
                c.updated_at = now;
                outcome.requeued.push(id);
            }
        }
        Ok(outcome)
    }

    async fn reconcile_agent_reconnect(
        &self,
        agent_identity: &str,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        // Matches the `sqlx` store's `rows_affected` semantics: every row
        // whose status is `pending` or `dispatched` counts as reset, even
        // if it was already `pending` (its `next_attempt_at` is still
        // bumped to `now`, which is the whole point of reconciliation).
        let mut count = 0u32;
        for mut entry in self.commands.iter_mut() {
            let c = entry.value_mut();
            if c.target_agent != agent_identity {
                continue;
            }
            if c.status == CommandStatus::Pending || c.status == CommandStatus::Dispatched {
                c.status = CommandStatus::Pending;
                c.next_attempt_at = now;
                c.claimed_by_replica = None;
                c.ack_deadline = None;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamspace_protocol::PlatformKind;

    fn agent(identity: &str) -> Agent {
        Agent {
            identity: identity.into(),
            platform_kind: PlatformKind::KubernetesCluster,
            status: AgentOnlineStatus::Online,
            active_sessions: 0,
            last_heartbeat: Utc::now(),
            owning_replica: Some("replica-a".into()),
            cordoned: false,
        }
    }

    #[tokio::test]
    async fn set_cordoned_excludes_agent_from_eligible_list() {
        let store = MemStore::new();
        store.seed_agent(agent("k8s-prod"));
        assert_eq!(store.list_eligible_agents(None).await.unwrap().len(), 1);

        store.set_cordoned("k8s-prod", true).await.unwrap();
        assert!(store.list_eligible_agents(None).await.unwrap().is_empty());

        store.set_cordoned("k8s-prod", false).await.unwrap();
        assert_eq!(store.list_eligible_agents(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn set_cordoned_on_unknown_agent_is_not_found() {
        let store = MemStore::new();
        let err = store.set_cordoned("ghost", true).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }
}
