//! Session State Machine: the single place that owns the Session row's
//! transitions, driving commands on each desired-state change and
//! reacting to agent status events. Centralizing this table here, rather
//! than spreading it across message handlers, makes the transition rules
//! enforceable by code review and testable in isolation.

use chrono::Utc;
use streamspace_protocol::{CommandPayload, DesiredState, PlatformKind, ResourceRequest, SessionPhase};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{NewCommand, Session, Store, StoreError};
use crate::dispatcher::{self, DispatchError};
use crate::quota::{QuotaError, QuotaLedger};
use crate::selector::{select_agent, SelectError};
use crate::vnc::VncProxy;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no online agents available")]
    NoAgentsAvailable,
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session {0} is in a terminal phase and cannot transition further")]
    Terminal(String),
    #[error("desired state change rejected: {0} is already in flight")]
    AlreadyInFlight(String),
    #[error("quota exceeded for owner {0}")]
    QuotaExceeded(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

impl From<SelectError> for SessionError {
    fn from(e: SelectError) -> Self {
        match e {
            SelectError::NoAgentsAvailable => SessionError::NoAgentsAvailable,
            SelectError::Store(e) => SessionError::Store(e),
        }
    }
}

impl From<QuotaError> for SessionError {
    fn from(e: QuotaError) -> Self {
        match e {
            QuotaError::Exceeded { owner } => SessionError::QuotaExceeded(owner),
        }
    }
}

pub struct CreateSessionRequest {
    pub owner: String,
    pub template_name: String,
    pub required_platform: Option<PlatformKind>,
    pub image: String,
    pub env: Vec<String>,
    pub resources: ResourceRequest,
    pub persistent_home: bool,
}

/// Generates a session identity deterministic in shape from owner +
/// template + a random suffix, e.g. `alice-firefox-browser-a1b2c3`.
fn new_session_identity(owner: &str, template_name: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{owner}-{template_name}-{}", &suffix[..6])
}

/// Creates a session: selects an agent, charges quota, writes the row in
/// `pending`, enqueues `start_session`. Returns the created `Session` on
/// success; when no online agents are available the request returns an
/// error and no row is written, since selection happens before the write.
pub async fn create_session(
    store: &dyn Store,
    quota: &dyn QuotaLedger,
    req: CreateSessionRequest,
) -> Result<Session, SessionError> {
    let agent = select_agent(store, req.required_platform).await?;
    quota.charge(&req.owner, req.resources).await?;

    let now = Utc::now();
    let identity = new_session_identity(&req.owner, &req.template_name);
    let session = Session {
        identity: identity.clone(),
        owner: req.owner.clone(),
        template_name: req.template_name.clone(),
        agent_identity: agent.identity.clone(),
        desired_state: DesiredState::Running,
        phase: SessionPhase::Pending,
        cpu_millis: req.resources.cpu_millis,
        memory_bytes: req.resources.memory_bytes,
        persistent_home: req.persistent_home,
        last_activity: now,
        failure_reason: None,
        created_at: now,
        updated_at: now,
    };
    store.insert_session(session.clone()).await?;

    dispatcher::enqueue(
        store,
        NewCommand {
            target_agent: agent.identity,
            payload: CommandPayload::StartSession {
                session_id: identity,
                owner: req.owner,
                template_name: req.template_name,
                image: req.image,
                env: req.env,
                resources: req.resources,
                persistent_home: req.persistent_home,
            },
        },
    )
    .await?;

    Ok(session)
}

/// The event-driven edges of the session phase transition table: which reported
/// phase, from which current phase, advances the session. Two phases
/// (`running`, `hibernated`) are each reachable from two different
/// current phases (`starting`/`waking` and `hibernating` respectively),
/// which is why this can't be a single global "rank" comparison — a
/// `waking → running` event has a numerically lower target than
/// `hibernating → hibernated`, but both are forward progress.
fn allowed_event_transition(current: SessionPhase, reported: SessionPhase) -> bool {
    matches!(
        (current, reported),
        (SessionPhase::Pending, SessionPhase::Starting)
            | (SessionPhase::Pending, SessionPhase::Failed)
            | (SessionPhase::Starting, SessionPhase::Running)
            | (SessionPhase::Starting, SessionPhase::Failed)
            | (SessionPhase::Hibernating, SessionPhase::Hibernated)
            | (SessionPhase::Waking, SessionPhase::Running)
            | (SessionPhase::Terminating, SessionPhase::Terminated)
    )
}

/// Applies an agent-reported `session_event`. Idempotent under
/// reordering: applying the same event twice, or an event that does not
/// match an allowed forward edge from the session's current phase
/// (a late event for a phase already moved past, or a contract
/// violation), is a no-op.
pub async fn apply_agent_event(
    store: &dyn Store,
    quota: &dyn QuotaLedger,
    session_id: &str,
    reported_phase: SessionPhase,
    detail: Option<String>,
) -> Result<(), SessionError> {
    let session = store
        .get_session(session_id)
        .await?
        .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

    if session.phase.is_terminal() {
        // No further transition from a terminal phase. Duplicate or
        // late terminal events are simply dropped.
        return Ok(());
    }

    if reported_phase == session.phase {
        // Duplicate of the current phase: already applied, no-op.
        return Ok(());
    }

    if !allowed_event_transition(session.phase, reported_phase) {
        tracing::warn!(
            session = session_id,
            current = ?session.phase,
            reported = ?reported_phase,
            "dropping session_event: not a valid forward transition from the current phase"
        );
        return Ok(());
    }

    let now = Utc::now();
    store
        .update_session_phase(session_id, reported_phase, detail, now)
        .await?;

    if reported_phase.is_terminal() {
        // Release exactly what was charged at CreateSession.
        quota
            .release(
                &session.owner,
                ResourceRequest { cpu_millis: session.cpu_millis, memory_bytes: session.memory_bytes },
            )
            .await;
    }

    Ok(())
}

/// Applies a desired-state write. Rejects a second in-flight
/// desired-state change for a session
/// already mid-transition, so concurrent `hibernate`/`wake` requests
/// resolve to exactly one dispatched command.
///
/// A session leaving `running` (hibernate or terminate) must signal the
/// VNC Proxy to close all of its open tunnels (§4.5's lifecycle tie-in);
/// `waking` a hibernated session never has tunnels to close, since none
/// can have been opened while the session wasn't running.
pub async fn set_desired_state(
    store: &dyn Store,
    vnc: &VncProxy,
    session_id: &str,
    desired: DesiredState,
) -> Result<(), SessionError> {
    let session = store
        .get_session(session_id)
        .await?
        .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

    if session.phase.is_terminal() {
        return Err(SessionError::Terminal(session_id.to_string()));
    }

    let (next_phase, payload) = match (session.phase, desired) {
        (SessionPhase::Running, DesiredState::Hibernated) => (
            SessionPhase::Hibernating,
            CommandPayload::HibernateSession { session_id: session_id.to_string() },
        ),
        (SessionPhase::Hibernated, DesiredState::Running) => (
            SessionPhase::Waking,
            CommandPayload::WakeSession { session_id: session_id.to_string() },
        ),
        (_, DesiredState::Terminated) => (
            SessionPhase::Terminating,
            CommandPayload::StopSession { session_id: session_id.to_string() },
        ),
        _ => {
            // A transition is already in flight (e.g. already
            // hibernating, or asking to hibernate while waking); the
            // in-flight one wins, this request is rejected rather than
            // queued twice.
            return Err(SessionError::AlreadyInFlight(session_id.to_string()));
        }
    };

    let now = Utc::now();
    store.update_session_desired_state(session_id, desired, now).await?;
    store.update_session_phase(session_id, next_phase, None, now).await?;
    dispatcher::enqueue(
        store,
        NewCommand { target_agent: session.agent_identity, payload },
    )
    .await?;

    if session.phase == SessionPhase::Running {
        let closed = vnc.close_tunnels_for_session(session_id);
        if !closed.is_empty() {
            tracing::info!(session_id, tunnels = closed.len(), "closed vnc tunnels: session left running");
        }
    }

    Ok(())
}

/// Activity report application: bumps the session's last-activity
/// timestamp from an agent-reported heartbeat.
pub async fn record_activity(store: &dyn Store, session_id: &str) -> Result<(), SessionError> {
    store.record_activity(session_id, Utc::now()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mem_store::MemStore;
    use crate::db::models::{Agent, AgentOnlineStatus};
    use crate::quota::mem::InMemoryQuotaLedger;

    fn resources() -> ResourceRequest {
        ResourceRequest { cpu_millis: 250, memory_bytes: 512 * 1024 * 1024 }
    }

    async fn seed_one_agent(store: &MemStore) {
        store.seed_agent(Agent {
            identity: "k8s-prod".into(),
            platform_kind: PlatformKind::KubernetesCluster,
            status: AgentOnlineStatus::Online,
            active_sessions: 0,
            last_heartbeat: Utc::now(),
            owning_replica: Some("replica-a".into()),
            cordoned: false,
        });
    }

    #[tokio::test]
    async fn happy_path_start_reaches_running() {
        let store = MemStore::new();
        let quota = InMemoryQuotaLedger::new();
        seed_one_agent(&store).await;

        let session = create_session(
            store.as_ref(),
            &quota,
            CreateSessionRequest {
                owner: "alice".into(),
                template_name: "firefox-browser".into(),
                required_platform: None,
                image: "ghcr.io/streamspace/firefox:latest".into(),
                env: vec![],
                resources: resources(),
                persistent_home: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(session.phase, SessionPhase::Pending);
        assert_eq!(session.agent_identity, "k8s-prod");
        assert_eq!(quota.outstanding_for("alice").len(), 1);

        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Starting, None)
            .await
            .unwrap();
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Running, None)
            .await
            .unwrap();

        let updated = store.get_session(&session.identity).await.unwrap().unwrap();
        assert_eq!(updated.phase, SessionPhase::Running);
    }

    #[tokio::test]
    async fn create_session_with_no_agents_returns_error_and_writes_no_row() {
        let store = MemStore::new();
        let quota = InMemoryQuotaLedger::new();
        let err = create_session(
            store.as_ref(),
            &quota,
            CreateSessionRequest {
                owner: "alice".into(),
                template_name: "firefox-browser".into(),
                required_platform: None,
                image: "img".into(),
                env: vec![],
                resources: resources(),
                persistent_home: false,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::NoAgentsAvailable));
        assert_eq!(quota.outstanding_for("alice").len(), 0);
    }

    #[tokio::test]
    async fn late_event_is_dropped() {
        let store = MemStore::new();
        let quota = InMemoryQuotaLedger::new();
        seed_one_agent(&store).await;
        let session = create_session(
            store.as_ref(),
            &quota,
            CreateSessionRequest {
                owner: "alice".into(),
                template_name: "firefox-browser".into(),
                required_platform: None,
                image: "img".into(),
                env: vec![],
                resources: resources(),
                persistent_home: false,
            },
        )
        .await
        .unwrap();
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Running, None)
            .await
            .unwrap();
        // A stale "starting" arrives after "running" was already observed.
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Starting, None)
            .await
            .unwrap();
        let updated = store.get_session(&session.identity).await.unwrap().unwrap();
        assert_eq!(updated.phase, SessionPhase::Running);
    }

    #[tokio::test]
    async fn terminal_phase_releases_quota_once() {
        let store = MemStore::new();
        let quota = InMemoryQuotaLedger::new();
        seed_one_agent(&store).await;
        let session = create_session(
            store.as_ref(),
            &quota,
            CreateSessionRequest {
                owner: "alice".into(),
                template_name: "firefox-browser".into(),
                required_platform: None,
                image: "img".into(),
                env: vec![],
                resources: resources(),
                persistent_home: false,
            },
        )
        .await
        .unwrap();
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Failed, Some("boom".into()))
            .await
            .unwrap();
        assert_eq!(quota.outstanding_for("alice").len(), 0);
        // Duplicate terminal event is a no-op, not a double release.
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Failed, None)
            .await
            .unwrap();
        assert_eq!(quota.outstanding_for("alice").len(), 0);
    }

    #[tokio::test]
    async fn concurrent_hibernate_and_wake_only_one_wins() {
        let store = MemStore::new();
        let quota = InMemoryQuotaLedger::new();
        seed_one_agent(&store).await;
        let session = create_session(
            store.as_ref(),
            &quota,
            CreateSessionRequest {
                owner: "alice".into(),
                template_name: "firefox-browser".into(),
                required_platform: None,
                image: "img".into(),
                env: vec![],
                resources: resources(),
                persistent_home: false,
            },
        )
        .await
        .unwrap();
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Starting, None).await.unwrap();
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Running, None).await.unwrap();

        let vnc = VncProxy::new();
        set_desired_state(store.as_ref(), &vnc, &session.identity, DesiredState::Hibernated).await.unwrap();
        let second = set_desired_state(store.as_ref(), &vnc, &session.identity, DesiredState::Running).await;
        assert!(matches!(second, Err(SessionError::AlreadyInFlight(_))));

        let updated = store.get_session(&session.identity).await.unwrap().unwrap();
        assert_eq!(updated.phase, SessionPhase::Hibernating);
    }

    #[tokio::test]
    async fn hibernate_then_wake_round_trips() {
        let store = MemStore::new();
        let quota = InMemoryQuotaLedger::new();
        seed_one_agent(&store).await;
        let session = create_session(
            store.as_ref(),
            &quota,
            CreateSessionRequest {
                owner: "alice".into(),
                template_name: "firefox-browser".into(),
                required_platform: None,
                image: "img".into(),
                env: vec![],
                resources: resources(),
                persistent_home: false,
            },
        )
        .await
        .unwrap();
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Starting, None).await.unwrap();
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Running, None).await.unwrap();

        let vnc = VncProxy::new();
        set_desired_state(store.as_ref(), &vnc, &session.identity, DesiredState::Hibernated).await.unwrap();
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Hibernated, None).await.unwrap();

        set_desired_state(store.as_ref(), &vnc, &session.identity, DesiredState::Running).await.unwrap();
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Running, None).await.unwrap();

        let updated = store.get_session(&session.identity).await.unwrap().unwrap();
        assert_eq!(updated.phase, SessionPhase::Running);
    }

    /// A session hibernating while it has open VNC tunnels must have all
    /// of them closed as part of the same desired-state write (§4.5's
    /// lifecycle tie-in), not left dangling for the bridging tasks to
    /// notice on their own schedule.
    #[tokio::test]
    async fn hibernating_closes_open_vnc_tunnels() {
        let store = MemStore::new();
        let quota = InMemoryQuotaLedger::new();
        seed_one_agent(&store).await;
        let session = create_session(
            store.as_ref(),
            &quota,
            CreateSessionRequest {
                owner: "alice".into(),
                template_name: "firefox-browser".into(),
                required_platform: None,
                image: "img".into(),
                env: vec![],
                resources: resources(),
                persistent_home: false,
            },
        )
        .await
        .unwrap();
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Starting, None).await.unwrap();
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Running, None).await.unwrap();

        let hub = crate::hub::AgentHub::new(
            "replica-a".into(),
            store.clone(),
            std::sync::Arc::new(crate::registry::Registry::new()),
            std::sync::Arc::new(crate::bus::NoopBus),
            std::time::Duration::from_millis(200),
            chrono::Duration::seconds(90),
        );
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        hub.attach_local("k8s-prod", tx);

        let vnc = VncProxy::new();
        vnc.open_tunnel(store.as_ref(), &hub, &session.identity, "ws://self/tunnels").await.unwrap();
        vnc.open_tunnel(store.as_ref(), &hub, &session.identity, "ws://self/tunnels").await.unwrap();

        set_desired_state(store.as_ref(), &vnc, &session.identity, DesiredState::Hibernated).await.unwrap();
        assert!(vnc.close_tunnels_for_session(&session.identity).is_empty(), "tunnels should already be closed");
    }

    #[test]
    fn waking_to_running_is_allowed_despite_lower_phase_ordinal() {
        // Running is declared earlier in the SessionPhase enum than
        // Waking; a naive "monotonic rank" check would reject this
        // transition even though it is the one the wake path uses to
        // complete.
        assert!(allowed_event_transition(SessionPhase::Waking, SessionPhase::Running));
    }

    #[test]
    fn unrelated_phase_jump_is_not_an_allowed_transition() {
        assert!(!allowed_event_transition(SessionPhase::Running, SessionPhase::Hibernated));
        assert!(!allowed_event_transition(SessionPhase::Pending, SessionPhase::Running));
    }

    #[tokio::test]
    async fn contract_violation_event_is_dropped_and_session_unchanged() {
        let store = MemStore::new();
        let quota = InMemoryQuotaLedger::new();
        seed_one_agent(&store).await;
        let session = create_session(
            store.as_ref(),
            &quota,
            CreateSessionRequest {
                owner: "alice".into(),
                template_name: "firefox-browser".into(),
                required_platform: None,
                image: "img".into(),
                env: vec![],
                resources: resources(),
                persistent_home: false,
            },
        )
        .await
        .unwrap();
        // Session is still `pending`; an agent claiming `hibernated` out
        // of nowhere is a contract violation, not a valid edge.
        apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Hibernated, None)
            .await
            .unwrap();
        let updated = store.get_session(&session.identity).await.unwrap().unwrap();
        assert_eq!(updated.phase, SessionPhase::Pending);
    }
}
