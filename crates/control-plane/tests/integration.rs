//! Cross-module integration tests: these exercise the Session State
//! Machine, Command Dispatcher, and Agent Hub together against the
//! in-memory fake `Store`, the way a real deployment's request → enqueue
//! → deliver → ack → event loop runs end to end, but without a live
//! Postgres instance or a real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use streamspace_control_plane::bus::NoopBus;
use streamspace_control_plane::db::mem_store::MemStore;
use streamspace_control_plane::db::models::{Agent, AgentOnlineStatus};
use streamspace_control_plane::db::{CommandStatus, Store};
use streamspace_control_plane::dispatcher;
use streamspace_control_plane::hub::AgentHub;
use streamspace_control_plane::quota::mem::InMemoryQuotaLedger;
use streamspace_control_plane::registry::Registry;
use streamspace_control_plane::session::{self, CreateSessionRequest};
use streamspace_protocol::{CommandResult, HubMessage, PlatformKind, ResourceRequest, SessionPhase};

fn hub(store: Arc<dyn Store>) -> Arc<AgentHub> {
    Arc::new(AgentHub::new(
        "replica-a".into(),
        store,
        Arc::new(Registry::new()),
        Arc::new(NoopBus),
        Duration::from_millis(200),
        chrono::Duration::seconds(90),
    ))
}

fn resources() -> ResourceRequest {
    ResourceRequest { cpu_millis: 250, memory_bytes: 512 * 1024 * 1024 }
}

async fn seed_online_agent(store: &MemStore, identity: &str) {
    store.seed_agent(Agent {
        identity: identity.into(),
        platform_kind: PlatformKind::KubernetesCluster,
        status: AgentOnlineStatus::Online,
        active_sessions: 0,
        last_heartbeat: Utc::now(),
        owning_replica: Some("replica-a".into()),
        cordoned: false,
    });
}

/// Alice requests `firefox-browser`, the one online agent `k8s-prod` is
/// selected, `start_session` is dispatched and delivered, the agent acks
/// and reports `running`.
#[tokio::test]
async fn happy_path_start_delivers_command_and_reaches_running() {
    let store = MemStore::new();
    seed_online_agent(&store, "k8s-prod").await;
    let quota = InMemoryQuotaLedger::new();
    let hub = hub(store.clone());

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    hub.attach_local("k8s-prod", tx);

    let session = session::create_session(
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
    assert_eq!(session.agent_identity, "k8s-prod");
    assert_eq!(session.phase, SessionPhase::Pending);

    // One worker iteration claims and delivers the enqueued start_session.
    let claimed = dispatcher::run_once(
        store.as_ref(),
        hub.as_ref(),
        "replica-a",
        Duration::from_secs(60),
        Duration::from_millis(10),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(claimed, 1);

    let delivered = rx.recv().await.expect("start_session delivered to agent");
    let command_id = match delivered {
        HubMessage::Command { command_id, payload } => {
            assert_eq!(payload.correlated_session_id(), Some(session.identity.as_str()));
            command_id
        }
        other => panic!("unexpected message: {other:?}"),
    };

    // Agent acknowledges and reports its lifecycle.
    dispatcher::acknowledge(store.as_ref(), command_id, CommandResult::Completed, None)
        .await
        .unwrap();
    session::apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Starting, None)
        .await
        .unwrap();
    session::apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Running, None)
        .await
        .unwrap();

    let final_session = store.get_session(&session.identity).await.unwrap().unwrap();
    assert_eq!(final_session.phase, SessionPhase::Running);
    let final_command = store.get_command(command_id).await.unwrap().unwrap();
    assert_eq!(final_command.status, CommandStatus::Completed);
}

/// No online agent: the session row is never written.
#[tokio::test]
async fn no_online_agents_writes_no_session_row() {
    let store = MemStore::new();
    let quota = InMemoryQuotaLedger::new();

    let err = session::create_session(
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
    .await;
    assert!(err.is_err());
    assert_eq!(store.session_count(), 0);
}

/// The agent's socket drops mid-start; a worker pass observes `closed`
/// and requeues with backoff, then a reconnect resets the command to
/// `pending` immediately (reconciliation) preserving the attempt count,
/// and the next pass delivers it.
#[tokio::test]
async fn agent_crash_mid_start_recovers_on_reconnect() {
    let store = MemStore::new();
    seed_online_agent(&store, "k8s-prod").await;
    let quota = InMemoryQuotaLedger::new();
    let hub = hub(store.clone());

    let session = session::create_session(
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

    // No local connection attached yet: delivery fails with no-route and
    // the command is requeued with a bumped attempt count.
    dispatcher::run_once(
        store.as_ref(),
        hub.as_ref(),
        "replica-a",
        Duration::from_secs(60),
        Duration::from_millis(10),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    // The agent reconnects: reconciliation resets pending/dispatched
    // commands for it to immediately eligible, preserving attempt counts.
    let reset = dispatcher::reconcile_agent_reconnect(store.as_ref(), "k8s-prod").await.unwrap();
    assert_eq!(reset, 1);

    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    hub.attach_local("k8s-prod", tx);

    let claimed = dispatcher::run_once(
        store.as_ref(),
        hub.as_ref(),
        "replica-a",
        Duration::from_secs(60),
        Duration::from_millis(10),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(claimed, 1);
    assert!(rx.recv().await.is_some());

    session::apply_agent_event(store.as_ref(), &quota, &session.identity, SessionPhase::Running, None)
        .await
        .unwrap();
    let final_session = store.get_session(&session.identity).await.unwrap().unwrap();
    assert_eq!(final_session.phase, SessionPhase::Running);
}

/// At most one in-flight mutating command per session. With a
/// `stop_session` already dispatched (unacknowledged), a second mutating
/// command enqueued for the same session is not claimable until the first
/// is acknowledged.
#[tokio::test]
async fn per_session_serialization_blocks_second_mutating_command() {
    let store = MemStore::new();
    seed_online_agent(&store, "k8s-prod").await;
    let quota = InMemoryQuotaLedger::new();
    let hub = hub(store.clone());
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    hub.attach_local("k8s-prod", tx.clone());

    let session = session::create_session(
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

    // Claim + deliver the start_session, leaving it dispatched/unacked.
    let claimed = dispatcher::run_once(
        store.as_ref(),
        hub.as_ref(),
        "replica-a",
        Duration::from_secs(60),
        Duration::from_millis(10),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(claimed, 1);
    rx.recv().await.unwrap();

    // A second mutating command for the same session (e.g. a stop request
    // racing the still-in-flight start) must not be claimable yet.
    dispatcher::enqueue(
        store.as_ref(),
        streamspace_control_plane::db::NewCommand {
            target_agent: "k8s-prod".into(),
            payload: streamspace_protocol::CommandPayload::StopSession { session_id: session.identity.clone() },
        },
    )
    .await
    .unwrap();

    let claimed_while_blocked = dispatcher::run_once(
        store.as_ref(),
        hub.as_ref(),
        "replica-a",
        Duration::from_secs(60),
        Duration::from_millis(10),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(claimed_while_blocked, 0, "second mutating command must wait for the first to be acked");
}

/// Registry TTL expiry: a binding older than the TTL is routing-
/// equivalent to no binding at all.
#[tokio::test]
async fn registry_entry_expires_after_ttl() {
    let registry = Registry::new();
    let t0 = Utc::now();
    registry.bind("agent-1", "replica-a", t0);
    assert_eq!(registry.lookup("agent-1", t0, chrono::Duration::seconds(90)), Some("replica-a".into()));
    let later = t0 + chrono::Duration::seconds(200);
    assert_eq!(registry.lookup("agent-1", later, chrono::Duration::seconds(90)), None);
}
