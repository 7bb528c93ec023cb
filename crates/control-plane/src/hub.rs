//! Agent Hub: the server side of persistent agent connections. Owns the
//! *transient* per-replica connection table; durable agent state lives in
//! the `Store`, and cross-replica routing hints live in the `Registry`.
//!
//! Connection state is tracked in per-replica `DashMap`s with an
//! outbound-queue-per-connection pattern: a bounded channel per agent so
//! backpressure is observable instead of the queue growing without limit.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use streamspace_protocol::{HubMessage, PlatformKind};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

use crate::bus::{BusError, ReplicaBus};
use crate::db::Store;
use crate::registry::Registry;

/// Per-agent outbound mailbox. `send_to_agent` treats a full queue past
/// the send deadline as `closed`, the same way the caller treats a
/// network error.
pub type AgentTx = mpsc::Sender<HubMessage>;

struct LocalAgentConn {
    tx: AgentTx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    NoRoute,
    Closed,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("store error: {0}")]
    Store(#[from] crate::db::StoreError),
}

pub struct AgentHub {
    replica_identity: String,
    store: std::sync::Arc<dyn Store>,
    registry: std::sync::Arc<Registry>,
    bus: std::sync::Arc<dyn ReplicaBus>,
    local: DashMap<String, LocalAgentConn>,
    send_deadline: Duration,
    registry_ttl: chrono::Duration,
}

impl AgentHub {
    pub fn new(
        replica_identity: String,
        store: std::sync::Arc<dyn Store>,
        registry: std::sync::Arc<Registry>,
        bus: std::sync::Arc<dyn ReplicaBus>,
        send_deadline: Duration,
        registry_ttl: chrono::Duration,
    ) -> Self {
        Self {
            replica_identity,
            store,
            registry,
            bus,
            local: DashMap::new(),
            send_deadline,
            registry_ttl,
        }
    }

    pub fn replica_identity(&self) -> &str {
        &self.replica_identity
    }

    /// Registers an agent connection. Rejects only when the agent is bound
    /// to a different, still-fresh replica; accepts and (re)binds
    /// otherwise, including reconnects of the same agent to this same
    /// replica.
    pub async fn register(
        &self,
        identity: &str,
        platform_kind: PlatformKind,
    ) -> Result<bool, SendError> {
        let now = Utc::now();
        if self
            .registry
            .is_bound_fresh_elsewhere(identity, &self.replica_identity, now, self.registry_ttl)
        {
            return Ok(false);
        }
        let accepted = self
            .store
            .upsert_agent_registration(identity, platform_kind, &self.replica_identity, now, self.registry_ttl)
            .await?;
        if accepted {
            self.registry.bind(identity, &self.replica_identity, now);
        }
        Ok(accepted)
    }

    /// Called by the connection task once the socket is open and the
    /// reader/writer pair is spawned.
    pub fn attach_local(&self, identity: &str, tx: AgentTx) {
        self.local.insert(identity.to_string(), LocalAgentConn { tx });
    }

    /// Called on disconnect. Does not touch the `Store` row — liveness is
    /// the sweeper's job, based on `last_heartbeat`, so a brief reconnect
    /// race does not spuriously flip an agent offline.
    pub fn detach_local(&self, identity: &str) {
        self.local.remove(identity);
    }

    pub fn is_local(&self, identity: &str) -> bool {
        self.local.contains_key(identity)
    }

    /// Delivers a message to an agent. Local delivery applies backpressure
    /// via `send_deadline`; remote delivery forwards over the replica bus.
    pub async fn send_to_agent(&self, identity: &str, message: HubMessage) -> SendOutcome {
        if let Some(conn) = self.local.get(identity) {
            return match timeout(self.send_deadline, conn.tx.send(message)).await {
                Ok(Ok(())) => SendOutcome::Delivered,
                Ok(Err(_)) => SendOutcome::Closed,
                Err(_) => SendOutcome::Closed,
            };
        }

        let now = Utc::now();
        match self.registry.lookup(identity, now, self.registry_ttl) {
            Some(owning_replica) if owning_replica == self.replica_identity => {
                // Registry says we own it but the local table disagrees:
                // a connection just dropped. Treat as no-route; the
                // sweeper or the agent's own reconnect will resolve it.
                SendOutcome::NoRoute
            }
            Some(owning_replica) => match self.bus.forward(&owning_replica, identity, message).await {
                Ok(()) => SendOutcome::Delivered,
                Err(BusError::NoRoute(_)) => SendOutcome::NoRoute,
                Err(BusError::Rejected(_)) => SendOutcome::Closed,
            },
            None => SendOutcome::NoRoute,
        }
    }

    /// Broadcasts a session update to a set of subscribers: not on the hot
    /// path, so a lookup failure for any one subscriber never blocks the
    /// others.
    pub async fn broadcast_session_update(&self, subscriber_identities: &[String], event: HubMessage) {
        for identity in subscriber_identities {
            let _ = self.send_to_agent(identity, event.clone()).await;
        }
    }
}

/// Liveness sweeper: periodically flips stale online agents to offline,
/// clears the registry binding, and detaches
/// any local connection table entry (the socket itself is closed by its
/// own reader/writer task when it next tries to use a cleared channel).
pub fn spawn_sweeper(
    hub: std::sync::Arc<AgentHub>,
    store: std::sync::Arc<dyn Store>,
    registry: std::sync::Arc<Registry>,
    heartbeat_interval: Duration,
    registry_ttl: chrono::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            match store.list_stale_online_agents(now, registry_ttl).await {
                Ok(stale) => {
                    for agent in stale {
                        warn!(agent = %agent.identity, "sweeper marking agent offline: stale heartbeat");
                        if let Err(e) = store.mark_agent_offline(&agent.identity).await {
                            warn!(agent = %agent.identity, error = %e, "failed to mark agent offline");
                            continue;
                        }
                        registry.remove(&agent.identity);
                        hub.detach_local(&agent.identity);
                    }
                }
                Err(e) => warn!(error = %e, "sweeper failed to list stale agents"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::NoopBus;
    use crate::db::mem_store::MemStore;
    use crate::db::models::AgentOnlineStatus;

    fn hub() -> std::sync::Arc<AgentHub> {
        let store = MemStore::new();
        std::sync::Arc::new(AgentHub::new(
            "replica-a".into(),
            store,
            std::sync::Arc::new(Registry::new()),
            std::sync::Arc::new(NoopBus),
            Duration::from_millis(200),
            chrono::Duration::seconds(90),
        ))
    }

    #[tokio::test]
    async fn send_to_unregistered_agent_is_no_route() {
        let hub = hub();
        let outcome = hub
            .send_to_agent("ghost", HubMessage::Ping { nonce: "n".into() })
            .await;
        assert_eq!(outcome, SendOutcome::NoRoute);
    }

    #[tokio::test]
    async fn send_to_local_agent_delivers() {
        let hub = hub();
        let (tx, mut rx) = mpsc::channel(8);
        hub.attach_local("agent-1", tx);
        let outcome = hub
            .send_to_agent("agent-1", HubMessage::Ping { nonce: "n".into() })
            .await;
        assert_eq!(outcome, SendOutcome::Delivered);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn send_to_full_queue_past_deadline_is_closed() {
        let hub = hub();
        let (tx, _rx) = mpsc::channel(1);
        // Fill the one slot; the channel itself is never drained, so the
        // next send must block until the deadline and report `closed`.
        tx.try_send(HubMessage::Ping { nonce: "fill".into() }).unwrap();
        hub.attach_local("agent-1", tx);
        let outcome = hub
            .send_to_agent("agent-1", HubMessage::Ping { nonce: "n".into() })
            .await;
        assert_eq!(outcome, SendOutcome::Closed);
    }

    #[tokio::test]
    async fn register_rejects_when_bound_fresh_on_another_replica() {
        let store = MemStore::new();
        let registry = std::sync::Arc::new(Registry::new());
        registry.bind("agent-1", "replica-other", Utc::now());
        let hub = AgentHub::new(
            "replica-a".into(),
            store.clone(),
            registry,
            std::sync::Arc::new(NoopBus),
            Duration::from_millis(200),
            chrono::Duration::seconds(90),
        );
        let accepted = hub.register("agent-1", PlatformKind::Other).await.unwrap();
        assert!(!accepted);
    }

    #[tokio::test]
    async fn register_accepts_fresh_agent_and_binds_registry() {
        let store = MemStore::new();
        let registry = std::sync::Arc::new(Registry::new());
        let hub = AgentHub::new(
            "replica-a".into(),
            store.clone(),
            registry.clone(),
            std::sync::Arc::new(NoopBus),
            Duration::from_millis(200),
            chrono::Duration::seconds(90),
        );
        let accepted = hub.register("agent-1", PlatformKind::DockerHost).await.unwrap();
        assert!(accepted);
        let agent = store.get_agent("agent-1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentOnlineStatus::Online);
        assert_eq!(registry.lookup("agent-1", Utc::now(), chrono::Duration::seconds(90)), Some("replica-a".into()));
    }
}
