//! Agent Selector: given a new session request, pick exactly one online,
//! uncordoned agent under quota and load constraints. Runs as a single
//! read against the `Store`; deliberately has no reservation step — pick,
//! commit, let commands handle the rest.

use streamspace_protocol::PlatformKind;
use thiserror::Error;

use crate::db::{Agent, Store, StoreError};

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no online agents available")]
    NoAgentsAvailable,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Reads eligible agents, sorts by load then freshness then identity,
/// and returns the head.
pub async fn select_agent(
    store: &dyn Store,
    platform_kind: Option<PlatformKind>,
) -> Result<Agent, SelectError> {
    let mut candidates = store.list_eligible_agents(platform_kind).await?;
    if candidates.is_empty() {
        return Err(SelectError::NoAgentsAvailable);
    }
    candidates.sort_by(|a, b| {
        a.active_sessions
            .cmp(&b.active_sessions)
            .then_with(|| b.last_heartbeat.cmp(&a.last_heartbeat))
            .then_with(|| a.identity.cmp(&b.identity))
    });
    Ok(candidates.into_iter().next().expect("non-empty checked above"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mem_store::MemStore;
    use crate::db::models::AgentOnlineStatus;
    use chrono::Utc;

    fn agent(identity: &str, active_sessions: u32, heartbeat_offset_s: i64) -> Agent {
        Agent {
            identity: identity.to_string(),
            platform_kind: PlatformKind::KubernetesCluster,
            status: AgentOnlineStatus::Online,
            active_sessions,
            last_heartbeat: Utc::now() + chrono::Duration::seconds(heartbeat_offset_s),
            owning_replica: Some("replica-a".into()),
            cordoned: false,
        }
    }

    #[tokio::test]
    async fn picks_least_loaded_agent() {
        let store = MemStore::new();
        store.seed_agent(agent("busy", 5, 0));
        store.seed_agent(agent("idle", 1, 0));
        let chosen = select_agent(store.as_ref(), None).await.unwrap();
        assert_eq!(chosen.identity, "idle");
    }

    #[tokio::test]
    async fn ties_broken_by_freshest_heartbeat_then_identity() {
        let store = MemStore::new();
        store.seed_agent(agent("b", 1, -10));
        store.seed_agent(agent("a", 1, 0));
        let chosen = select_agent(store.as_ref(), None).await.unwrap();
        assert_eq!(chosen.identity, "a");
    }

    #[tokio::test]
    async fn no_agents_available_is_an_error() {
        let store = MemStore::new();
        let err = select_agent(store.as_ref(), None).await.unwrap_err();
        assert!(matches!(err, SelectError::NoAgentsAvailable));
    }

    #[tokio::test]
    async fn cordoned_agents_are_excluded() {
        let store = MemStore::new();
        let mut a = agent("cordoned", 0, 0);
        a.cordoned = true;
        store.seed_agent(a);
        let err = select_agent(store.as_ref(), None).await.unwrap_err();
        assert!(matches!(err, SelectError::NoAgentsAvailable));
    }
}
