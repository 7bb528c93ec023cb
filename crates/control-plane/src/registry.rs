//! Cross-replica registry: an ephemeral keyed store of
//! `agent:{identity} -> {replica_identity, since}` with a TTL, used purely
//! as a routing hint. Stale entries are self-healing — nothing actively
//! evicts them, a lookup simply treats an entry older than the TTL as
//! absent.
//!
//! Built on `DashMap` for lock-free concurrent access. The registry itself
//! still lives in process memory; a real multi-replica deployment would
//! back this with something like Redis, but the `Registry` API is the
//! seam that swap would happen behind.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone)]
struct RegistryEntry {
    replica_identity: String,
    since: DateTime<Utc>,
}

/// Keyed by agent identity.
#[derive(Default)]
pub struct Registry {
    entries: DashMap<String, RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `agent_identity` to `replica_identity`. Unconditional: callers
    /// (the Agent Hub's `Register` contract) have already decided whether
    /// the takeover is allowed.
    pub fn bind(&self, agent_identity: &str, replica_identity: &str, now: DateTime<Utc>) {
        self.entries.insert(
            agent_identity.to_string(),
            RegistryEntry {
                replica_identity: replica_identity.to_string(),
                since: now,
            },
        );
    }

    /// Returns the owning replica if a binding exists and is still fresh
    /// under `ttl`. A stale or missing entry is routing-equivalent to
    /// "no route" — the caller (Agent Hub `SendToAgent`) should return
    /// `no-route` rather than treat it as an error.
    pub fn lookup(&self, agent_identity: &str, now: DateTime<Utc>, ttl: chrono::Duration) -> Option<String> {
        let entry = self.entries.get(agent_identity)?;
        if now - entry.since < ttl {
            Some(entry.replica_identity.clone())
        } else {
            None
        }
    }

    /// Whether `agent_identity` is bound to `replica_identity` specifically
    /// and that binding is still fresh (used by the registration
    /// rejection rule: a different, still-fresh owner blocks a takeover).
    pub fn is_bound_fresh_elsewhere(
        &self,
        agent_identity: &str,
        replica_identity: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> bool {
        match self.entries.get(agent_identity) {
            Some(entry) => entry.replica_identity != replica_identity && now - entry.since < ttl,
            None => false,
        }
    }

    pub fn remove(&self, agent_identity: &str) {
        self.entries.remove(agent_identity);
    }
}
