//! Quota accounting seam. The quota object itself (an owner's pod count,
//! CPU, and memory ceilings) belongs to an external REST/CRUD layer out
//! of this repository's scope; the Session State Machine only needs two
//! calls, exactly at `CreateSession` and at the transitions into
//! `terminated`/`failed`.

use async_trait::async_trait;
use streamspace_protocol::ResourceRequest;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("owner {owner} is over quota")]
    Exceeded { owner: String },
}

#[async_trait]
pub trait QuotaLedger: Send + Sync + 'static {
    async fn charge(&self, owner: &str, resources: ResourceRequest) -> Result<(), QuotaError>;

    async fn release(&self, owner: &str, resources: ResourceRequest);
}

/// Always accepts charges and no-ops releases. Correct default when the
/// owning quota store lives outside this repository: this control plane
/// still calls the ledger at the right points, it just has nothing of
/// its own to enforce against.
pub struct NullQuotaLedger;

#[async_trait]
impl QuotaLedger for NullQuotaLedger {
    async fn charge(&self, _owner: &str, _resources: ResourceRequest) -> Result<(), QuotaError> {
        Ok(())
    }

    async fn release(&self, _owner: &str, _resources: ResourceRequest) {}
}

#[cfg(any(test, feature = "test-support"))]
pub mod mem {
    use super::*;
    use dashmap::DashMap;

    /// Tracks charged-but-not-yet-released resources per owner, so tests
    /// can assert that released quota always equals charged quota.
    #[derive(Default)]
    pub struct InMemoryQuotaLedger {
        outstanding: DashMap<String, Vec<ResourceRequest>>,
    }

    impl InMemoryQuotaLedger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn outstanding_for(&self, owner: &str) -> Vec<ResourceRequest> {
            self.outstanding.get(owner).map(|v| v.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl QuotaLedger for InMemoryQuotaLedger {
        async fn charge(&self, owner: &str, resources: ResourceRequest) -> Result<(), QuotaError> {
            self.outstanding.entry(owner.to_string()).or_default().push(resources);
            Ok(())
        }

        async fn release(&self, owner: &str, resources: ResourceRequest) {
            if let Some(mut v) = self.outstanding.get_mut(owner) {
                if let Some(pos) = v.iter().position(|r| *r == resources) {
                    v.remove(pos);
                }
            }
        }
    }
}
