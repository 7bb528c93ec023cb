//! Replica-to-replica message bus: one topic per replica. Cross-replica
//! routing is a distributed fact, not something a single in-memory map
//! can hold once more than one replica is running.
//!
//! A real multi-process deployment would back this with a network
//! transport (direct replica-to-replica WebSocket upgrades, or a pub/sub
//! broker). This crate defines the seam as a trait so the Agent Hub and
//! VNC Proxy depend on an abstraction; `LoopbackBus` is the in-process
//! stand-in used in tests and in a single-replica deployment.

use async_trait::async_trait;
use streamspace_protocol::HubMessage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no route to replica {0}")]
    NoRoute(String),
    #[error("replica {0} did not accept forwarded message")]
    Rejected(String),
}

/// Forwards a hub-to-agent message to whichever replica owns the agent's
/// live WebSocket.
#[async_trait]
pub trait ReplicaBus: Send + Sync + 'static {
    async fn forward(
        &self,
        replica_identity: &str,
        agent_identity: &str,
        message: HubMessage,
    ) -> Result<(), BusError>;
}

/// No peer replicas are reachable. Correct default for a single-replica
/// deployment: any lookup that resolves to a *different* replica than
/// this process is, by construction, unreachable, so forwarding always
/// fails with `NoRoute` rather than silently dropping the message.
pub struct NoopBus;

#[async_trait]
impl ReplicaBus for NoopBus {
    async fn forward(
        &self,
        replica_identity: &str,
        _agent_identity: &str,
        _message: HubMessage,
    ) -> Result<(), BusError> {
        Err(BusError::NoRoute(replica_identity.to_string()))
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod loopback {
    use super::*;
    use dashmap::DashMap;
    use tokio::sync::mpsc;

    /// In-process stand-in for a network bus: each "replica" registers an
    /// unbounded channel, and `forward` just posts to the target
    /// replica's channel. Lets dispatcher/hub tests exercise cross-replica
    /// forwarding without real sockets.
    #[derive(Default)]
    pub struct LoopbackBus {
        replicas: DashMap<String, mpsc::UnboundedSender<(String, HubMessage)>>,
    }

    impl LoopbackBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn register_replica(&self, replica_identity: &str) -> mpsc::UnboundedReceiver<(String, HubMessage)> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.replicas.insert(replica_identity.to_string(), tx);
            rx
        }
    }

    #[async_trait]
    impl ReplicaBus for LoopbackBus {
        async fn forward(
            &self,
            replica_identity: &str,
            agent_identity: &str,
            message: HubMessage,
        ) -> Result<(), BusError> {
            let tx = self
                .replicas
                .get(replica_identity)
                .ok_or_else(|| BusError::NoRoute(replica_identity.to_string()))?;
            tx.send((agent_identity.to_string(), message))
                .map_err(|_| BusError::Rejected(replica_identity.to_string()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn forward_delivers_to_registered_replica() {
            let bus = LoopbackBus::new();
            let mut rx = bus.register_replica("replica-b");
            bus.forward("replica-b", "agent-1", HubMessage::Ping { nonce: "n1".into() })
                .await
                .unwrap();
            let (agent, msg) = rx.recv().await.unwrap();
            assert_eq!(agent, "agent-1");
            assert!(matches!(msg, HubMessage::Ping { .. }));
        }

        #[tokio::test]
        async fn forward_to_unknown_replica_is_no_route() {
            let bus = LoopbackBus::new();
            let err = bus
                .forward("replica-ghost", "agent-1", HubMessage::Ping { nonce: "n1".into() })
                .await
                .unwrap_err();
            assert!(matches!(err, BusError::NoRoute(_)));
        }
    }
}
