//! Command Dispatcher: turns intent into a durable, eventually-delivered,
//! acknowledged command. The claim predicate and atomic status
//! transitions live in `Store`/`SqlxStore` — serialization per session is
//! a SQL predicate, not connection ordering; this module owns the worker
//! pool, backoff policy, and reaper that drive those store operations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use streamspace_protocol::{CommandPayload, CommandResult, HubMessage, SessionPhase};
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{CommandStatus, NewCommand, Store, StoreError};
use crate::hub::{AgentHub, SendOutcome};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("command payload too large")]
    PayloadTooLarge,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Payloads are JSON; this is a generous ceiling well above any realistic
/// `start_session` env/resource block. An oversized payload is rejected
/// at enqueue time rather than silently truncated.
const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Enqueues a durable command. `ping` and `open_vnc_tunnel` never reach
/// here — both are dispatched directly through the Agent Hub, bypassing
/// persistence.
pub async fn enqueue(store: &dyn Store, cmd: NewCommand) -> Result<i64, DispatchError> {
    debug_assert!(
        !matches!(cmd.payload, CommandPayload::OpenVncTunnel { .. }),
        "open_vnc_tunnel must not be persisted"
    );
    let size = serde_json::to_vec(&cmd.payload).map(|v| v.len()).unwrap_or(usize::MAX);
    if size > MAX_PAYLOAD_BYTES {
        return Err(DispatchError::PayloadTooLarge);
    }
    Ok(store.enqueue_command(cmd, Utc::now()).await?)
}

/// Records an acknowledgement. Idempotent: acking an already-terminal
/// command is a no-op at the `Store` layer.
pub async fn acknowledge(
    store: &dyn Store,
    command_id: i64,
    result: CommandResult,
    detail: Option<String>,
) -> Result<(), DispatchError> {
    let status = match result {
        CommandResult::Completed => CommandStatus::Completed,
        CommandResult::Failed => CommandStatus::Failed,
    };
    store.acknowledge_command(command_id, status, detail, Utc::now()).await?;
    Ok(())
}

/// Exponential backoff with jitter, capped. `attempt` is the number of
/// prior attempts (0 on first failure).
pub fn backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << attempt.min(20));
    let capped = exp.min(cap.as_millis());
    let jitter_fraction: f64 = rand::thread_rng().gen_range(0.5..1.0);
    let millis = (capped as f64 * jitter_fraction) as u64;
    Duration::from_millis(millis.max(1))
}

/// Whether this command should short-circuit to `completed` without
/// being sent: its correlated session has already reached a terminal
/// phase, so delivering it would be pointless.
async fn is_moot(store: &dyn Store, payload: &CommandPayload) -> Result<bool, StoreError> {
    let Some(session_id) = payload.correlated_session_id() else {
        return Ok(false);
    };
    let session = store.get_session(session_id).await?;
    Ok(session.map(|s| s.phase.is_terminal()).unwrap_or(true))
}

/// One worker's claim-dispatch loop iteration. Split out from
/// `spawn_workers` so tests can drive a single pass deterministically.
pub async fn run_once(
    store: &dyn Store,
    hub: &AgentHub,
    replica: &str,
    claim_deadline: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
) -> Result<usize, DispatchError> {
    let now = Utc::now();
    let ack_deadline = now + chrono::Duration::from_std(claim_deadline).unwrap_or(chrono::Duration::seconds(60));
    let claimed = store.claim_commands(replica, 1, now, ack_deadline).await?;
    let n = claimed.len();
    for cmd in claimed {
        if is_moot(store, &cmd.payload).await? {
            info!(command_id = cmd.id, "short-circuiting command to completed: session already terminal");
            store
                .acknowledge_command(cmd.id, CommandStatus::Completed, Some("session already terminal".into()), Utc::now())
                .await?;
            continue;
        }

        let outcome = hub
            .send_to_agent(
                &cmd.target_agent,
                HubMessage::Command { command_id: cmd.id, payload: cmd.payload.clone() },
            )
            .await;

        match outcome {
            SendOutcome::Delivered => {
                info!(command_id = cmd.id, agent = %cmd.target_agent, "command delivered");
            }
            SendOutcome::NoRoute | SendOutcome::Closed => {
                let next_attempt = cmd.attempt + 1;
                let delay = backoff(cmd.attempt, backoff_base, backoff_cap);
                warn!(command_id = cmd.id, agent = %cmd.target_agent, ?outcome, attempt = next_attempt, "requeueing command");
                store
                    .requeue_command(
                        cmd.id,
                        Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(1)),
                        next_attempt,
                    )
                    .await?;
            }
        }
    }
    Ok(n)
}

pub struct WorkerPoolConfig {
    pub worker_count: u32,
    pub claim_deadline: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub idle_poll_interval: Duration,
}

pub fn spawn_workers(
    store: Arc<dyn Store>,
    hub: Arc<AgentHub>,
    replica: String,
    config: WorkerPoolConfig,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..config.worker_count)
        .map(|worker_id| {
            let store = store.clone();
            let hub = hub.clone();
            let replica = replica.clone();
            let claim_deadline = config.claim_deadline;
            let backoff_base = config.backoff_base;
            let backoff_cap = config.backoff_cap;
            let idle_poll_interval = config.idle_poll_interval;
            tokio::spawn(async move {
                loop {
                    match run_once(store.as_ref(), hub.as_ref(), &replica, claim_deadline, backoff_base, backoff_cap).await {
                        Ok(0) => tokio::time::sleep(idle_poll_interval).await,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(worker_id, error = %e, "dispatcher worker iteration failed");
                            tokio::time::sleep(idle_poll_interval).await;
                        }
                    }
                }
            })
        })
        .collect()
}

/// Reaper: a separate task that moves commands past their acknowledgement
/// deadline back to pending, or to expired once `max_attempts` is hit.
pub fn spawn_reaper(
    store: Arc<dyn Store>,
    poll_interval: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_cap: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let delay = backoff(0, backoff_base, backoff_cap);
            let next_attempt_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(1));
            match store.reap_expired(now, max_attempts, next_attempt_at).await {
                Ok(outcome) => {
                    if !outcome.requeued.is_empty() || !outcome.expired.is_empty() {
                        info!(requeued = outcome.requeued.len(), expired = outcome.expired.len(), "reaper swept commands");
                    }
                }
                Err(e) => warn!(error = %e, "reaper sweep failed"),
            }
        }
    })
}

/// Reconnection reconciliation: called when an agent transitions
/// offline→online. Resets its pending/timed-out-dispatched commands to
/// pending, preserving attempt counts, so they are picked up by the next
/// worker poll.
pub async fn reconcile_agent_reconnect(store: &dyn Store, agent_identity: &str) -> Result<u32, DispatchError> {
    Ok(store.reconcile_agent_reconnect(agent_identity, Utc::now()).await?)
}
