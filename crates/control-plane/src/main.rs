//! StreamSpace control-plane core: agent hub, command dispatcher, agent
//! selector, session state machine, and VNC proxy, all backed by
//! Postgres as the sole source of durable truth.
//!
//! ## Modules
//!
//! - [`hub`] — persistent agent WebSocket connections and routing
//! - [`dispatcher`] — durable command queue, claiming, retry, expiry
//! - [`selector`] — least-loaded eligible agent pick
//! - [`session`] — the session state machine
//! - [`vnc`] — browser <-> agent tunnel bridging
//! - [`registry`] — cross-replica agent-to-replica binding hints
//! - [`api`] — the REST + WebSocket surface this core owns

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use streamspace_control_plane::bus::NoopBus;
use streamspace_control_plane::config::AppConfig;
use streamspace_control_plane::db::SqlxStore;
use streamspace_control_plane::dispatcher::{self, WorkerPoolConfig};
use streamspace_control_plane::hub::{self, AgentHub};
use streamspace_control_plane::quota::NullQuotaLedger;
use streamspace_control_plane::registry::Registry;
use streamspace_control_plane::vnc::VncProxy;
use streamspace_control_plane::{api, AppState};

/// Command-line entry point. Most configuration lives in
/// `streamspace.toml`/`STREAMSPACE_*` env vars; this only tells the
/// process where to look for the former.
#[derive(Parser, Debug)]
#[command(name = "streamspace-control-plane")]
struct Cli {
    /// Directory containing `streamspace.toml`. Defaults to the current
    /// working directory.
    #[arg(long, default_value = ".")]
    config_dir: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamspace_control_plane=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config_dir)?;
    info!(replica_identity = %config.replica_identity, bind_address = %config.bind_address, "loaded configuration");

    let store = SqlxStore::connect(&config.database_url).await?;
    store.migrate().await?;
    let store: Arc<dyn streamspace_control_plane::db::Store> = Arc::new(store);

    let registry = Arc::new(Registry::new());
    let bus = Arc::new(NoopBus);
    let quota = Arc::new(NullQuotaLedger);
    let vnc = Arc::new(VncProxy::new());

    let send_deadline = Duration::from_secs(5);
    let registry_ttl = chrono::Duration::from_std(config.registry_ttl()).unwrap_or(chrono::Duration::seconds(90));
    let agent_hub = Arc::new(AgentHub::new(
        config.replica_identity.clone(),
        store.clone(),
        registry.clone(),
        bus.clone(),
        send_deadline,
        registry_ttl,
    ));

    let sweeper = hub::spawn_sweeper(
        agent_hub.clone(),
        store.clone(),
        registry.clone(),
        config.heartbeat_interval(),
        registry_ttl,
    );

    let worker_config = WorkerPoolConfig {
        worker_count: config.dispatcher_workers as u32,
        claim_deadline: config.command_claim_deadline(),
        backoff_base: Duration::from_millis(500),
        backoff_cap: Duration::from_secs(30),
        idle_poll_interval: Duration::from_millis(200),
    };
    let workers = dispatcher::spawn_workers(store.clone(), agent_hub.clone(), config.replica_identity.clone(), worker_config);

    let reaper = dispatcher::spawn_reaper(
        store.clone(),
        Duration::from_secs(5),
        config.command_max_attempts,
        Duration::from_millis(500),
        Duration::from_secs(30),
    );

    let state = AppState {
        store,
        hub: agent_hub,
        registry,
        bus,
        vnc,
        quota,
        config: Arc::new(config.clone()),
    };

    let app = api::router(state);

    let addr: SocketAddr = config.bind_address.parse()?;
    info!(%addr, "streamspace control plane listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    reaper.abort();
    for w in workers {
        w.abort();
    }

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
