//! Configuration loading: defaults -> `streamspace.toml` -> `STREAMSPACE_*`
//! environment variables, merged with the `config` crate. Grounded in
//! `kimberlite-config`'s `ConfigLoader` (same precedence chain, same
//! default-then-override layering), trimmed to what a single control-plane
//! process needs (no XDG user config, no cluster/tenant sections).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// All recognized configuration options, covering both the control-plane
/// surface and the ambient additions (database, replica identity, tunnel
/// base URL) a deployable process needs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Postgres connection string. No default: a missing value is a
    /// startup-fatal configuration error.
    pub database_url: String,

    pub bind_address: String,

    /// Defaults to a fresh UUID at construction time if left empty so
    /// that an un-pinned deployment still gets a unique identity; see
    /// `AppConfig::load` for where that default is filled in, since
    /// `Default` can't call `uuid::Uuid::new_v4` inside a `const`-style
    /// derive.
    pub replica_identity: String,

    pub heartbeat_interval_s: u64,
    pub ping_timeout_s: u64,
    pub command_claim_deadline_s: u64,
    pub command_max_attempts: u32,
    pub dispatcher_workers: usize,
    pub vnc_tunnel_match_deadline_s: u64,

    /// Externally reachable base URL the agent dials to open its side of
    /// a VNC tunnel, e.g. `ws://streamspace.internal:8080/api/v1/agents/tunnels`.
    /// Distinct from `bind_address` because the process may sit behind a
    /// load balancer or NAT.
    pub tunnel_ws_base_url: String,

    /// TTL for cross-replica registry rows, expressed as a multiple of
    /// `heartbeat_interval_s`. Should be set to at least 3x the heartbeat
    /// interval so a couple of missed beats don't flip an agent's routing
    /// hint stale.
    pub registry_ttl_multiplier: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            bind_address: "0.0.0.0:8080".to_string(),
            replica_identity: String::new(),
            heartbeat_interval_s: 30,
            ping_timeout_s: 60,
            command_claim_deadline_s: 60,
            command_max_attempts: 5,
            dispatcher_workers: 10,
            vnc_tunnel_match_deadline_s: 10,
            tunnel_ws_base_url: "ws://localhost:8080/api/v1/agents/tunnels".to_string(),
            registry_ttl_multiplier: 3,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, an optional `streamspace.toml` in
    /// `project_dir`, and `STREAMSPACE_*` environment variables, in that
    /// precedence order (later sources win).
    pub fn load(project_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let project_dir = project_dir.as_ref();
        let mut builder = config::Config::builder();

        let defaults = AppConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        let file = Self::config_file(project_dir);
        if file.exists() {
            builder = builder.add_source(
                config::File::from(file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("STREAMSPACE")
                .separator("_")
                .try_parsing(true),
        );

        let built = builder.build()?;
        let mut cfg: AppConfig = built.try_deserialize()?;

        if cfg.replica_identity.is_empty() {
            cfg.replica_identity = uuid::Uuid::new_v4().to_string();
        }
        if cfg.database_url.is_empty() {
            anyhow::bail!("database_url is required (STREAMSPACE_DATABASE_URL or streamspace.toml)");
        }

        Ok(cfg)
    }

    fn config_file(project_dir: &Path) -> PathBuf {
        project_dir.join("streamspace.toml")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_s)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_s)
    }

    pub fn command_claim_deadline(&self) -> Duration {
        Duration::from_secs(self.command_claim_deadline_s)
    }

    pub fn vnc_tunnel_match_deadline(&self) -> Duration {
        Duration::from_secs(self.vnc_tunnel_match_deadline_s)
    }

    /// Registry TTL, at least 3x the heartbeat interval.
    pub fn registry_ttl(&self) -> Duration {
        self.heartbeat_interval() * self.registry_ttl_multiplier
    }
}
