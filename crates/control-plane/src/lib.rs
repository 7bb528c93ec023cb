//! StreamSpace control-plane core: Agent Hub, Command Dispatcher, Agent
//! Selector, Session State Machine, and VNC Proxy, backed by a
//! relational store that is the sole source of durable truth.
//!
//! This crate is organized leaves-first: relational store → cross-replica
//! registry → Agent Hub → Command Dispatcher → Agent Selector → Session
//! state machine → VNC Proxy.

pub mod api;
pub mod bus;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod quota;
pub mod registry;
pub mod selector;
pub mod session;
pub mod vnc;

use std::sync::Arc;

use crate::bus::ReplicaBus;
use crate::config::AppConfig;
use crate::db::Store;
use crate::hub::AgentHub;
use crate::quota::QuotaLedger;
use crate::registry::Registry;
use crate::vnc::VncProxy;

/// Shared application state, cloned into every Axum handler: the full set
/// of components this control plane composes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub hub: Arc<AgentHub>,
    pub registry: Arc<Registry>,
    pub bus: Arc<dyn ReplicaBus>,
    pub vnc: Arc<VncProxy>,
    pub quota: Arc<dyn QuotaLedger>,
    pub config: Arc<AppConfig>,
}
