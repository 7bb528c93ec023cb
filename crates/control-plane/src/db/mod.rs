pub mod models;
#[cfg(any(test, feature = "test-support"))]
pub mod mem_store;
pub mod sqlx_store;
pub mod store;

pub use models::{Agent, AgentCommand, AgentOnlineStatus, CommandStatus, NewCommand, Session};
pub use sqlx_store::SqlxStore;
pub use store::{ReapOutcome, Store, StoreError};
