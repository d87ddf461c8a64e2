//! TCC Fence - idempotency, null-compensation and anti-hanging guard for
//! Try-Confirm-Cancel participants
//!
//! # Modules
//!
//! - [`fence`] - Fence log, coordinator, cleaner and process runtime
//! - [`config`] - YAML application config
//! - [`db`] - PostgreSQL connection pool
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod db;
pub mod fence;
pub mod logging;

// Convenient re-exports at crate root
pub use fence::{
    CleanMode, FenceCoordinator, FenceError, FenceOutcome, FencePhase, FenceRuntime,
    FenceSettings, FenceStatus, InvokeError,
};

/// Fence runtime backed by one PostgreSQL pool for both the log table and
/// local transactions
pub type PgFenceRuntime = FenceRuntime<sqlx::PgPool, sqlx::PgPool>;
