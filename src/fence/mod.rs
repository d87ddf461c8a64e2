//! TCC Fence
//!
//! Makes the participant side of TCC (Try-Confirm-Cancel) transactions safe
//! against redelivery and reordering by the transaction coordinator.
//!
//! # Architecture
//!
//! Every phase call for a branch `(xid, branch_id)` runs inside one local
//! transaction together with a row in the fence log table:
//! - **Store** (`tcc_fence_log`): one row per branch, locked while in use
//! - **Coordinator**: reads the row, decides, runs the business call, CAS-es
//! - **Cleaner**: deletes finished rows after the retention window
//!
//! # State Machine
//!
//! ```text
//! (none) --Try-->    TRIED --Confirm--> COMMITTED
//!                      |
//!                      +----Cancel----> ROLLBACKED
//! (none) --Cancel--> SUSPENDED   (null compensation, blocks a late Try)
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Same Transaction**: fence row and business writes commit or roll back together
//! 2. **At Most Once**: a phase's business call runs at most once per branch
//! 3. **No Hanging**: once SUSPENDED, a branch never executes Try
//! 4. **Terminal**: COMMITTED, ROLLBACKED and SUSPENDED never change again

pub mod action;
pub mod cleaner;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod pg;
pub mod runtime;
pub mod state_machine;
pub mod status;
pub mod store;
pub mod types;


// Re-exports for convenience
pub use action::{ActionDescriptor, ActionDescriptorResolver, StaticActionResolver};
pub use cleaner::{CleanerConfig, FenceCleaner};
pub use config::{CleanMode, DEFAULT_LOG_TABLE_NAME, FenceSettings};
pub use coordinator::FenceCoordinator;
pub use error::{FenceError, FenceErrorKind, InvokeError};
pub use memory::{MemoryDatabase, MemoryFenceLogStore, MemoryTx};
pub use pg::{PgFenceLogStore, PgTx};
pub use runtime::{FenceConfig, FenceHandle, FenceRuntime, ResourceRegistry};
pub use status::{FencePhase, FenceStatus};
pub use store::{DataSource, FenceLogStore, StoreTx, TransactionManager};
pub use types::{BranchId, FenceLogRecord, FenceOutcome, Xid};
