//! Fence Store Abstractions
//!
//! The fence log never commits on its own. Every store call runs inside a
//! local transaction opened by a [`TransactionManager`], and the same
//! transaction is handed to the business call so both commit together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::FenceError;
use super::status::FenceStatus;
use super::types::FenceLogRecord;

/// Statuses the cleaner may delete
pub const TERMINAL_STATUSES: [FenceStatus; 3] = [
    FenceStatus::Committed,
    FenceStatus::Rollbacked,
    FenceStatus::Suspended,
];

/// Opens, commits and rolls back local transactions
#[async_trait]
pub trait TransactionManager: Send + Sync {
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, FenceError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), FenceError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), FenceError>;
}

/// Fence log table operations
///
/// All writes go through the caller's transaction.
#[async_trait]
pub trait FenceLogStore: Send + Sync {
    type Tx: Send;

    /// Table this store reads and writes
    fn table_name(&self) -> &str;

    /// Insert the record unless (xid, branch_id) already exists
    ///
    /// Returns false on a key conflict. A conflicting insert from another
    /// in-flight transaction blocks until that transaction ends.
    async fn insert_if_absent(
        &self,
        tx: &mut Self::Tx,
        record: &FenceLogRecord,
    ) -> Result<bool, FenceError>;

    /// Read a record and lock it until the transaction ends
    async fn find_by_key(
        &self,
        tx: &mut Self::Tx,
        xid: &str,
        branch_id: i64,
    ) -> Result<Option<FenceLogRecord>, FenceError>;

    /// Atomic CAS update: change status only if it currently equals `expected`
    ///
    /// Returns true if a row changed.
    async fn update_status(
        &self,
        tx: &mut Self::Tx,
        xid: &str,
        branch_id: i64,
        expected: FenceStatus,
        new_status: FenceStatus,
    ) -> Result<bool, FenceError>;

    /// Delete up to `limit` records with a status in `statuses` whose
    /// `gmt_modified` is before `cutoff`. Rows locked by other transactions
    /// are skipped.
    async fn delete_older_than(
        &self,
        tx: &mut Self::Tx,
        cutoff: DateTime<Utc>,
        statuses: &[FenceStatus],
        limit: u32,
    ) -> Result<u64, FenceError>;
}

/// A database handle that can open fence log stores
pub trait DataSource: Send + Sync {
    type Store: FenceLogStore;

    /// Bind a log store to `table_name` (validated as an SQL identifier)
    fn open_log_store(&self, table_name: &str) -> Result<Self::Store, FenceError>;
}

/// Transaction type shared by a data source's store and its manager
pub type StoreTx<D> = <<D as DataSource>::Store as FenceLogStore>::Tx;
