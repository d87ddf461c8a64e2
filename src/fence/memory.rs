//! In-Memory Fence Backend
//!
//! Mirrors the Postgres semantics closely enough to drive the coordinator in
//! tests and in single-process embeddings:
//! - rows are locked per key until the owning transaction ends
//! - a conflicting insert waits for the lock, then sees the committed row
//! - writes apply eagerly and are undone on rollback or drop
//! - commit hooks let business code co-commit its own effects

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

use super::config::validate_table_name;
use super::error::FenceError;
use super::status::FenceStatus;
use super::store::{DataSource, FenceLogStore, TransactionManager};
use super::types::FenceLogRecord;

type Table = BTreeMap<(String, i64), FenceLogRecord>;

/// (table, xid, branch_id)
type RowKey = (String, String, i64);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Inner {
    tables: Mutex<HashMap<String, Table>>,
    /// Row locks; an entry is pruned once no transaction holds or awaits it
    row_locks: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
    unavailable: AtomicBool,
}

impl Inner {
    fn check_available(&self) -> Result<(), FenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FenceError::Storage(
                "memory database unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn row_lock(&self, key: &RowKey) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.row_locks).entry(key.clone()).or_default().clone()
    }
}

/// Shared in-memory database; clones see the same data
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation (including commit) fail with a
    /// storage error, simulating lost connectivity
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Committed-or-in-flight view of one row, without locking
    pub fn get(&self, table: &str, xid: &str, branch_id: i64) -> Option<FenceLogRecord> {
        lock(&self.inner.tables)
            .get(table)
            .and_then(|t| t.get(&(xid.to_string(), branch_id)))
            .cloned()
    }

    /// Number of live row-lock entries
    pub fn lock_count(&self) -> usize {
        lock(&self.inner.row_locks).len()
    }

    /// All rows of a table, ordered by key
    pub fn rows(&self, table: &str) -> Vec<FenceLogRecord> {
        lock(&self.inner.tables)
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Write a row directly, bypassing transactions
    pub fn put(&self, table: &str, record: FenceLogRecord) {
        lock(&self.inner.tables)
            .entry(table.to_string())
            .or_default()
            .insert((record.xid.clone(), record.branch_id), record);
    }
}

struct Undo {
    key: RowKey,
    previous: Option<FenceLogRecord>,
}

/// Local transaction on a [`MemoryDatabase`]
///
/// Dropping it without commit rolls back.
pub struct MemoryTx {
    inner: Arc<Inner>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    undo: Vec<Undo>,
    on_commit: Vec<Box<dyn FnOnce() + Send>>,
    finished: bool,
}

impl MemoryTx {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            held: HashMap::new(),
            undo: Vec::new(),
            on_commit: Vec::new(),
            finished: false,
        }
    }

    /// Run `effect` only if this transaction commits
    pub fn on_commit(&mut self, effect: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(effect));
    }

    async fn lock_row(&mut self, key: &RowKey) {
        if self.held.contains_key(key) {
            return;
        }
        let guard = self.inner.row_lock(key).lock_owned().await;
        self.held.insert(key.clone(), guard);
    }

    /// Take a row lock only if nobody else holds it
    fn try_lock_row(&mut self, key: &RowKey) -> bool {
        if self.held.contains_key(key) {
            return true;
        }
        match self.inner.row_lock(key).try_lock_owned() {
            Ok(guard) => {
                self.held.insert(key.clone(), guard);
                true
            }
            Err(_) => false,
        }
    }

    /// Drop every held row lock and prune entries nobody else references
    fn release_locks(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let keys: Vec<RowKey> = self
            .held
            .drain()
            .map(|(key, guard)| {
                drop(guard);
                key
            })
            .collect();

        // Waiters clone the Arc under this mutex, so a count of one is final
        let mut row_locks = lock(&self.inner.row_locks);
        for key in keys {
            if row_locks
                .get(&key)
                .is_some_and(|entry| Arc::strong_count(entry) == 1)
            {
                row_locks.remove(&key);
            }
        }
    }

    fn apply_undo(&mut self) {
        if self.undo.is_empty() {
            return;
        }
        let mut tables = lock(&self.inner.tables);
        for Undo { key, previous } in self.undo.drain(..).rev() {
            let (table, xid, branch_id) = key;
            let rows = tables.entry(table).or_default();
            match previous {
                Some(record) => {
                    rows.insert((xid, branch_id), record);
                }
                None => {
                    rows.remove(&(xid, branch_id));
                }
            }
        }
    }

    fn finish_commit(mut self) {
        self.finished = true;
        self.undo.clear();
        self.release_locks();
        for effect in self.on_commit.drain(..) {
            effect();
        }
    }

    fn finish_rollback(mut self) {
        self.apply_undo();
        self.release_locks();
        self.finished = true;
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            self.apply_undo();
        }
        self.release_locks();
    }
}

#[async_trait]
impl TransactionManager for MemoryDatabase {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, FenceError> {
        self.inner.check_available()?;
        Ok(MemoryTx::new(self.inner.clone()))
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), FenceError> {
        // tx is dropped (and rolled back) on failure
        self.inner.check_available()?;
        tx.finish_commit();
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), FenceError> {
        tx.finish_rollback();
        Ok(())
    }
}

/// Fence log store over one table of a [`MemoryDatabase`]
pub struct MemoryFenceLogStore {
    db: MemoryDatabase,
    table: String,
}

impl MemoryFenceLogStore {
    fn row_key(&self, xid: &str, branch_id: i64) -> RowKey {
        (self.table.clone(), xid.to_string(), branch_id)
    }

    /// Swap a row under the table lock, recording the undo entry
    fn write_row(&self, tx: &mut MemoryTx, key: RowKey, record: Option<FenceLogRecord>) {
        let mut tables = lock(&self.db.inner.tables);
        let rows = tables.entry(self.table.clone()).or_default();
        let row_id = (key.1.clone(), key.2);
        let previous = match record {
            Some(record) => rows.insert(row_id, record),
            None => rows.remove(&row_id),
        };
        tx.undo.push(Undo { key, previous });
    }

    fn read_row(&self, xid: &str, branch_id: i64) -> Option<FenceLogRecord> {
        self.db.get(&self.table, xid, branch_id)
    }
}

#[async_trait]
impl FenceLogStore for MemoryFenceLogStore {
    type Tx = MemoryTx;

    fn table_name(&self) -> &str {
        &self.table
    }

    async fn insert_if_absent(
        &self,
        tx: &mut MemoryTx,
        record: &FenceLogRecord,
    ) -> Result<bool, FenceError> {
        self.db.inner.check_available()?;
        let key = self.row_key(&record.xid, record.branch_id);
        tx.lock_row(&key).await;

        if self.read_row(&record.xid, record.branch_id).is_some() {
            return Ok(false);
        }
        self.write_row(tx, key, Some(record.clone()));
        Ok(true)
    }

    async fn find_by_key(
        &self,
        tx: &mut MemoryTx,
        xid: &str,
        branch_id: i64,
    ) -> Result<Option<FenceLogRecord>, FenceError> {
        self.db.inner.check_available()?;
        tx.lock_row(&self.row_key(xid, branch_id)).await;
        Ok(self.read_row(xid, branch_id))
    }

    async fn update_status(
        &self,
        tx: &mut MemoryTx,
        xid: &str,
        branch_id: i64,
        expected: FenceStatus,
        new_status: FenceStatus,
    ) -> Result<bool, FenceError> {
        self.db.inner.check_available()?;
        let key = self.row_key(xid, branch_id);
        tx.lock_row(&key).await;

        match self.read_row(xid, branch_id) {
            Some(mut record) if record.status == expected => {
                record.status = new_status;
                record.gmt_modified = Utc::now();
                self.write_row(tx, key, Some(record));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_older_than(
        &self,
        tx: &mut MemoryTx,
        cutoff: DateTime<Utc>,
        statuses: &[FenceStatus],
        limit: u32,
    ) -> Result<u64, FenceError> {
        self.db.inner.check_available()?;

        let is_expired =
            |r: &FenceLogRecord| statuses.contains(&r.status) && r.gmt_modified < cutoff;
        let candidates: Vec<(String, i64)> = self
            .db
            .rows(&self.table)
            .into_iter()
            .filter(|r| is_expired(r))
            .map(|r| (r.xid, r.branch_id))
            .collect();

        let mut deleted = 0u64;
        for (xid, branch_id) in candidates {
            if deleted >= u64::from(limit) {
                break;
            }
            let key = self.row_key(&xid, branch_id);
            if !tx.try_lock_row(&key) {
                continue;
            }
            // re-check under the row lock
            if self.read_row(&xid, branch_id).is_some_and(|r| is_expired(&r)) {
                self.write_row(tx, key, None);
                deleted += 1;
            }
        }

        Ok(deleted)
    }
}

impl DataSource for MemoryDatabase {
    type Store = MemoryFenceLogStore;

    fn open_log_store(&self, table_name: &str) -> Result<MemoryFenceLogStore, FenceError> {
        validate_table_name(table_name)?;
        Ok(MemoryFenceLogStore {
            db: self.clone(),
            table: table_name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const TABLE: &str = "tcc_fence_log";

    fn setup() -> (MemoryDatabase, MemoryFenceLogStore) {
        let db = MemoryDatabase::new();
        let store = db.open_log_store(TABLE).unwrap();
        (db, store)
    }

    #[tokio::test]
    async fn test_insert_is_visible_after_commit() {
        let (db, store) = setup();
        let record = FenceLogRecord::new("A", 1, "reserve", FenceStatus::Tried);

        let mut tx = db.begin().await.unwrap();
        assert!(store.insert_if_absent(&mut tx, &record).await.unwrap());
        assert!(!store.insert_if_absent(&mut tx, &record).await.unwrap());
        db.commit(tx).await.unwrap();

        assert_eq!(db.get(TABLE, "A", 1).unwrap().status, FenceStatus::Tried);
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_rows() {
        let (db, store) = setup();
        db.put(TABLE, FenceLogRecord::new("A", 1, "reserve", FenceStatus::Tried));

        let mut tx = db.begin().await.unwrap();
        store
            .insert_if_absent(&mut tx, &FenceLogRecord::new("B", 2, "reserve", FenceStatus::Suspended))
            .await
            .unwrap();
        assert!(
            store
                .update_status(&mut tx, "A", 1, FenceStatus::Tried, FenceStatus::Committed)
                .await
                .unwrap()
        );
        db.rollback(tx).await.unwrap();

        assert_eq!(db.get(TABLE, "A", 1).unwrap().status, FenceStatus::Tried);
        assert!(db.get(TABLE, "B", 2).is_none());
    }

    #[tokio::test]
    async fn test_drop_without_commit_rolls_back() {
        let (db, store) = setup();
        {
            let mut tx = db.begin().await.unwrap();
            store
                .insert_if_absent(&mut tx, &FenceLogRecord::new("A", 1, "reserve", FenceStatus::Tried))
                .await
                .unwrap();
        }
        assert!(db.rows(TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_cas_rejects_unexpected_status() {
        let (db, store) = setup();
        db.put(TABLE, FenceLogRecord::new("A", 1, "reserve", FenceStatus::Committed));

        let mut tx = db.begin().await.unwrap();
        let changed = store
            .update_status(&mut tx, "A", 1, FenceStatus::Tried, FenceStatus::Rollbacked)
            .await
            .unwrap();
        db.commit(tx).await.unwrap();

        assert!(!changed);
        assert_eq!(db.get(TABLE, "A", 1).unwrap().status, FenceStatus::Committed);
    }

    #[tokio::test]
    async fn test_commit_hooks_run_only_on_commit() {
        let db = MemoryDatabase::new();
        let applied = Arc::new(AtomicUsize::new(0));

        let mut tx = db.begin().await.unwrap();
        let counter = applied.clone();
        tx.on_commit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        db.rollback(tx).await.unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 0);

        let mut tx = db.begin().await.unwrap();
        let counter = applied.clone();
        tx.on_commit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        db.commit(tx).await.unwrap();
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_older_than_skips_locked_and_fresh_rows() {
        let (db, store) = setup();
        let old = Utc::now() - chrono::Duration::hours(2);

        for (xid, status) in [
            ("old-committed", FenceStatus::Committed),
            ("old-tried", FenceStatus::Tried),
            ("old-locked", FenceStatus::Rollbacked),
        ] {
            let mut record = FenceLogRecord::new(xid, 1, "reserve", status);
            record.gmt_modified = old;
            db.put(TABLE, record);
        }
        db.put(TABLE, FenceLogRecord::new("fresh", 1, "reserve", FenceStatus::Committed));

        let mut holder = db.begin().await.unwrap();
        store.find_by_key(&mut holder, "old-locked", 1).await.unwrap();

        let mut tx = db.begin().await.unwrap();
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let deleted = store
            .delete_older_than(&mut tx, cutoff, &crate::fence::store::TERMINAL_STATUSES, 100)
            .await
            .unwrap();
        db.commit(tx).await.unwrap();
        db.rollback(holder).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(db.get(TABLE, "old-committed", 1).is_none());
        assert!(db.get(TABLE, "old-tried", 1).is_some());
        assert!(db.get(TABLE, "old-locked", 1).is_some());
        assert!(db.get(TABLE, "fresh", 1).is_some());
    }

    #[tokio::test]
    async fn test_row_locks_pruned_when_transactions_end() {
        let (db, store) = setup();

        let mut tx = db.begin().await.unwrap();
        store
            .insert_if_absent(&mut tx, &FenceLogRecord::new("A", 1, "reserve", FenceStatus::Tried))
            .await
            .unwrap();
        store.find_by_key(&mut tx, "B", 1).await.unwrap();
        assert_eq!(db.lock_count(), 2);
        db.commit(tx).await.unwrap();
        assert_eq!(db.lock_count(), 0);

        let mut tx = db.begin().await.unwrap();
        store.find_by_key(&mut tx, "A", 1).await.unwrap();
        db.rollback(tx).await.unwrap();
        assert_eq!(db.lock_count(), 0);

        {
            let mut tx = db.begin().await.unwrap();
            store.find_by_key(&mut tx, "A", 1).await.unwrap();
        }
        assert_eq!(db.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_row_locks_pruned_after_cleanup() {
        let (db, store) = setup();
        let old = Utc::now() - chrono::Duration::hours(2);
        for i in 0..1000 {
            let mut record = FenceLogRecord::new(format!("xid-{}", i), 1, "reserve", FenceStatus::Committed);
            record.gmt_modified = old;
            db.put(TABLE, record);
        }

        let mut tx = db.begin().await.unwrap();
        let deleted = store
            .delete_older_than(&mut tx, Utc::now(), &crate::fence::store::TERMINAL_STATUSES, 5000)
            .await
            .unwrap();
        db.commit(tx).await.unwrap();

        assert_eq!(deleted, 1000);
        assert!(db.rows(TABLE).is_empty());
        assert_eq!(db.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_contended_lock_survives_until_last_holder() {
        let (db, store) = setup();

        let mut holder = db.begin().await.unwrap();
        store.find_by_key(&mut holder, "A", 1).await.unwrap();

        let waiter = {
            let db = db.clone();
            let store = db.open_log_store(TABLE).unwrap();
            tokio::spawn(async move {
                let mut tx = db.begin().await.unwrap();
                store.find_by_key(&mut tx, "A", 1).await.unwrap();
                db.commit(tx).await.unwrap();
            })
        };
        tokio::task::yield_now().await;

        db.commit(holder).await.unwrap();
        waiter.await.unwrap();
        assert_eq!(db.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_database_fails_operations() {
        let (db, store) = setup();
        let mut tx = db.begin().await.unwrap();

        db.set_unavailable(true);
        let err = store.find_by_key(&mut tx, "A", 1).await.unwrap_err();
        assert!(matches!(err, FenceError::Storage(_)));
        assert!(db.commit(tx).await.is_err());

        db.set_unavailable(false);
        assert!(db.begin().await.is_ok());
    }
}
