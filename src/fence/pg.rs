//! PostgreSQL Fence Log Store
//!
//! `PgPool` acts both as the data source and the transaction manager; the
//! local transaction is a plain `sqlx::Transaction`, so business code can run
//! its own statements on it and they commit together with the fence row.
//! All status updates use atomic CAS (Compare-And-Swap) operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;

use super::config::validate_table_name;
use super::error::FenceError;
use super::status::FenceStatus;
use super::store::{DataSource, FenceLogStore, TransactionManager};
use super::types::{FenceLogRecord, MAX_ACTION_NAME_LEN, MAX_XID_LEN};

/// Local transaction type for the Postgres backend
pub type PgTx = Transaction<'static, Postgres>;

/// SQL statements with the table name already spliced in
#[derive(Debug, Clone)]
struct Statements {
    insert: String,
    select_for_update: String,
    update_status: String,
    delete_older_than: String,
}

impl Statements {
    fn for_table(table: &str) -> Self {
        Self {
            insert: format!(
                r#"
                INSERT INTO {table}
                    (xid, branch_id, action_name, status, gmt_create, gmt_modified)
                VALUES
                    ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (xid, branch_id) DO NOTHING
                "#
            ),
            select_for_update: format!(
                r#"
                SELECT xid, branch_id, action_name, status, gmt_create, gmt_modified
                FROM {table}
                WHERE xid = $1 AND branch_id = $2
                FOR UPDATE
                "#
            ),
            update_status: format!(
                r#"
                UPDATE {table}
                SET status = $1, gmt_modified = $2
                WHERE xid = $3 AND branch_id = $4 AND status = $5
                "#
            ),
            delete_older_than: format!(
                r#"
                DELETE FROM {table}
                WHERE (xid, branch_id) IN (
                    SELECT xid, branch_id FROM {table}
                    WHERE status = ANY($1) AND gmt_modified < $2
                    LIMIT $3
                    FOR UPDATE SKIP LOCKED
                )
                "#
            ),
        }
    }
}

/// Fence log store backed by a PostgreSQL table
pub struct PgFenceLogStore {
    pool: PgPool,
    table: String,
    sql: Statements,
}

impl PgFenceLogStore {
    pub fn new(pool: PgPool, table: &str) -> Result<Self, FenceError> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            sql: Statements::for_table(table),
        })
    }

    /// Create the fence log table and its cleanup index if missing
    pub async fn ensure_schema(&self) -> Result<(), FenceError> {
        sqlx::query(&create_table_sql(&self.table))
            .execute(&self.pool)
            .await?;
        sqlx::query(&create_index_sql(&self.table))
            .execute(&self.pool)
            .await?;

        info!(table = %self.table, "Fence log schema ready");
        Ok(())
    }

    fn row_to_record(row: &PgRow) -> Result<FenceLogRecord, FenceError> {
        let status_id: i16 = row.try_get("status")?;
        let status = FenceStatus::from_id(status_id)
            .ok_or_else(|| FenceError::Storage(format!("Invalid status ID: {}", status_id)))?;

        Ok(FenceLogRecord {
            xid: row.try_get("xid")?,
            branch_id: row.try_get("branch_id")?,
            action_name: row.try_get("action_name")?,
            status,
            gmt_create: row.try_get("gmt_create")?,
            gmt_modified: row.try_get("gmt_modified")?,
        })
    }
}

fn status_ids(statuses: &[FenceStatus]) -> Vec<i16> {
    statuses.iter().map(FenceStatus::id).collect()
}

fn create_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            xid          VARCHAR({MAX_XID_LEN}) NOT NULL,
            branch_id    BIGINT       NOT NULL,
            action_name  VARCHAR({MAX_ACTION_NAME_LEN})  NOT NULL,
            status       SMALLINT     NOT NULL,
            gmt_create   TIMESTAMPTZ  NOT NULL,
            gmt_modified TIMESTAMPTZ  NOT NULL,
            PRIMARY KEY (xid, branch_id)
        )
        "#
    )
}

fn create_index_sql(table: &str) -> String {
    let bare = table.rsplit('.').next().unwrap_or(table);
    format!("CREATE INDEX IF NOT EXISTS idx_{bare}_status_modified ON {table} (status, gmt_modified)")
}

#[async_trait]
impl FenceLogStore for PgFenceLogStore {
    type Tx = PgTx;

    fn table_name(&self) -> &str {
        &self.table
    }

    async fn insert_if_absent(
        &self,
        tx: &mut PgTx,
        record: &FenceLogRecord,
    ) -> Result<bool, FenceError> {
        let result = sqlx::query(&self.sql.insert)
            .bind(&record.xid)
            .bind(record.branch_id)
            .bind(&record.action_name)
            .bind(record.status.id())
            .bind(record.gmt_create)
            .bind(record.gmt_modified)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_by_key(
        &self,
        tx: &mut PgTx,
        xid: &str,
        branch_id: i64,
    ) -> Result<Option<FenceLogRecord>, FenceError> {
        let row = sqlx::query(&self.sql.select_for_update)
            .bind(xid)
            .bind(branch_id)
            .fetch_optional(&mut **tx)
            .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn update_status(
        &self,
        tx: &mut PgTx,
        xid: &str,
        branch_id: i64,
        expected: FenceStatus,
        new_status: FenceStatus,
    ) -> Result<bool, FenceError> {
        let result = sqlx::query(&self.sql.update_status)
            .bind(new_status.id())
            .bind(Utc::now())
            .bind(xid)
            .bind(branch_id)
            .bind(expected.id())
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_older_than(
        &self,
        tx: &mut PgTx,
        cutoff: DateTime<Utc>,
        statuses: &[FenceStatus],
        limit: u32,
    ) -> Result<u64, FenceError> {
        let result = sqlx::query(&self.sql.delete_older_than)
            .bind(status_ids(statuses))
            .bind(cutoff)
            .bind(i64::from(limit))
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TransactionManager for PgPool {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx, FenceError> {
        Ok(sqlx::Pool::begin(self).await?)
    }

    async fn commit(&self, tx: PgTx) -> Result<(), FenceError> {
        Ok(tx.commit().await?)
    }

    async fn rollback(&self, tx: PgTx) -> Result<(), FenceError> {
        Ok(tx.rollback().await?)
    }
}

impl DataSource for PgPool {
    type Store = PgFenceLogStore;

    fn open_log_store(&self, table_name: &str) -> Result<PgFenceLogStore, FenceError> {
        PgFenceLogStore::new(self.clone(), table_name)
    }
}
