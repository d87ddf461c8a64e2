//! Fence Coordinator
//!
//! Entry point for the action-proxy layer. Each phase call runs in exactly
//! one local transaction:
//!
//! 1. read (and lock) the branch row
//! 2. ask the state machine what to do
//! 3. run the business call on the same transaction, if allowed
//! 4. CAS the status, commit
//!
//! Any failure rolls back both the fence row and the business writes.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use super::config::{CleanMode, FenceSettings};
use super::error::{FenceError, InvokeError};
use super::state_machine::{Decision, Violation, decide};
use super::status::{FencePhase, FenceStatus};
use super::store::{FenceLogStore, TERMINAL_STATUSES, TransactionManager};
use super::types::{FenceLogRecord, FenceOutcome, MAX_ACTION_NAME_LEN, MAX_XID_LEN};

/// Resolved plan for one phase call, after any insert has been applied
enum Step {
    Execute { advance: Option<(FenceStatus, FenceStatus)> },
    Skip(FenceStatus),
}

/// Fence Coordinator - guards TCC phase calls with the fence log
pub struct FenceCoordinator<S, M> {
    store: S,
    tx_manager: M,
    settings: FenceSettings,
}

impl<S, M> FenceCoordinator<S, M>
where
    S: FenceLogStore,
    M: TransactionManager<Tx = S::Tx>,
{
    pub fn new(store: S, tx_manager: M, settings: FenceSettings) -> Self {
        Self {
            store,
            tx_manager,
            settings,
        }
    }

    pub fn settings(&self) -> &FenceSettings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one TCC phase under the fence
    ///
    /// `business` receives the local transaction so its writes commit
    /// together with the fence row. It runs at most once per
    /// (xid, branch_id, phase) no matter how often the phase is redelivered.
    pub async fn invoke<T, E, F>(
        &self,
        xid: &str,
        branch_id: i64,
        action_name: &str,
        phase: FencePhase,
        business: F,
    ) -> Result<FenceOutcome<T>, InvokeError<E>>
    where
        F: for<'c> FnOnce(&'c mut S::Tx) -> BoxFuture<'c, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        validate_key(xid, action_name)?;

        let mut tx = self.tx_manager.begin().await?;

        let outcome = match self
            .run_in_tx(&mut tx, xid, branch_id, action_name, phase, business)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(rollback_err) = self.tx_manager.rollback(tx).await {
                    warn!(
                        xid = %xid,
                        branch_id = branch_id,
                        error = %rollback_err,
                        "Fence rollback failed"
                    );
                }
                return Err(e);
            }
        };

        self.tx_manager.commit(tx).await?;

        if self.settings.clean_mode == CleanMode::OnCommit && phase != FencePhase::Try {
            self.sweep_on_commit().await;
        }

        Ok(outcome)
    }

    /// Try phase: run `business` once, recording TRIED
    pub async fn try_phase<T, E, F>(
        &self,
        xid: &str,
        branch_id: i64,
        action_name: &str,
        business: F,
    ) -> Result<FenceOutcome<T>, InvokeError<E>>
    where
        F: for<'c> FnOnce(&'c mut S::Tx) -> BoxFuture<'c, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        self.invoke(xid, branch_id, action_name, FencePhase::Try, business)
            .await
    }

    /// Confirm phase: run `business` once, TRIED -> COMMITTED
    pub async fn confirm<T, E, F>(
        &self,
        xid: &str,
        branch_id: i64,
        action_name: &str,
        business: F,
    ) -> Result<FenceOutcome<T>, InvokeError<E>>
    where
        F: for<'c> FnOnce(&'c mut S::Tx) -> BoxFuture<'c, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        self.invoke(xid, branch_id, action_name, FencePhase::Confirm, business)
            .await
    }

    /// Cancel phase: run `business` once, TRIED -> ROLLBACKED, or record
    /// SUSPENDED when no Try was seen
    pub async fn cancel<T, E, F>(
        &self,
        xid: &str,
        branch_id: i64,
        action_name: &str,
        business: F,
    ) -> Result<FenceOutcome<T>, InvokeError<E>>
    where
        F: for<'c> FnOnce(&'c mut S::Tx) -> BoxFuture<'c, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        self.invoke(xid, branch_id, action_name, FencePhase::Cancel, business)
            .await
    }

    async fn run_in_tx<T, E, F>(
        &self,
        tx: &mut S::Tx,
        xid: &str,
        branch_id: i64,
        action_name: &str,
        phase: FencePhase,
        business: F,
    ) -> Result<FenceOutcome<T>, InvokeError<E>>
    where
        F: for<'c> FnOnce(&'c mut S::Tx) -> BoxFuture<'c, Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        let advance = match self.plan(tx, xid, branch_id, action_name, phase).await? {
            Step::Skip(status) => return Ok(FenceOutcome::Skipped(status)),
            Step::Execute { advance } => advance,
        };

        let value = business(&mut *tx).await.map_err(InvokeError::Business)?;

        if let Some((from, to)) = advance {
            if !self
                .store
                .update_status(tx, xid, branch_id, from, to)
                .await?
            {
                error!(
                    xid = %xid,
                    branch_id = branch_id,
                    phase = %phase,
                    "Fence CAS failed after business call (status changed underneath)"
                );
                return Err(FenceError::StatusConflict {
                    xid: xid.to_string(),
                    branch_id,
                    expected: from,
                }
                .into());
            }
            info!(
                xid = %xid,
                branch_id = branch_id,
                action = %action_name,
                from = %from,
                to = %to,
                "Fence branch advanced"
            );
        }

        Ok(FenceOutcome::Executed(value))
    }

    /// Apply the state machine's decision up to (not including) the business
    /// call. A lost insert race re-reads the row and decides again.
    async fn plan(
        &self,
        tx: &mut S::Tx,
        xid: &str,
        branch_id: i64,
        action_name: &str,
        phase: FencePhase,
    ) -> Result<Step, FenceError> {
        const MAX_ATTEMPTS: usize = 2;

        for attempt in 0..MAX_ATTEMPTS {
            let current = self.store.find_by_key(tx, xid, branch_id).await?;
            let decision = decide(phase, current.as_ref().map(|r| r.status));

            match decision {
                Decision::Begin => {
                    let record = FenceLogRecord::new(xid, branch_id, action_name, FenceStatus::Tried);
                    if self.store.insert_if_absent(tx, &record).await? {
                        debug!(xid = %xid, branch_id = branch_id, action = %action_name, "Fence TRIED recorded");
                        return Ok(Step::Execute { advance: None });
                    }
                }
                Decision::Suspend => {
                    let record =
                        FenceLogRecord::new(xid, branch_id, action_name, FenceStatus::Suspended);
                    if self.store.insert_if_absent(tx, &record).await? {
                        warn!(
                            xid = %xid,
                            branch_id = branch_id,
                            action = %action_name,
                            "Cancel arrived before Try - branch SUSPENDED (null compensation)"
                        );
                        return Ok(Step::Skip(FenceStatus::Suspended));
                    }
                }
                Decision::Advance { from, to } => {
                    return Ok(Step::Execute {
                        advance: Some((from, to)),
                    });
                }
                Decision::Skip(status) => {
                    if (phase == FencePhase::Confirm && status == FenceStatus::Rollbacked)
                        || (phase == FencePhase::Cancel && status == FenceStatus::Committed)
                    {
                        warn!(
                            xid = %xid,
                            branch_id = branch_id,
                            phase = %phase,
                            status = %status,
                            "Phase arrived after the opposite outcome - ignored"
                        );
                    } else {
                        debug!(xid = %xid, branch_id = branch_id, phase = %phase, status = %status, "Duplicate phase call skipped");
                    }
                    return Ok(Step::Skip(status));
                }
                Decision::Reject(violation) => {
                    return self.reject(xid, branch_id, phase, violation);
                }
            }

            debug!(
                xid = %xid,
                branch_id = branch_id,
                attempt = attempt,
                "Fence insert lost a race, re-reading"
            );
        }

        // Row vanished between the conflicting insert and the re-read
        Err(FenceError::StatusConflict {
            xid: xid.to_string(),
            branch_id,
            expected: phase.target_status(),
        })
    }

    fn reject(
        &self,
        xid: &str,
        branch_id: i64,
        phase: FencePhase,
        violation: Violation,
    ) -> Result<Step, FenceError> {
        match violation {
            Violation::DuplicateTry(status) => {
                warn!(
                    xid = %xid,
                    branch_id = branch_id,
                    status = %status,
                    "Try refused - branch already has a fence record"
                );
                Err(FenceError::DuplicateBranch {
                    xid: xid.to_string(),
                    branch_id,
                    status,
                })
            }
            Violation::MissingRecord if self.settings.clean_mode == CleanMode::OnCommit => {
                // Finished rows are swept after commit in this mode, so a
                // Confirm past the retention window finds nothing
                warn!(
                    xid = %xid,
                    branch_id = branch_id,
                    "Confirm found no fence record - treating as already committed"
                );
                Ok(Step::Skip(FenceStatus::Committed))
            }
            Violation::MissingRecord => {
                error!(xid = %xid, branch_id = branch_id, phase = %phase, "Fence record not found");
                Err(FenceError::RecordNotFound {
                    xid: xid.to_string(),
                    branch_id,
                })
            }
            Violation::ConfirmAfterSuspend => {
                error!(
                    xid = %xid,
                    branch_id = branch_id,
                    "CRITICAL: Confirm on a SUSPENDED branch - needs manual intervention"
                );
                Err(FenceError::InconsistentState {
                    xid: xid.to_string(),
                    branch_id,
                    phase,
                    status: FenceStatus::Suspended,
                })
            }
        }
    }

    /// Best-effort sweep after a Confirm/Cancel commit (ON_COMMIT mode)
    ///
    /// Deletes one batch of terminal rows past the retention window. Newer
    /// rows stay as tombstones so redelivered calls keep hitting them.
    async fn sweep_on_commit(&self) {
        let result = match self.settings.retention_cutoff(Utc::now()) {
            Ok(cutoff) => self.clean_batch(cutoff).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(0) => {}
            Ok(deleted) => debug!(count = deleted, "Expired fence records cleaned on commit"),
            Err(e) => warn!(error = %e, "Fence cleanup on commit failed (left for later)"),
        }
    }

    /// Delete up to one batch of expired terminal rows in its own transaction
    async fn clean_batch(&self, cutoff: DateTime<Utc>) -> Result<u64, FenceError> {
        let mut tx = self.tx_manager.begin().await?;
        match self
            .store
            .delete_older_than(&mut tx, cutoff, &TERMINAL_STATUSES, self.settings.clean_batch_size)
            .await
        {
            Ok(deleted) => {
                self.tx_manager.commit(tx).await?;
                Ok(deleted)
            }
            Err(e) => {
                let _ = self.tx_manager.rollback(tx).await;
                Err(e)
            }
        }
    }

    /// Delete terminal records whose last change is before `cutoff`
    ///
    /// Runs one local transaction per batch of `clean_batch_size` rows until
    /// a batch comes back short. TRIED rows are never touched.
    pub async fn clean_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, FenceError> {
        let batch_size = self.settings.clean_batch_size;
        let mut total = 0u64;

        loop {
            let deleted = self.clean_batch(cutoff).await?;
            total += deleted;
            if deleted < u64::from(batch_size) {
                break;
            }
        }

        Ok(total)
    }

    /// Read a branch record (diagnostics)
    pub async fn find(
        &self,
        xid: &str,
        branch_id: i64,
    ) -> Result<Option<FenceLogRecord>, FenceError> {
        let mut tx = self.tx_manager.begin().await?;
        let result = self.store.find_by_key(&mut tx, xid, branch_id).await;
        self.tx_manager.rollback(tx).await?;
        result
    }
}

/// Reject keys the fence log columns cannot hold
fn validate_key(xid: &str, action_name: &str) -> Result<(), FenceError> {
    if xid.is_empty() {
        return Err(FenceError::InvalidArgument("xid must not be empty".to_string()));
    }
    if xid.chars().count() > MAX_XID_LEN {
        return Err(FenceError::InvalidArgument(format!(
            "xid longer than {} characters",
            MAX_XID_LEN
        )));
    }
    if action_name.chars().count() > MAX_ACTION_NAME_LEN {
        return Err(FenceError::InvalidArgument(format!(
            "action_name longer than {} characters",
            MAX_ACTION_NAME_LEN
        )));
    }
    Ok(())
}
