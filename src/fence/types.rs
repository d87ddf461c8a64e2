//! Fence Core Types

use chrono::{DateTime, Utc};

use super::status::FenceStatus;

/// Global transaction ID assigned by the TC
pub type Xid = String;

/// Branch ID, unique within one global transaction
pub type BranchId = i64;

/// Column widths of the fence log table, in characters
pub const MAX_XID_LEN: usize = 128;
pub const MAX_ACTION_NAME_LEN: usize = 64;

/// One row of the fence log, keyed by (xid, branch_id)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FenceLogRecord {
    pub xid: Xid,
    pub branch_id: BranchId,
    /// TCC action name, for diagnostics only
    pub action_name: String,
    pub status: FenceStatus,
    pub gmt_create: DateTime<Utc>,
    pub gmt_modified: DateTime<Utc>,
}

impl FenceLogRecord {
    pub fn new(
        xid: impl Into<Xid>,
        branch_id: BranchId,
        action_name: impl Into<String>,
        status: FenceStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            xid: xid.into(),
            branch_id,
            action_name: action_name.into(),
            status,
            gmt_create: now,
            gmt_modified: now,
        }
    }

    pub fn key(&self) -> (&str, BranchId) {
        (&self.xid, self.branch_id)
    }
}

/// What happened to a fenced phase call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceOutcome<T> {
    /// The business call ran and its effects were committed
    Executed(T),
    /// The business call was suppressed; the branch is in this status
    Skipped(FenceStatus),
}

impl<T> FenceOutcome<T> {
    pub fn is_executed(&self) -> bool {
        matches!(self, FenceOutcome::Executed(_))
    }

    pub fn executed(self) -> Option<T> {
        match self {
            FenceOutcome::Executed(v) => Some(v),
            FenceOutcome::Skipped(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_timestamps() {
        let record = FenceLogRecord::new("xid-1", 3, "prepare_order", FenceStatus::Tried);
        assert_eq!(record.key(), ("xid-1", 3));
        assert_eq!(record.gmt_create, record.gmt_modified);
        assert_eq!(record.status, FenceStatus::Tried);
    }

    #[test]
    fn test_outcome_accessors() {
        let ran: FenceOutcome<u32> = FenceOutcome::Executed(7);
        assert!(ran.is_executed());
        assert_eq!(ran.executed(), Some(7));

        let skipped: FenceOutcome<u32> = FenceOutcome::Skipped(FenceStatus::Committed);
        assert!(!skipped.is_executed());
        assert_eq!(skipped.executed(), None);
    }
}
