//! Fence Status and Phase Definitions
//!
//! Status IDs are the SMALLINT codes stored in the fence log table.

use std::fmt;

/// Branch status recorded in the fence log
///
/// Terminal states: COMMITTED (2), ROLLBACKED (3), SUSPENDED (4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum FenceStatus {
    /// Try completed, awaiting Confirm or Cancel
    Tried = 1,

    /// Terminal: Confirm applied
    Committed = 2,

    /// Terminal: Cancel applied
    Rollbacked = 3,

    /// Terminal: Cancel arrived before any Try (null compensation)
    /// A late Try must be refused while this row exists.
    Suspended = 4,
}

impl FenceStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FenceStatus::Tried)
    }

    /// Get the numeric status ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL status ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(FenceStatus::Tried),
            2 => Some(FenceStatus::Committed),
            3 => Some(FenceStatus::Rollbacked),
            4 => Some(FenceStatus::Suspended),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FenceStatus::Tried => "TRIED",
            FenceStatus::Committed => "COMMITTED",
            FenceStatus::Rollbacked => "ROLLBACKED",
            FenceStatus::Suspended => "SUSPENDED",
        }
    }
}

impl fmt::Display for FenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for FenceStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        FenceStatus::from_id(value).ok_or(())
    }
}

/// TCC phase of an incoming branch call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FencePhase {
    Try,
    Confirm,
    Cancel,
}

impl FencePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FencePhase::Try => "TRY",
            FencePhase::Confirm => "CONFIRM",
            FencePhase::Cancel => "CANCEL",
        }
    }

    /// Status the branch reaches when this phase's business call succeeds
    pub fn target_status(&self) -> FenceStatus {
        match self {
            FencePhase::Try => FenceStatus::Tried,
            FencePhase::Confirm => FenceStatus::Committed,
            FencePhase::Cancel => FenceStatus::Rollbacked,
        }
    }
}

impl fmt::Display for FencePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(FenceStatus::Committed.is_terminal());
        assert!(FenceStatus::Rollbacked.is_terminal());
        assert!(FenceStatus::Suspended.is_terminal());

        assert!(!FenceStatus::Tried.is_terminal());
    }

    #[test]
    fn test_storage_codes() {
        assert_eq!(FenceStatus::Tried.id(), 1);
        assert_eq!(FenceStatus::Committed.id(), 2);
        assert_eq!(FenceStatus::Rollbacked.id(), 3);
        assert_eq!(FenceStatus::Suspended.id(), 4);
        assert_eq!(FenceStatus::try_from(4), Ok(FenceStatus::Suspended));
    }

    #[test]
    fn test_invalid_status_id() {
        assert!(FenceStatus::from_id(0).is_none());
        assert!(FenceStatus::from_id(5).is_none());
        assert!(FenceStatus::try_from(-1).is_err());
    }

    #[test]
    fn test_phase_targets() {
        assert_eq!(FencePhase::Try.target_status(), FenceStatus::Tried);
        assert_eq!(FencePhase::Confirm.target_status(), FenceStatus::Committed);
        assert_eq!(FencePhase::Cancel.target_status(), FenceStatus::Rollbacked);
    }

    #[test]
    fn test_display() {
        assert_eq!(FenceStatus::Rollbacked.to_string(), "ROLLBACKED");
        assert_eq!(FencePhase::Cancel.to_string(), "CANCEL");
    }
}
