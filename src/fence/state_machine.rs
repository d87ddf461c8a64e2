//! Fence State Machine
//!
//! ```text
//!            Try                Confirm
//! (none) ─────────▶ TRIED ─────────────▶ COMMITTED
//!   │                 │
//!   │ Cancel          │ Cancel
//!   ▼                 ▼
//! SUSPENDED        ROLLBACKED
//! ```
//!
//! A pure function of (incoming phase, current status). The coordinator applies
//! the decision against the store inside the local transaction.

use super::status::{FencePhase, FenceStatus};

/// Why a phase call is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Try against an existing record (including a SUSPENDED one)
    DuplicateTry(FenceStatus),
    /// Confirm with no record at all
    MissingRecord,
    /// Confirm against a null-compensated branch
    ConfirmAfterSuspend,
}

/// What the coordinator must do with an incoming phase call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Insert TRIED, then run the business call
    Begin,
    /// Insert SUSPENDED, skip the business call
    Suspend,
    /// Run the business call, then CAS `from` -> `to`
    Advance { from: FenceStatus, to: FenceStatus },
    /// Already handled; succeed without running anything
    Skip(FenceStatus),
    Reject(Violation),
}

pub fn decide(phase: FencePhase, current: Option<FenceStatus>) -> Decision {
    use FenceStatus::*;

    match (phase, current) {
        (FencePhase::Try, None) => Decision::Begin,
        (FencePhase::Try, Some(status)) => Decision::Reject(Violation::DuplicateTry(status)),

        (FencePhase::Confirm, None) => Decision::Reject(Violation::MissingRecord),
        (FencePhase::Confirm, Some(Tried)) => Decision::Advance {
            from: Tried,
            to: Committed,
        },
        (FencePhase::Confirm, Some(Suspended)) => {
            Decision::Reject(Violation::ConfirmAfterSuspend)
        }
        (FencePhase::Confirm, Some(status)) => Decision::Skip(status),

        (FencePhase::Cancel, None) => Decision::Suspend,
        (FencePhase::Cancel, Some(Tried)) => Decision::Advance {
            from: Tried,
            to: Rollbacked,
        },
        (FencePhase::Cancel, Some(status)) => Decision::Skip(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FenceStatus::*;

    #[test]
    fn test_try_transitions() {
        assert_eq!(decide(FencePhase::Try, None), Decision::Begin);
        for status in [Tried, Committed, Rollbacked, Suspended] {
            assert_eq!(
                decide(FencePhase::Try, Some(status)),
                Decision::Reject(Violation::DuplicateTry(status))
            );
        }
    }

    #[test]
    fn test_confirm_transitions() {
        assert_eq!(
            decide(FencePhase::Confirm, None),
            Decision::Reject(Violation::MissingRecord)
        );
        assert_eq!(
            decide(FencePhase::Confirm, Some(Tried)),
            Decision::Advance {
                from: Tried,
                to: Committed
            }
        );
        assert_eq!(
            decide(FencePhase::Confirm, Some(Committed)),
            Decision::Skip(Committed)
        );
        assert_eq!(
            decide(FencePhase::Confirm, Some(Rollbacked)),
            Decision::Skip(Rollbacked)
        );
        assert_eq!(
            decide(FencePhase::Confirm, Some(Suspended)),
            Decision::Reject(Violation::ConfirmAfterSuspend)
        );
    }

    #[test]
    fn test_cancel_transitions() {
        assert_eq!(decide(FencePhase::Cancel, None), Decision::Suspend);
        assert_eq!(
            decide(FencePhase::Cancel, Some(Tried)),
            Decision::Advance {
                from: Tried,
                to: Rollbacked
            }
        );
        for status in [Committed, Rollbacked, Suspended] {
            assert_eq!(
                decide(FencePhase::Cancel, Some(status)),
                Decision::Skip(status)
            );
        }
    }

    #[test]
    fn test_terminal_states_never_run_business() {
        for phase in [FencePhase::Try, FencePhase::Confirm, FencePhase::Cancel] {
            for status in [Committed, Rollbacked, Suspended] {
                let decision = decide(phase, Some(status));
                assert!(
                    !matches!(decision, Decision::Begin | Decision::Advance { .. }),
                    "{phase} on {status} must not run the business call"
                );
            }
        }
    }
}
