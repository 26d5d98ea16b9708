//! Stages of coordinated commit and rollback.
//!
//! XA chain:
//!
//! ```text
//! Start (XA END) ──ok──▶ Prepare (XA PREPARE) ──ok──▶ CommitAll (XA COMMIT) ──▶ Cleanup ──▶ done
//!        │                      │
//!        └──────err─────────────┴──▶ RollbackAll (XA ROLLBACK) ──▶ Cleanup ──▶ done
//! ```
//!
//! A user rollback goes `Start → RollbackAll → Cleanup`. Plain transactions
//! run a single `NormalCommit` or `NormalRollback` stage. No stage is ever
//! entered twice in one operation.

use crate::error::ER_XAER_NOTA;
use crate::participant::ParticipantId;
use crate::protocol::CommandKind;

use super::action::{Conclusion, Transition};
use super::cohort::CohortOutcome;

/// What the client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Make the transaction durable.
    Commit,
    /// Abandon the transaction.
    Rollback,
}

/// One step of a coordinated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// `XA END` on every branch.
    Start {
        /// Requested outcome
        intent: Intent,
    },
    /// `XA PREPARE` on every branch.
    Prepare,
    /// `XA COMMIT` on every branch.
    CommitAll,
    /// `XA ROLLBACK` on every branch.
    RollbackAll {
        /// Why the commit path was abandoned, if it was
        cause: Option<String>,
    },
    /// Re-send the final decision to branches that errored on it.
    Cleanup {
        /// Decision being finalized
        decision: Intent,
        /// Branches to retry
        retry: Vec<ParticipantId>,
        /// Why the commit path was abandoned, if it was
        cause: Option<String>,
        /// Set when a branch was lost or unreachable before the decision reached it
        lost: Option<String>,
    },
    /// `COMMIT` on every participant.
    NormalCommit,
    /// `ROLLBACK` on every participant.
    NormalRollback,
}

impl Stage {
    /// First stage for the given protocol and intent.
    pub fn initial(xa: bool, intent: Intent) -> Self {
        match (xa, intent) {
            (true, intent) => Stage::Start { intent },
            (false, Intent::Commit) => Stage::NormalCommit,
            (false, Intent::Rollback) => Stage::NormalRollback,
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Start { .. } => "XA END",
            Stage::Prepare => "XA PREPARE",
            Stage::CommitAll => "XA COMMIT",
            Stage::RollbackAll { .. } => "XA ROLLBACK",
            Stage::Cleanup { .. } => "XA CLEANUP",
            Stage::NormalCommit => "COMMIT",
            Stage::NormalRollback => "ROLLBACK",
        }
    }

    /// Command issued on entry.
    pub fn command(&self) -> CommandKind {
        match self {
            Stage::Start { .. } => CommandKind::XaEnd,
            Stage::Prepare => CommandKind::XaPrepare,
            Stage::CommitAll => CommandKind::XaCommit,
            Stage::RollbackAll { .. } => CommandKind::XaRollback,
            Stage::Cleanup {
                decision: Intent::Commit,
                ..
            } => CommandKind::XaCommit,
            Stage::Cleanup {
                decision: Intent::Rollback,
                ..
            } => CommandKind::XaRollback,
            Stage::NormalCommit => CommandKind::Commit,
            Stage::NormalRollback => CommandKind::Rollback,
        }
    }

    /// Whether this stage rolls work back.
    pub fn is_rollback(&self) -> bool {
        matches!(
            self,
            Stage::RollbackAll { .. }
                | Stage::NormalRollback
                | Stage::Cleanup {
                    decision: Intent::Rollback,
                    ..
                }
        )
    }

    /// Whether the commit-or-rollback decision is still open.
    ///
    /// A failure forced on such a stage (interrupt, participant lost between
    /// stages) turns a commit into a rollback.
    pub fn precedes_decision(&self) -> bool {
        matches!(
            self,
            Stage::Start {
                intent: Intent::Commit
            } | Stage::Prepare
        )
    }

    /// Whether entering this stage marks the session as discarding.
    pub fn marks_discard(&self) -> bool {
        self.is_rollback()
    }

    /// Participants this stage sends its command to, in session order.
    pub fn targets(&self, attached: &[ParticipantId]) -> Vec<ParticipantId> {
        match self {
            Stage::Cleanup { retry, .. } => attached
                .iter()
                .filter(|id| retry.contains(id))
                .cloned()
                .collect(),
            _ => attached.to_vec(),
        }
    }

    /// Whether a backend error with this code counts as success here.
    ///
    /// Rolling back a branch the backend no longer knows about is done.
    pub fn tolerates(&self, errno: u16) -> bool {
        errno == ER_XAER_NOTA && self.command() == CommandKind::XaRollback
    }

    /// Successor after the cohort completed with `outcome`.
    pub fn next(self, outcome: &CohortOutcome) -> Transition {
        let error = || {
            outcome
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string())
        };
        // failures that a cleanup retry cannot repair
        let lost = || (!outcome.lost.is_empty() || outcome.unreachable > 0).then(error);

        match self {
            Stage::Start {
                intent: Intent::Commit,
            } => {
                if outcome.failed {
                    Transition::Enter(Stage::RollbackAll {
                        cause: Some(error()),
                    })
                } else {
                    Transition::Enter(Stage::Prepare)
                }
            }
            Stage::Start {
                intent: Intent::Rollback,
            } => Transition::Enter(Stage::RollbackAll { cause: None }),
            Stage::Prepare => {
                if outcome.failed {
                    Transition::Enter(Stage::RollbackAll {
                        cause: Some(error()),
                    })
                } else {
                    Transition::Enter(Stage::CommitAll)
                }
            }
            Stage::CommitAll => Transition::Enter(Stage::Cleanup {
                decision: Intent::Commit,
                retry: outcome.errored.clone(),
                cause: None,
                lost: lost(),
            }),
            Stage::RollbackAll { cause } => Transition::Enter(Stage::Cleanup {
                decision: Intent::Rollback,
                retry: outcome.errored.clone(),
                cause,
                lost: lost(),
            }),
            Stage::Cleanup { cause, lost, .. } => {
                let conclusion = if let Some(cause) = cause {
                    Conclusion::Failure(cause)
                } else if outcome.failed {
                    Conclusion::Failure(error())
                } else if let Some(lost) = lost {
                    Conclusion::Failure(lost)
                } else {
                    Conclusion::Success
                };
                Transition::Conclude(conclusion)
            }
            Stage::NormalCommit | Stage::NormalRollback => {
                if outcome.failed {
                    Transition::Conclude(Conclusion::Failure(error()))
                } else {
                    Transition::Conclude(Conclusion::Success)
                }
            }
        }
    }
}
