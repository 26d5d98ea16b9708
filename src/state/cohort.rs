//! Response aggregation for one cohort of participants.
//!
//! A cohort is the fixed set of participants a stage sent its command to.
//! Every participant leaves the pending set exactly once, by replying,
//! erroring or closing. The cohort is complete when nothing is pending,
//! whatever the error count: "all accounted for" and "succeeded" are
//! separate questions.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::participant::ParticipantId;

/// Result of a close event seen by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseEffect {
    /// The participant was pending and is now counted as errored.
    Counted {
        /// Whether this event completed the cohort.
        complete: bool,
    },
    /// The participant had already answered (or was never part of the
    /// cohort); nothing changed.
    BetweenStages,
}

/// Aggregated result of a completed cohort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CohortOutcome {
    /// Cohort size at stage entry
    pub size: usize,
    /// Whether any participant errored, closed or was unreachable
    pub failed: bool,
    /// First error message observed
    pub error: Option<String>,
    /// Participants that answered with an error
    pub errored: Vec<ParticipantId>,
    /// Participants whose link closed before they answered
    pub lost: Vec<ParticipantId>,
    /// Slots taken by connect errors that named no participant
    pub unreachable: usize,
    /// The single reply of a one-participant cohort, if it was an OK packet
    pub success_packet: Option<Vec<u8>>,
}

/// Counting state for one cohort.
#[derive(Debug, Default)]
pub struct CohortState {
    open: bool,
    completed: bool,
    expected: usize,
    pending: HashSet<ParticipantId>,
    error_count: usize,
    unreachable: usize,
    first_error: Option<String>,
    first_responded: bool,
    errored: Vec<ParticipantId>,
    lost: Vec<ParticipantId>,
    success_packet: Option<Vec<u8>>,
}

impl CohortState {
    /// Create an idle aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cohort over `participants`.
    ///
    /// Duplicate ids are collapsed. An empty cohort is complete immediately.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the previous cohort is still open.
    pub fn begin_cohort<I>(&mut self, participants: I) -> Result<()>
    where
        I: IntoIterator<Item = ParticipantId>,
    {
        if self.open && !self.completed {
            return Err(Error::InvalidState(format!(
                "cohort still open with {} pending participant(s)",
                self.pending.len()
            )));
        }
        *self = Self::default();
        self.pending.extend(participants);
        self.expected = self.pending.len();
        self.open = true;
        self.completed = self.pending.is_empty();
        Ok(())
    }

    /// Record a successful reply. Returns `true` if this completed the cohort.
    ///
    /// A second reply from the same participant is ignored.
    pub fn on_responded(&mut self, id: &ParticipantId) -> bool {
        if !self.settle(id) {
            return false;
        }
        self.check_complete()
    }

    /// Record a successful reply carrying an OK packet.
    ///
    /// For a one-participant cohort the packet is kept so it can be echoed
    /// to the client.
    pub fn on_responded_with(&mut self, id: &ParticipantId, packet: &[u8]) -> bool {
        let first = !self.first_responded;
        if !self.settle(id) {
            return false;
        }
        if first && self.expected == 1 {
            self.success_packet = Some(packet.to_vec());
        }
        self.check_complete()
    }

    /// Record an error reply. Returns `true` if this completed the cohort.
    ///
    /// Only the first message is kept; later ones are logged.
    pub fn on_errored(&mut self, id: &ParticipantId, message: &str) -> bool {
        if !self.settle(id) {
            return false;
        }
        self.record_error(message);
        self.errored.push(id.clone());
        self.check_complete()
    }

    /// Record that a participant's link closed.
    pub fn on_closed_mid_cohort(&mut self, id: &ParticipantId, message: &str) -> CloseEffect {
        if !self.settle(id) {
            return CloseEffect::BetweenStages;
        }
        self.record_error(message);
        self.lost.push(id.clone());
        CloseEffect::Counted {
            complete: self.check_complete(),
        }
    }

    /// Record that some participant could not be reached at all.
    ///
    /// The failure takes one pending slot without naming a participant.
    pub fn on_connect_error(&mut self, message: &str) -> bool {
        if !self.open || self.completed {
            return false;
        }
        self.record_error(message);
        self.unreachable += 1;
        self.check_complete()
    }

    /// Whether `id` still owes a reply.
    pub fn is_pending(&self, id: &ParticipantId) -> bool {
        self.pending.contains(id)
    }

    /// Whether a cohort has been opened and not yet reset.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Whether every participant is accounted for.
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    /// Cohort size fixed at entry.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Number of participants that still owe a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of errors counted so far.
    pub fn error_count(&self) -> usize {
        self.error_count
    }

    /// Whether any participant has answered yet.
    pub fn first_responded(&self) -> bool {
        self.first_responded
    }

    /// Snapshot of the aggregated result.
    pub fn outcome(&self) -> CohortOutcome {
        CohortOutcome {
            size: self.expected,
            failed: self.error_count > 0,
            error: self.first_error.clone(),
            errored: self.errored.clone(),
            lost: self.lost.clone(),
            unreachable: self.unreachable,
            success_packet: self.success_packet.clone(),
        }
    }

    /// Close the cohort and forget its state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn settle(&mut self, id: &ParticipantId) -> bool {
        if !self.pending.remove(id) {
            tracing::debug!(participant = %id, "reply from participant not pending in this cohort");
            return false;
        }
        self.first_responded = true;
        true
    }

    fn record_error(&mut self, message: &str) {
        self.error_count += 1;
        if self.first_error.is_none() {
            self.first_error = Some(message.to_string());
        } else {
            tracing::debug!(error = message, "additional error in cohort");
        }
    }

    fn check_complete(&mut self) -> bool {
        if self.open && !self.completed && self.pending.len() <= self.unreachable {
            self.completed = true;
            return true;
        }
        false
    }
}
