//! What a stage asks the coordinator to do once its cohort completes.

use super::stage::Stage;

/// Successor of a completed stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Enter this stage immediately.
    Enter(Stage),
    /// No further stage: the operation concluded.
    Conclude(Conclusion),
}

/// Client-visible result of a coordinated operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conclusion {
    /// Every participant reached the requested outcome.
    Success,
    /// The operation failed; the message goes into the client's ERR packet.
    Failure(String),
}

impl Conclusion {
    /// Returns true for [`Conclusion::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Conclusion::Success)
    }
}
