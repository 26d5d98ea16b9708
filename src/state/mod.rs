//! Sans-I/O state machines for coordinated transactions.
//!
//! These state machines hold the counting and transition logic without
//! performing any I/O. The coordinator feeds them backend events and acts on
//! the [`Transition`] they return.

pub mod action;
pub mod cohort;
pub mod reply;
pub mod stage;

pub use action::{Conclusion, Transition};
pub use cohort::{CloseEffect, CohortOutcome, CohortState};
pub use reply::{ReplyEvent, ReplyStateMachine};
pub use stage::{Intent, Stage};
