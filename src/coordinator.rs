//! Transaction coordinator.
//!
//! The coordinator owns the current [`Stage`] and its cohort. Backend replies
//! arrive through [`ResponseHandler`] callbacks, possibly concurrently from
//! different I/O tasks. Each callback updates the cohort under one lock; the
//! callback that completes the cohort also computes and enters the next stage
//! while still holding it, so a cohort completes and advances exactly once.
//! Commands and client writes happen after the lock is released.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::backend::Backend;
use crate::error::{ER_UNKNOWN_ERROR, Error, Result, ServerError};
use crate::handler::ResponseHandler;
use crate::participant::ParticipantId;
use crate::protocol::packet::{OkPacket, set_sequence_id, status_flags, write_err};
use crate::protocol::{Command, Xid};
use crate::session::Session;
use crate::state::{CloseEffect, CohortState, Conclusion, Intent, Stage, Transition};

/// What to do once the lock is released.
enum Step {
    Idle,
    Send(Vec<(Arc<dyn Backend>, Command)>),
    Conclude {
        conclusion: Conclusion,
        success_packet: Option<Vec<u8>>,
        interrupted: bool,
    },
}

#[derive(Debug, Default)]
struct Inner {
    stage: Option<Stage>,
    cohort: CohortState,
    xid: Option<Xid>,
    interrupted: Option<String>,
    departed: Option<String>,
}

/// Drives coordinated commit and rollback for one session.
pub struct Coordinator {
    session: Weak<dyn Session>,
    this: Weak<Coordinator>,
    xa_id_prefix: String,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("xa_id_prefix", &self.xa_id_prefix)
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Create a coordinator for `session`.
    pub fn new(session: Weak<dyn Session>, xa_id_prefix: &str) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            session,
            this: this.clone(),
            xa_id_prefix: xa_id_prefix.to_string(),
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Result<Arc<dyn Session>> {
        self.session
            .upgrade()
            .ok_or_else(|| Error::InvalidState("session is gone".into()))
    }

    /// Whether a coordinated operation is in flight.
    pub fn is_in_flight(&self) -> bool {
        self.lock().stage.is_some()
    }

    /// Name of the stage in flight.
    pub fn current_stage(&self) -> Option<&'static str> {
        self.lock().stage.as_ref().map(Stage::name)
    }

    /// XA id of the operation in flight.
    pub fn xid(&self) -> Option<Xid> {
        self.lock().xid.clone()
    }

    /// Commit the session's transaction across its participants.
    pub fn begin_transaction_commit(&self) -> Result<()> {
        let session = self.session()?;
        self.begin(Stage::initial(session.is_xa(), Intent::Commit))
    }

    /// Roll the session's transaction back across its participants.
    pub fn begin_transaction_rollback(&self) -> Result<()> {
        let session = self.session()?;
        self.begin(Stage::initial(session.is_xa(), Intent::Rollback))
    }

    /// Start a coordinated operation at `stage`.
    ///
    /// The result reaches the client through the session; this only reports
    /// whether the operation could start.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if an operation is already in flight.
    pub fn begin(&self, stage: Stage) -> Result<()> {
        let session = self.session()?;
        let step = {
            let mut inner = self.lock();
            if let Some(current) = &inner.stage {
                return Err(Error::InvalidState(format!(
                    "cannot begin {} while {} is in flight",
                    stage.name(),
                    current.name()
                )));
            }
            *inner = Inner::default();
            if stage.command().is_xa() {
                inner.xid = Some(Xid::new(
                    &self.xa_id_prefix,
                    session.session_id(),
                    session.next_xa_seq(),
                ));
            }
            tracing::debug!(session_id = session.session_id(), stage = stage.name(), "begin coordinated operation");
            match self.enter(&mut inner, session.as_ref(), stage) {
                Ok(step) => step,
                Err(e) => {
                    *inner = Inner::default();
                    return Err(e);
                }
            }
        };
        self.run(session.as_ref(), step);
        Ok(())
    }

    /// Abort the operation in flight.
    ///
    /// The client gets an error right away; replies still outstanding are
    /// drained but no longer reach the client.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if no operation is in flight.
    pub fn interrupt(&self, reason: &str) -> Result<()> {
        let session = self.session()?;
        {
            let mut inner = self.lock();
            let Some(stage) = &inner.stage else {
                return Err(Error::InvalidState(
                    "no coordinated operation in flight".into(),
                ));
            };
            if inner.interrupted.is_some() {
                tracing::debug!(reason, "operation already interrupted");
                return Ok(());
            }
            tracing::info!(session_id = session.session_id(), stage = stage.name(), reason, "interrupt transaction");
            inner.interrupted = Some(reason.to_string());
        }
        session.set_tx_interrupt(reason);
        if !session.is_closed() {
            let err = Error::Interrupted(reason.to_string());
            let mut buf = Vec::new();
            write_err(
                &mut buf,
                session.next_packet_sequence_id(),
                &ServerError::new(ER_UNKNOWN_ERROR, err.to_string()),
            );
            session.write_to_client(&buf);
        }
        Ok(())
    }

    /// A participant answered OK. `packet` is the complete OK frame.
    pub fn on_ok(&self, id: &ParticipantId, packet: &[u8]) {
        let Ok(session) = self.session() else {
            return;
        };
        let step = {
            let mut inner = self.lock();
            if !inner.cohort.is_pending(id) {
                self.stray(session.as_ref(), id, "ok");
                return;
            }
            let done = inner.cohort.on_responded_with(id, packet);
            self.advance(&mut inner, session.as_ref(), done)
        };
        self.run(session.as_ref(), step);
    }

    /// A participant answered with an error.
    pub fn on_error(&self, id: &ParticipantId, errno: Option<u16>, message: &str) {
        let Ok(session) = self.session() else {
            return;
        };
        let step = {
            let mut inner = self.lock();
            if !inner.cohort.is_pending(id) {
                self.stray(session.as_ref(), id, message);
                return;
            }
            let tolerated = inner
                .stage
                .as_ref()
                .zip(errno)
                .is_some_and(|(stage, errno)| stage.tolerates(errno));
            let done = if tolerated {
                tracing::debug!(participant = %id, errno, error = message, "branch already finished");
                inner.cohort.on_responded(id)
            } else {
                tracing::debug!(participant = %id, errno, error = message, "participant error");
                inner.cohort.on_errored(id, message)
            };
            self.advance(&mut inner, session.as_ref(), done)
        };
        self.run(session.as_ref(), step);
    }

    /// A participant's link closed.
    ///
    /// The participant is detached from the session. If it still owed a reply
    /// in the open cohort, the close counts as its error reply.
    pub fn on_connection_closed(&self, backend: &dyn Backend, reason: &str) {
        let Ok(session) = self.session() else {
            return;
        };
        let id = backend.id();
        let _detached = session.detach(id);
        let message = backend.info().closed_message(reason);
        let step = {
            let mut inner = self.lock();
            match inner.cohort.on_closed_mid_cohort(id, &message) {
                CloseEffect::Counted { complete } => {
                    tracing::warn!(participant = %id, error = %message, "participant closed mid cohort");
                    self.advance(&mut inner, session.as_ref(), complete)
                }
                CloseEffect::BetweenStages => {
                    tracing::debug!(participant = %id, reason, "participant closed between stages");
                    if inner.stage.as_ref().is_some_and(Stage::precedes_decision) {
                        inner.departed.get_or_insert(message);
                    }
                    Step::Idle
                }
            }
        };
        self.run(session.as_ref(), step);
    }

    /// A participant could not be reached or broke the protocol.
    ///
    /// Without an id the failure takes an anonymous slot of the open cohort.
    /// A participant that already answered the open cohort is left as is.
    pub fn on_connect_error(&self, id: Option<&ParticipantId>, err: &Error) {
        let Ok(session) = self.session() else {
            return;
        };
        let message = err.to_string();
        tracing::warn!(participant = ?id.map(ParticipantId::as_str), error = %message, "participant connect error");
        let step = {
            let mut inner = self.lock();
            let done = match id {
                Some(id) if inner.cohort.is_pending(id) => inner.cohort.on_errored(id, &message),
                Some(id) => {
                    // the participant already answered this cohort
                    self.stray(session.as_ref(), id, &message);
                    return;
                }
                None => inner.cohort.on_connect_error(&message),
            };
            self.advance(&mut inner, session.as_ref(), done)
        };
        self.run(session.as_ref(), step);
    }

    fn stray(&self, session: &dyn Session, id: &ParticipantId, what: &str) {
        if session.is_discard() {
            tracing::debug!(participant = %id, what, "reply dropped, session is discarding");
        } else {
            tracing::warn!(participant = %id, what, "reply from participant not in the open cohort");
        }
    }

    /// Move past a completed cohort. Must be called with the lock held.
    fn advance(&self, inner: &mut Inner, session: &dyn Session, done: bool) -> Step {
        if !done {
            return Step::Idle;
        }
        let Some(stage) = inner.stage.take() else {
            tracing::error!("cohort completed without a stage in flight");
            inner.cohort.reset();
            return Step::Idle;
        };
        let mut outcome = inner.cohort.outcome();
        if stage.precedes_decision() {
            let forced = inner
                .interrupted
                .as_ref()
                .map(|reason| Error::Interrupted(reason.clone()).to_string())
                .or_else(|| inner.departed.clone());
            if let Some(reason) = forced {
                outcome.failed = true;
                outcome.error.get_or_insert(reason);
            }
        }
        match stage.next(&outcome) {
            Transition::Enter(next) => match self.enter(inner, session, next) {
                Ok(step) => step,
                Err(e) => {
                    tracing::error!(error = %e, "cannot enter next stage");
                    self.conclude_now(inner, Conclusion::Failure(e.to_string()), None)
                }
            },
            Transition::Conclude(conclusion) => {
                self.conclude_now(inner, conclusion, outcome.success_packet)
            }
        }
    }

    /// Enter `stage`, cascading through stages whose cohort is empty.
    fn enter(&self, inner: &mut Inner, session: &dyn Session, mut stage: Stage) -> Result<Step> {
        loop {
            if stage.marks_discard() {
                session.mark_discard();
            }
            let attached = session.participants();
            let ids: Vec<ParticipantId> = attached.iter().map(|p| p.id().clone()).collect();
            let targets = stage.targets(&ids);
            inner.cohort.begin_cohort(targets.iter().cloned())?;
            tracing::debug!(
                session_id = session.session_id(),
                stage = stage.name(),
                participants = targets.len(),
                "xa stage will change to {}",
                stage.name()
            );

            if inner.cohort.is_complete() {
                let outcome = inner.cohort.outcome();
                match stage.next(&outcome) {
                    Transition::Enter(next) => {
                        stage = next;
                        continue;
                    }
                    Transition::Conclude(conclusion) => {
                        return Ok(self.conclude_now(inner, conclusion, outcome.success_packet));
                    }
                }
            }

            let mut sends = Vec::with_capacity(targets.len());
            for backend in attached {
                if targets.contains(backend.id()) {
                    let command = Command::new(
                        stage.command(),
                        inner.xid.as_ref(),
                        backend.id().as_str(),
                    )?;
                    sends.push((backend, command));
                }
            }
            inner.stage = Some(stage);
            return Ok(Step::Send(sends));
        }
    }

    fn conclude_now(
        &self,
        inner: &mut Inner,
        conclusion: Conclusion,
        success_packet: Option<Vec<u8>>,
    ) -> Step {
        let interrupted = inner.interrupted.is_some();
        *inner = Inner::default();
        Step::Conclude {
            conclusion,
            success_packet,
            interrupted,
        }
    }

    fn run(&self, session: &dyn Session, step: Step) {
        match step {
            Step::Idle => {}
            Step::Send(sends) => self.send_all(sends),
            Step::Conclude {
                conclusion,
                success_packet,
                interrupted,
            } => self.finish(session, conclusion, success_packet, interrupted),
        }
    }

    fn send_all(&self, sends: Vec<(Arc<dyn Backend>, Command)>) {
        let handler: Weak<dyn ResponseHandler> = self.this.clone() as Weak<dyn ResponseHandler>;
        for (backend, command) in sends {
            backend.set_response_handler(handler.clone());
            if let Err(e) = backend.send_command(&command) {
                tracing::warn!(participant = %backend.id(), command = %command, error = %e, "send failed");
                self.on_error(backend.id(), None, &e.to_string());
            }
        }
    }

    fn finish(
        &self,
        session: &dyn Session,
        conclusion: Conclusion,
        success_packet: Option<Vec<u8>>,
        interrupted: bool,
    ) {
        session.clear_transaction_resources();

        if interrupted {
            tracing::debug!(session_id = session.session_id(), "operation was interrupted, result not sent");
            return;
        }
        if session.is_closed() {
            tracing::debug!(session_id = session.session_id(), "session closed, result not sent");
            return;
        }

        let sequence_id = session.next_packet_sequence_id();
        let success = conclusion.is_success();
        match conclusion {
            Conclusion::Success => match success_packet {
                Some(mut packet) => {
                    set_sequence_id(&mut packet, sequence_id);
                    session.write_to_client(&packet);
                }
                None => {
                    let mut buf = Vec::new();
                    OkPacket {
                        status_flags: status_flags::SERVER_STATUS_AUTOCOMMIT,
                        ..Default::default()
                    }
                    .write(&mut buf, sequence_id);
                    session.write_to_client(&buf);
                }
            },
            Conclusion::Failure(message) => {
                tracing::warn!(session_id = session.session_id(), error = %message, "coordinated operation failed");
                let mut buf = Vec::new();
                write_err(
                    &mut buf,
                    sequence_id,
                    &ServerError::new(ER_UNKNOWN_ERROR, message),
                );
                session.write_to_client(&buf);
            }
        }

        if success && session.is_multi_statement() {
            session.multi_statement_next();
        }
    }
}

impl ResponseHandler for Coordinator {
    fn ok_response(&self, backend: &dyn Backend, packet: &[u8]) {
        self.on_ok(backend.id(), packet);
    }

    fn error_response(&self, backend: &dyn Backend, err: ServerError) {
        self.on_error(backend.id(), Some(err.code), &err.message);
    }

    fn connection_close(&self, backend: &dyn Backend, reason: &str) {
        self.on_connection_closed(backend, reason);
    }

    fn connection_error(&self, backend: &dyn Backend, err: &Error) {
        self.on_connect_error(Some(backend.id()), err);
    }

    fn field_eof_response(&self, backend: &dyn Backend, _packet: &[u8]) {
        tracing::warn!(participant = %backend.id(), "unexpected result set during transaction command");
        self.on_error(
            backend.id(),
            None,
            "unexpected result set during transaction command",
        );
    }

    fn row_response(&self, _backend: &dyn Backend, _packet: &[u8]) {}

    fn row_eof_response(&self, backend: &dyn Backend, _packet: &[u8]) {
        tracing::debug!(participant = %backend.id(), "unexpected result set drained");
    }
}

/// Commit `session`'s transaction. The result is written to the client.
pub fn begin_transaction_commit(session: &dyn Session) -> Result<()> {
    session.coordinator().begin_transaction_commit()
}

/// Roll back `session`'s transaction. The result is written to the client.
pub fn begin_transaction_rollback(session: &dyn Session) -> Result<()> {
    session.coordinator().begin_transaction_rollback()
}

/// Abort `session`'s in-flight transaction with `reason`.
pub fn interrupt_current_transaction(session: &dyn Session, reason: &str) -> Result<()> {
    session.coordinator().interrupt(reason)
}
