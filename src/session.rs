//! Client sessions and the per-session transaction context.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::backend::Backend;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::participant::ParticipantId;

/// The client-facing link of a session.
pub trait ClientConnection: Send + Sync {
    /// Queue `packet` for the client.
    fn write(&self, packet: &[u8]) -> Result<()>;

    /// Check if the link is closed.
    fn is_closed(&self) -> bool;
}

/// What the coordinator needs from a session.
pub trait Session: Send + Sync {
    /// Session id, unique per process.
    fn session_id(&self) -> u64;

    /// Backends bound to the current transaction, in attach order.
    fn participants(&self) -> Vec<Arc<dyn Backend>>;

    /// Unbind a participant. Returns it if it was attached.
    fn detach(&self, id: &ParticipantId) -> Option<Arc<dyn Backend>>;

    /// Whether the current transaction runs as an XA transaction.
    fn is_xa(&self) -> bool;

    /// Next sequence number for building a fresh XA id.
    fn next_xa_seq(&self) -> u64;

    /// Mark the session as discarding: late replies are dropped quietly.
    fn mark_discard(&self);

    /// Whether the session is discarding.
    fn is_discard(&self) -> bool;

    /// Release the transaction's participants and savepoints.
    fn clear_transaction_resources(&self);

    /// Drop every savepoint.
    fn clear_savepoints(&self);

    /// Send a packet to the client. Dropped if the session is closed.
    fn write_to_client(&self, packet: &[u8]);

    /// Sequence id for the next packet sent to the client.
    fn next_packet_sequence_id(&self) -> u8;

    /// Whether the session has been torn down.
    fn is_closed(&self) -> bool;

    /// Whether a multi-statement query is being executed.
    fn is_multi_statement(&self) -> bool;

    /// Continue with the next statement of a multi-statement query.
    fn multi_statement_next(&self);

    /// Record why the current transaction was interrupted.
    fn set_tx_interrupt(&self, reason: &str);

    /// Coordinator driving this session's transactions.
    fn coordinator(&self) -> Arc<Coordinator>;
}

type StatementHook = Arc<dyn Fn() + Send + Sync>;

/// A client session routed across shards.
pub struct ShardSession {
    id: u64,
    client: Arc<dyn ClientConnection>,
    coordinator: Arc<Coordinator>,
    participants: Mutex<Vec<Arc<dyn Backend>>>,
    savepoints: Mutex<Vec<String>>,
    packet_id: AtomicU8,
    xa: AtomicBool,
    xa_seq: AtomicU64,
    discard: AtomicBool,
    closed: AtomicBool,
    multi_statement: AtomicBool,
    next_statement: Mutex<Option<StatementHook>>,
    tx_interrupt: Mutex<Option<String>>,
}

impl std::fmt::Debug for ShardSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSession")
            .field("id", &self.id)
            .field("xa", &self.is_xa())
            .field("discard", &self.is_discard())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ShardSession {
    /// Create a session writing to `client`.
    ///
    /// XA ids are built as `{xa_id_prefix}.{id}.{seq}`.
    pub fn new(id: u64, client: Arc<dyn ClientConnection>, xa_id_prefix: &str) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let session: Weak<dyn Session> = this.clone() as Weak<dyn Session>;
            Self {
                id,
                client,
                coordinator: Coordinator::new(session, xa_id_prefix),
                participants: Mutex::new(Vec::new()),
                savepoints: Mutex::new(Vec::new()),
                packet_id: AtomicU8::new(0),
                xa: AtomicBool::new(false),
                xa_seq: AtomicU64::new(0),
                discard: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                multi_statement: AtomicBool::new(false),
                next_statement: Mutex::new(None),
                tx_interrupt: Mutex::new(None),
            }
        })
    }

    /// Bind `backend` to the current transaction.
    ///
    /// A backend already attached under the same id is replaced in place.
    /// Attaching to an empty participant set starts a new transaction and
    /// clears the discard flag.
    pub fn attach(&self, backend: Arc<dyn Backend>) {
        let mut participants = self
            .participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if participants.is_empty() {
            self.discard.store(false, Ordering::Release);
        }
        match participants.iter_mut().find(|p| p.id() == backend.id()) {
            Some(slot) => *slot = backend,
            None => participants.push(backend),
        }
    }

    /// Run the current transaction as an XA transaction.
    pub fn set_xa(&self, xa: bool) {
        self.xa.store(xa, Ordering::Release);
    }

    /// Start a new client command whose packet carried `sequence_id`.
    pub fn set_packet_id(&self, sequence_id: u8) {
        self.packet_id.store(sequence_id, Ordering::Release);
    }

    /// Mark the current query as a multi-statement query.
    pub fn set_multi_statement(&self, multi: bool) {
        self.multi_statement.store(multi, Ordering::Release);
    }

    /// Called to run the next statement of a multi-statement query.
    pub fn set_next_statement_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self
            .next_statement
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Push a savepoint name.
    pub fn push_savepoint(&self, name: impl Into<String>) {
        self.savepoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.into());
    }

    /// Current savepoint names, oldest first.
    pub fn savepoints(&self) -> Vec<String> {
        self.savepoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Interrupt reason recorded for the last transaction, if any.
    pub fn tx_interrupt(&self) -> Option<String> {
        self.tx_interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tear the session down. Client writes are dropped from now on.
    pub fn close(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(session_id = self.id, reason, "close session");
        }
    }
}

impl Session for ShardSession {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn participants(&self) -> Vec<Arc<dyn Backend>> {
        self.participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn detach(&self, id: &ParticipantId) -> Option<Arc<dyn Backend>> {
        let mut participants = self
            .participants
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let pos = participants.iter().position(|p| p.id() == id)?;
        Some(participants.remove(pos))
    }

    fn is_xa(&self) -> bool {
        self.xa.load(Ordering::Acquire)
    }

    fn next_xa_seq(&self) -> u64 {
        self.xa_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn mark_discard(&self) {
        self.discard.store(true, Ordering::Release);
    }

    fn is_discard(&self) -> bool {
        self.discard.load(Ordering::Acquire)
    }

    fn clear_transaction_resources(&self) {
        let released = std::mem::take(
            &mut *self
                .participants
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        tracing::debug!(session_id = self.id, participants = released.len(), "clear transaction resources");
        self.clear_savepoints();
        self.xa.store(false, Ordering::Release);
        drop(released);
    }

    fn clear_savepoints(&self) {
        self.savepoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn write_to_client(&self, packet: &[u8]) {
        if self.is_closed() {
            tracing::debug!(session_id = self.id, "session closed, client write dropped");
            return;
        }
        if let Err(e) = self.client.write(packet) {
            tracing::warn!(session_id = self.id, error = %e, "write to client failed");
        }
    }

    fn next_packet_sequence_id(&self) -> u8 {
        self.packet_id.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.client.is_closed()
    }

    fn is_multi_statement(&self) -> bool {
        self.multi_statement.load(Ordering::Acquire)
    }

    fn multi_statement_next(&self) {
        let hook = self
            .next_statement
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match hook {
            Some(hook) => hook(),
            None => tracing::debug!(session_id = self.id, "no next statement"),
        }
    }

    fn set_tx_interrupt(&self, reason: &str) {
        *self
            .tx_interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
    }

    fn coordinator(&self) -> Arc<Coordinator> {
        Arc::clone(&self.coordinator)
    }
}
