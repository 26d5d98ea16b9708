//! Backend reply callbacks.

use crate::backend::Backend;
use crate::error::{Error, ServerError};

/// Receiver of one backend link's replies.
///
/// Callback patterns by reply kind:
/// - OK: `ok_response`
/// - ERR: `error_response`
/// - Result set: `field_eof_response` → `row_response*` → `row_eof_response`
///
/// Transaction control commands never produce a result set, so the result-set
/// callbacks default to logging the packet and dropping it. Callbacks for one
/// link arrive in command order; callbacks for different links may run
/// concurrently.
pub trait ResponseHandler: Send + Sync {
    /// Called with the complete OK frame (header included).
    fn ok_response(&self, backend: &dyn Backend, packet: &[u8]);

    /// Called when the backend answers with an ERR packet.
    fn error_response(&self, backend: &dyn Backend, err: ServerError);

    /// Called once when the link closes.
    fn connection_close(&self, backend: &dyn Backend, reason: &str);

    /// Called when the link failed to connect or broke the protocol.
    fn connection_error(&self, backend: &dyn Backend, err: &Error);

    /// Called when the column definitions of a result set end.
    fn field_eof_response(&self, backend: &dyn Backend, packet: &[u8]) {
        tracing::warn!(
            participant = %backend.id(),
            len = packet.len(),
            "unexpected field eof response"
        );
    }

    /// Called for each row of a result set.
    fn row_response(&self, backend: &dyn Backend, packet: &[u8]) {
        tracing::warn!(
            participant = %backend.id(),
            len = packet.len(),
            "unexpected row response"
        );
    }

    /// Called when the rows of a result set end.
    fn row_eof_response(&self, backend: &dyn Backend, packet: &[u8]) {
        tracing::warn!(
            participant = %backend.id(),
            len = packet.len(),
            "unexpected row eof response"
        );
    }
}
