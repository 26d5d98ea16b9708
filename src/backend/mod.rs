//! Backend links taking part in coordinated transactions.

use std::sync::Weak;

use crate::error::Result;
use crate::handler::ResponseHandler;
use crate::participant::{BackendInfo, ParticipantId};
use crate::protocol::Command;

#[cfg(feature = "tokio")]
mod service;

#[cfg(feature = "tokio")]
pub use service::BackendService;

/// One backend link bound to a session.
///
/// Replies to commands are delivered to the registered [`ResponseHandler`].
/// The handler is held weakly: once its owner is gone, replies are dropped.
pub trait Backend: Send + Sync {
    /// Participant id (shard name).
    fn id(&self) -> &ParticipantId;

    /// Where the link points.
    fn info(&self) -> BackendInfo;

    /// Queue `command` on the link. Never waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConnectionClosed` if the link is already closed.
    fn send_command(&self, command: &Command) -> Result<()>;

    /// Route subsequent replies to `handler`.
    fn set_response_handler(&self, handler: Weak<dyn ResponseHandler>);
}
