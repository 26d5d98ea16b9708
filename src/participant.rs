//! Participant identity and description.

use std::fmt;
use std::sync::Arc;

/// Identifier of one backend participant within a session.
///
/// A session holds at most one backend link per shard, so the shard name
/// identifies the participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(Arc<str>);

impl ParticipantId {
    /// Create an id from a shard name.
    pub fn new(shard: &str) -> Self {
        Self(Arc::from(shard))
    }

    /// Shard name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(shard: &str) -> Self {
        Self::new(shard)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a backend link points, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendInfo {
    /// Backend host
    pub host: String,
    /// Backend port
    pub port: u16,
    /// Current schema
    pub schema: Option<String>,
    /// Backend thread (connection) id
    pub thread_id: u32,
}

impl BackendInfo {
    /// Message reported when this link closes while a reply is outstanding.
    pub fn closed_message(&self, reason: &str) -> String {
        format!(
            "connection {{dbInstance[{}:{}],Schema[{}],threadID[{}]}} was closed, reason is [{}]",
            self.host,
            self.port,
            self.schema.as_deref().unwrap_or(""),
            self.thread_id,
            reason
        )
    }
}
