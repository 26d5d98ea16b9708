//! Transaction control commands sent to backends.

use std::fmt;

use crate::error::{Error, Result};

use super::codec::PacketBuilder;

/// Command type bytes.
pub mod command_type {
    /// COM_QUIT
    pub const COM_QUIT: u8 = 0x01;
    /// COM_QUERY
    pub const COM_QUERY: u8 = 0x03;
    /// COM_PING
    pub const COM_PING: u8 = 0x0E;
}

/// Write a COM_QUERY packet. Commands always start a new sequence.
pub fn write_query(buf: &mut Vec<u8>, sql: &str) {
    let mut p = PacketBuilder::new(buf, 0);
    p.write_u8(command_type::COM_QUERY);
    p.write_bytes(sql.as_bytes());
    p.finish();
}

/// Write a COM_PING packet.
pub fn write_ping(buf: &mut Vec<u8>) {
    let mut p = PacketBuilder::new(buf, 0);
    p.write_u8(command_type::COM_PING);
    p.finish();
}

/// Global XA transaction id.
///
/// Each participant gets its own branch: the global id is shared and the
/// branch qualifier is the participant's shard name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xid {
    gtrid: String,
}

impl Xid {
    /// Build the global id `{prefix}.{session_id}.{seq}`.
    pub fn new(prefix: &str, session_id: u64, seq: u64) -> Self {
        Self {
            gtrid: format!("{}.{}.{}", prefix, session_id, seq),
        }
    }

    /// Global transaction id.
    pub fn gtrid(&self) -> &str {
        &self.gtrid
    }

    /// Render the xid of one branch as it appears in `XA` statements.
    pub fn branch(&self, bqual: &str) -> String {
        format!("'{}','{}'", escape(&self.gtrid), escape(bqual))
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gtrid)
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "''")
}

/// Kind of transaction control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// `COMMIT`
    Commit,
    /// `ROLLBACK`
    Rollback,
    /// `XA END`
    XaEnd,
    /// `XA PREPARE`
    XaPrepare,
    /// `XA COMMIT`
    XaCommit,
    /// `XA ROLLBACK`
    XaRollback,
}

impl CommandKind {
    /// Whether the command needs an XA branch id.
    pub fn is_xa(self) -> bool {
        !matches!(self, CommandKind::Commit | CommandKind::Rollback)
    }

    /// SQL keyword(s) of the command.
    pub fn keyword(self) -> &'static str {
        match self {
            CommandKind::Commit => "COMMIT",
            CommandKind::Rollback => "ROLLBACK",
            CommandKind::XaEnd => "XA END",
            CommandKind::XaPrepare => "XA PREPARE",
            CommandKind::XaCommit => "XA COMMIT",
            CommandKind::XaRollback => "XA ROLLBACK",
        }
    }
}

/// A rendered command for one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    kind: CommandKind,
    sql: String,
}

impl Command {
    /// Render `kind` for the participant whose branch qualifier is `bqual`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUsage` if an XA command is requested without an xid.
    pub fn new(kind: CommandKind, xid: Option<&Xid>, bqual: &str) -> Result<Self> {
        let sql = if kind.is_xa() {
            let xid = xid.ok_or_else(|| {
                Error::InvalidUsage(format!("{} requires an xid", kind.keyword()))
            })?;
            format!("{} {}", kind.keyword(), xid.branch(bqual))
        } else {
            kind.keyword().to_string()
        };
        Ok(Self { kind, sql })
    }

    /// Command kind.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Encode as a COM_QUERY packet.
    pub fn write(&self, buf: &mut Vec<u8>) {
        write_query(buf, &self.sql);
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}
