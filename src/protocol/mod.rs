//! MySQL wire protocol implementation.
//!
//! This module contains the low-level packet encoding and decoding the
//! coordinator needs: framing, the generic OK/ERR/EOF responses, and the
//! transaction control commands.
//!
//! # Structure
//!
//! - `codec`: Low-level encoding/decoding primitives
//! - `packet`: Header framing and generic response packets
//! - `command`: Transaction control commands and XA ids

pub mod codec;
pub mod command;
pub mod packet;

// Re-export commonly used types
pub use command::{Command, CommandKind, Xid};
pub use packet::{OkPacket, PacketHeader, RawPacket};
