//! Generic response packets: header framing, OK, ERR and EOF.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result, ServerError};

use super::codec::{
    PacketBuilder, decode_text, read_bytes, read_lenenc_int, read_u8, read_u16_le,
};

/// First payload byte of generic response packets.
pub mod msg_type {
    /// OK packet
    pub const OK: u8 = 0x00;
    /// LOCAL INFILE request
    pub const LOCAL_INFILE: u8 = 0xFB;
    /// EOF packet (when the payload is shorter than 9 bytes)
    pub const EOF: u8 = 0xFE;
    /// ERR packet
    pub const ERR: u8 = 0xFF;
}

/// Server status flags carried by OK and EOF packets.
pub mod status_flags {
    /// A transaction is active
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    /// Autocommit mode is set
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    /// More results follow
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
}

/// 4-byte packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PacketHeader {
    length: [u8; 3],
    /// Sequence id
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse the header at the front of `data`.
    pub fn parse(data: &[u8]) -> Result<&Self> {
        let (header, _) = Self::ref_from_prefix(data)?;
        Ok(header)
    }

    /// Payload length in bytes.
    pub fn payload_length(&self) -> usize {
        usize::from(self.length[0])
            | (usize::from(self.length[1]) << 8)
            | (usize::from(self.length[2]) << 16)
    }

    /// Header plus payload length.
    pub fn frame_length(&self) -> usize {
        Self::SIZE + self.payload_length()
    }
}

/// A complete packet: sequence id plus payload.
#[derive(Debug, Clone, Copy)]
pub struct RawPacket<'a> {
    /// Sequence id
    pub sequence_id: u8,
    /// Payload (after the header)
    pub payload: &'a [u8],
}

impl<'a> RawPacket<'a> {
    /// Split a complete frame (header + payload) into a packet.
    pub fn parse(frame: &'a [u8]) -> Result<Self> {
        let header = PacketHeader::parse(frame)?;
        let (payload, _) = read_bytes(&frame[PacketHeader::SIZE..], header.payload_length())?;
        Ok(Self {
            sequence_id: header.sequence_id,
            payload,
        })
    }

    /// First payload byte, if any.
    pub fn first_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// Check if this is an OK packet.
    pub fn is_ok(&self) -> bool {
        self.first_byte() == Some(msg_type::OK)
    }

    /// Check if this is an ERR packet.
    pub fn is_error(&self) -> bool {
        self.first_byte() == Some(msg_type::ERR)
    }

    /// Check if this is an EOF packet.
    pub fn is_eof(&self) -> bool {
        self.first_byte() == Some(msg_type::EOF) && self.payload.len() < 9
    }
}

/// OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    /// Affected rows
    pub affected_rows: u64,
    /// Last insert id
    pub last_insert_id: u64,
    /// Server status flags
    pub status_flags: u16,
    /// Warning count
    pub warnings: u16,
    /// Human-readable info
    pub info: String,
}

impl OkPacket {
    /// Parse an OK packet from its payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (header, rest) = read_u8(payload)?;
        if header != msg_type::OK && header != msg_type::EOF {
            return Err(Error::Protocol(format!(
                "Expected OK packet, got header 0x{header:02X}"
            )));
        }
        let (affected_rows, rest) = read_lenenc_int(rest)?;
        let (last_insert_id, rest) = read_lenenc_int(rest)?;
        let (status_flags, rest) = read_u16_le(rest)?;
        let (warnings, rest) = read_u16_le(rest)?;
        Ok(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info: decode_text(rest),
        })
    }

    /// Write this packet with the given sequence id.
    pub fn write(&self, buf: &mut Vec<u8>, sequence_id: u8) {
        let mut p = PacketBuilder::new(buf, sequence_id);
        p.write_u8(msg_type::OK);
        p.write_lenenc_int(self.affected_rows);
        p.write_lenenc_int(self.last_insert_id);
        p.write_u16(self.status_flags);
        p.write_u16(self.warnings);
        p.write_bytes(self.info.as_bytes());
        p.finish();
    }
}

/// Parse an ERR packet from its payload.
pub fn parse_err(payload: &[u8]) -> Result<ServerError> {
    let (header, rest) = read_u8(payload)?;
    if header != msg_type::ERR {
        return Err(Error::Protocol(format!(
            "Expected ERR packet, got header 0x{header:02X}"
        )));
    }
    let (code, rest) = read_u16_le(rest)?;
    let (sql_state, message) = if rest.first() == Some(&b'#') && rest.len() >= 6 {
        (Some(decode_text(&rest[1..6])), &rest[6..])
    } else {
        (None, rest)
    };
    Ok(ServerError {
        code,
        sql_state,
        message: decode_text(message),
    })
}

/// Write an ERR packet with the given sequence id.
pub fn write_err(buf: &mut Vec<u8>, sequence_id: u8, err: &ServerError) {
    let mut p = PacketBuilder::new(buf, sequence_id);
    p.write_u8(msg_type::ERR);
    p.write_u16(err.code);
    p.write_u8(b'#');
    let state = err.sql_state.as_deref().unwrap_or("HY000");
    let mut state_bytes = [b'0'; 5];
    for (dst, src) in state_bytes.iter_mut().zip(state.bytes()) {
        *dst = src;
    }
    p.write_bytes(&state_bytes);
    p.write_bytes(err.message.as_bytes());
    p.finish();
}

/// Rewrite the sequence id of an encoded packet in place.
pub fn set_sequence_id(frame: &mut [u8], sequence_id: u8) {
    if let Some(byte) = frame.get_mut(3) {
        *byte = sequence_id;
    }
}
