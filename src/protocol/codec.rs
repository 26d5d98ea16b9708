//! MySQL wire protocol encoding and decoding primitives.
//!
//! MySQL uses little-endian for all fixed-width integers.

use crate::error::{Error, Result};
use zerocopy::FromBytes;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE, U64 as U64LE};

/// Largest payload a single MySQL packet can carry.
pub const MAX_PAYLOAD_LEN: usize = 0xFF_FFFF;

/// Read 1-byte unsigned integer.
#[inline]
pub fn read_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((first, rest)) => Ok((*first, rest)),
        None => Err(Error::Protocol("read_u8: empty buffer".into())),
    }
}

/// Read 2-byte little-endian unsigned integer.
#[inline]
pub fn read_u16_le(data: &[u8]) -> Result<(u16, &[u8])> {
    if data.len() < 2 {
        return Err(Error::Protocol(format!(
            "read_u16_le: buffer too short: {} < 2",
            data.len()
        )));
    }
    let value = U16LE::ref_from_bytes(&data[..2])
        .map_err(|e| Error::Protocol(format!("read_u16_le: {e:?}")))?
        .get();
    Ok((value, &data[2..]))
}

/// Read 3-byte little-endian unsigned integer.
#[inline]
pub fn read_u24_le(data: &[u8]) -> Result<(u32, &[u8])> {
    if data.len() < 3 {
        return Err(Error::Protocol(format!(
            "read_u24_le: buffer too short: {} < 3",
            data.len()
        )));
    }
    let value = u32::from(data[0]) | (u32::from(data[1]) << 8) | (u32::from(data[2]) << 16);
    Ok((value, &data[3..]))
}

/// Read 4-byte little-endian unsigned integer.
#[inline]
pub fn read_u32_le(data: &[u8]) -> Result<(u32, &[u8])> {
    if data.len() < 4 {
        return Err(Error::Protocol(format!(
            "read_u32_le: buffer too short: {} < 4",
            data.len()
        )));
    }
    let value = U32LE::ref_from_bytes(&data[..4])
        .map_err(|e| Error::Protocol(format!("read_u32_le: {e:?}")))?
        .get();
    Ok((value, &data[4..]))
}

/// Read 8-byte little-endian unsigned integer.
#[inline]
pub fn read_u64_le(data: &[u8]) -> Result<(u64, &[u8])> {
    if data.len() < 8 {
        return Err(Error::Protocol(format!(
            "read_u64_le: buffer too short: {} < 8",
            data.len()
        )));
    }
    let value = U64LE::ref_from_bytes(&data[..8])
        .map_err(|e| Error::Protocol(format!("read_u64_le: {e:?}")))?
        .get();
    Ok((value, &data[8..]))
}

/// Read a length-encoded integer.
///
/// - `0x00..=0xFA`: the byte itself
/// - `0xFC`: 2-byte value follows
/// - `0xFD`: 3-byte value follows
/// - `0xFE`: 8-byte value follows
#[inline]
pub fn read_lenenc_int(data: &[u8]) -> Result<(u64, &[u8])> {
    let (first, rest) = read_u8(data)?;
    match first {
        0x00..=0xFA => Ok((u64::from(first), rest)),
        0xFC => read_u16_le(rest).map(|(v, r)| (u64::from(v), r)),
        0xFD => read_u24_le(rest).map(|(v, r)| (u64::from(v), r)),
        0xFE => read_u64_le(rest),
        _ => Err(Error::Protocol(format!(
            "read_lenenc_int: invalid prefix 0x{first:02X}"
        ))),
    }
}

/// Read fixed-length bytes.
#[inline]
pub fn read_bytes(data: &[u8], len: usize) -> Result<(&[u8], &[u8])> {
    if data.len() < len {
        return Err(Error::Protocol(format!(
            "read_bytes: buffer too short: {} < {}",
            data.len(),
            len
        )));
    }
    Ok((&data[..len], &data[len..]))
}

/// Decode text sent by the server, replacing invalid UTF-8.
pub fn decode_text(bytes: &[u8]) -> String {
    match simdutf8::basic::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Write 1-byte unsigned integer.
#[inline]
pub fn write_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

/// Write 2-byte little-endian unsigned integer.
#[inline]
pub fn write_u16_le(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Write 3-byte little-endian unsigned integer.
#[inline]
pub fn write_u24_le(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes()[..3]);
}

/// Write a length-encoded integer.
#[inline]
pub fn write_lenenc_int(out: &mut Vec<u8>, value: u64) {
    if value < 0xFB {
        out.push(value as u8);
    } else if value <= 0xFFFF {
        out.push(0xFC);
        out.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xFF_FFFF {
        out.push(0xFD);
        write_u24_le(out, value as u32);
    } else {
        out.push(0xFE);
        out.extend_from_slice(&value.to_le_bytes());
    }
}

/// Write raw bytes.
#[inline]
pub fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data);
}

/// Packet builder helper that handles the 4-byte header.
///
/// MySQL packet format:
/// - Payload length (3 bytes, little-endian) - excludes the header
/// - Sequence id (1 byte)
/// - Payload
pub struct PacketBuilder<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
}

impl<'a> PacketBuilder<'a> {
    /// Start building a packet with the given sequence id.
    pub fn new(buf: &'a mut Vec<u8>, sequence_id: u8) -> Self {
        let start = buf.len();
        buf.extend_from_slice(&[0, 0, 0, sequence_id]); // Placeholder for length
        Self { buf, start }
    }

    /// Write a u8.
    pub fn write_u8(&mut self, value: u8) {
        write_u8(self.buf, value);
    }

    /// Write a u16.
    pub fn write_u16(&mut self, value: u16) {
        write_u16_le(self.buf, value);
    }

    /// Write a length-encoded integer.
    pub fn write_lenenc_int(&mut self, value: u64) {
        write_lenenc_int(self.buf, value);
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, data: &[u8]) {
        write_bytes(self.buf, data);
    }

    /// Finish building the packet and fill in the length field.
    ///
    /// Payloads longer than [`MAX_PAYLOAD_LEN`] are truncated.
    pub fn finish(self) {
        let mut len = self.buf.len() - self.start - 4;
        if len > MAX_PAYLOAD_LEN {
            self.buf.truncate(self.start + 4 + MAX_PAYLOAD_LEN);
            len = MAX_PAYLOAD_LEN;
        }
        let bytes = (len as u32).to_le_bytes();
        self.buf[self.start..self.start + 3].copy_from_slice(&bytes[..3]);
    }
}
