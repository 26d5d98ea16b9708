//! Classification of backend replies.
//!
//! A transaction control command normally gets a single OK or ERR packet.
//! Anything else is a result set, which the classifier walks through
//! (column count, column definitions, EOF, rows, EOF) so the caller can
//! report it once and keep the link in sync.

use crate::error::{Error, Result, ServerError};
use crate::protocol::RawPacket;
use crate::protocol::codec::read_lenenc_int;
use crate::protocol::packet::{msg_type, parse_err};

/// Reply state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingResponse,
    ReadingFields { remaining: u64 },
    WaitingFieldEof,
    ReadingRows,
}

/// What one backend packet means.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    /// OK packet
    Ok,
    /// ERR packet
    Error(ServerError),
    /// Start of a result set; column definitions follow
    ResultSetStart {
        /// Number of columns
        columns: u64,
    },
    /// A column definition was consumed
    Field,
    /// End of column definitions
    FieldEof,
    /// A row
    Row,
    /// End of rows
    RowEof,
}

/// Backend reply classifier.
#[derive(Debug)]
pub struct ReplyStateMachine {
    state: State,
}

impl Default for ReplyStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyStateMachine {
    /// Create a classifier waiting for a response.
    pub fn new() -> Self {
        Self {
            state: State::WaitingResponse,
        }
    }

    /// Whether the classifier is between replies.
    pub fn is_idle(&self) -> bool {
        self.state == State::WaitingResponse
    }

    /// Classify the next packet.
    pub fn step(&mut self, packet: &RawPacket<'_>) -> Result<ReplyEvent> {
        if packet.is_error() {
            self.state = State::WaitingResponse;
            return Ok(ReplyEvent::Error(parse_err(packet.payload)?));
        }

        match self.state {
            State::WaitingResponse => self.handle_response(packet),
            State::ReadingFields { remaining } => {
                self.state = if remaining <= 1 {
                    State::WaitingFieldEof
                } else {
                    State::ReadingFields {
                        remaining: remaining - 1,
                    }
                };
                Ok(ReplyEvent::Field)
            }
            State::WaitingFieldEof => {
                if !packet.is_eof() {
                    return Err(Error::Protocol(
                        "Expected EOF after column definitions".into(),
                    ));
                }
                self.state = State::ReadingRows;
                Ok(ReplyEvent::FieldEof)
            }
            State::ReadingRows => {
                if packet.is_eof() {
                    self.state = State::WaitingResponse;
                    Ok(ReplyEvent::RowEof)
                } else {
                    Ok(ReplyEvent::Row)
                }
            }
        }
    }

    fn handle_response(&mut self, packet: &RawPacket<'_>) -> Result<ReplyEvent> {
        match packet.first_byte() {
            Some(msg_type::OK) => Ok(ReplyEvent::Ok),
            Some(msg_type::LOCAL_INFILE) => Err(Error::Protocol(
                "Unexpected LOCAL INFILE request".into(),
            )),
            Some(_) => {
                let (columns, _) = read_lenenc_int(packet.payload)?;
                if columns == 0 {
                    return Err(Error::Protocol("Result set with zero columns".into()));
                }
                self.state = State::ReadingFields { remaining: columns };
                Ok(ReplyEvent::ResultSetStart { columns })
            }
            None => Err(Error::Protocol("Empty packet".into())),
        }
    }
}
