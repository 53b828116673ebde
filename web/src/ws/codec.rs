use bytes::{Bytes, BytesMut};

use super::error::ProtocolError;
use super::frame;
use super::proto::{CloseReason, OpCode};

/// A websocket message, one or more frames already reassembled at the
/// fragment boundary level.
#[derive(Debug, Eq, PartialEq)]
pub enum Message {
    Text(Bytes),
    Binary(Bytes),
    /// One fragment of a fragmented message.
    Continuation(Item),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseReason>),
}

/// A fragment of a fragmented message.
#[derive(Debug, Eq, PartialEq)]
pub enum Item {
    FirstText(Bytes),
    FirstBinary(Bytes),
    Continue(Bytes),
    Last(Bytes),
}

/// Server side message codec. Tracks the continuation state across frames
/// so fragment sequencing errors surface as protocol errors instead of
/// garbled messages.
#[derive(Debug)]
pub struct Codec {
    continuation: bool,
    max_size: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    pub fn new() -> Self {
        Self {
            continuation: false,
            max_size: 65_536,
        }
    }

    /// Cap on a single frame payload. 64kB by default.
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    pub fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match message {
            Message::Text(payload) => frame::write(dst, OpCode::Text, &payload, true),
            Message::Binary(payload) => frame::write(dst, OpCode::Binary, &payload, true),
            Message::Ping(payload) => frame::write(dst, OpCode::Ping, &payload, true),
            Message::Pong(payload) => frame::write(dst, OpCode::Pong, &payload, true),
            Message::Close(reason) => frame::write_close(dst, reason.as_ref()),
            Message::Continuation(item) => match item {
                Item::FirstText(payload) => {
                    self.start_continuation()?;
                    frame::write(dst, OpCode::Text, &payload, false);
                }
                Item::FirstBinary(payload) => {
                    self.start_continuation()?;
                    frame::write(dst, OpCode::Binary, &payload, false);
                }
                Item::Continue(payload) => {
                    if !self.continuation {
                        return Err(ProtocolError::ContinuationNotStarted);
                    }
                    frame::write(dst, OpCode::Continue, &payload, false);
                }
                Item::Last(payload) => {
                    if !self.continuation {
                        return Err(ProtocolError::ContinuationNotStarted);
                    }
                    self.continuation = false;
                    frame::write(dst, OpCode::Continue, &payload, true);
                }
            },
        }
        Ok(())
    }

    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let Some((fin, opcode, payload)) = frame::parse(src, self.max_size)? else {
            return Ok(None);
        };

        let message = match opcode {
            OpCode::Continue => {
                if !self.continuation {
                    return Err(ProtocolError::ContinuationNotStarted);
                }
                if fin {
                    self.continuation = false;
                    Message::Continuation(Item::Last(payload))
                } else {
                    Message::Continuation(Item::Continue(payload))
                }
            }
            OpCode::Text if !fin => {
                self.start_continuation()?;
                Message::Continuation(Item::FirstText(payload))
            }
            OpCode::Binary if !fin => {
                self.start_continuation()?;
                Message::Continuation(Item::FirstBinary(payload))
            }
            OpCode::Text => Message::Text(payload),
            OpCode::Binary => Message::Binary(payload),
            OpCode::Close => Message::Close(frame::parse_close_payload(&payload)?),
            OpCode::Ping => Message::Ping(payload),
            OpCode::Pong => Message::Pong(payload),
            OpCode::Bad => return Err(ProtocolError::InvalidOpcode(u8::from(opcode))),
        };

        Ok(Some(message))
    }

    fn start_continuation(&mut self) -> Result<(), ProtocolError> {
        if self.continuation {
            return Err(ProtocolError::ContinuationStarted);
        }
        self.continuation = true;
        Ok(())
    }
}
