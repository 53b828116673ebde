use std::{error, fmt, io};

use super::proto::OpCode;

/// WebSocket frame level violations. Most of these take the connection down
/// with close code 1002.
#[derive(Debug)]
pub enum ProtocolError {
    /// Client frames must be masked.
    UnmaskedFrame,

    /// Reserved bits set without a negotiated extension.
    ReservedBits,

    /// Opcode outside the rfc 6455 table.
    InvalidOpcode(u8),

    /// Control frame payload over 125 bytes.
    ControlFrameTooLong(usize),

    /// Control frame with the fin bit clear.
    FragmentedControlFrame,

    /// Payload over the configured size limit.
    Overflow,

    /// Continuation frame without a started fragmented message.
    ContinuationNotStarted,

    /// New fragmented message while another is in flight.
    ContinuationStarted,

    /// Unexpected opcode inside a fragmented message.
    ContinuationFragment(OpCode),

    /// Close payload of one byte, or a reason that is not utf-8.
    BadClosePayload,

    /// Operation on a socket that already closed.
    Closed,

    /// Transport failure mid frame.
    Io(io::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UnmaskedFrame => f.write_str("received unmasked client frame"),
            Self::ReservedBits => f.write_str("reserved bits set"),
            Self::InvalidOpcode(code) => write!(f, "invalid opcode {code}"),
            Self::ControlFrameTooLong(len) => write!(f, "control frame payload of {len} bytes"),
            Self::FragmentedControlFrame => f.write_str("fragmented control frame"),
            Self::Overflow => f.write_str("payload over size limit"),
            Self::ContinuationNotStarted => f.write_str("continuation without started message"),
            Self::ContinuationStarted => f.write_str("continuation already started"),
            Self::ContinuationFragment(op) => write!(f, "unexpected {op} inside fragmented message"),
            Self::BadClosePayload => f.write_str("malformed close payload"),
            Self::Closed => f.write_str("websocket is closed"),
            Self::Io(ref e) => write!(f, "io error: {e}"),
        }
    }
}

impl error::Error for ProtocolError {}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// WebSocket handshake rejections. `GetMethodRequired` renders as a 405,
/// the rest as 400s.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeError {
    /// Upgrades are GET only.
    GetMethodRequired,

    /// Upgrades require http/1.1.
    WrongHttpVersion,

    /// `Host` header missing.
    NoHostHeader,

    /// `Upgrade` header absent or not `websocket`.
    NoWebsocketUpgrade,

    /// `Connection` header absent or missing the `upgrade` token.
    NoConnectionUpgrade,

    /// `Sec-WebSocket-Version` header missing.
    NoVersionHeader,

    /// `Sec-WebSocket-Version` present but not 13.
    UnsupportedVersion,

    /// `Sec-WebSocket-Key` missing or not 16 bytes once decoded.
    BadWebsocketKey,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::GetMethodRequired => f.write_str("method must be GET"),
            Self::WrongHttpVersion => f.write_str("http version must be 1.1"),
            Self::NoHostHeader => f.write_str("missing host header"),
            Self::NoWebsocketUpgrade => f.write_str("missing websocket upgrade header"),
            Self::NoConnectionUpgrade => f.write_str("missing connection upgrade header"),
            Self::NoVersionHeader => f.write_str("missing sec-websocket-version header"),
            Self::UnsupportedVersion => f.write_str("unsupported websocket version"),
            Self::BadWebsocketKey => f.write_str("bad sec-websocket-key header"),
        }
    }
}

impl error::Error for HandshakeError {}
