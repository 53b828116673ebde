use std::fmt;

/// Operation codes of rfc 6455.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum OpCode {
    /// Continuation of a fragmented message.
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Anything outside the table above.
    Bad,
}

impl OpCode {
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => f.write_str("CONTINUE"),
            Self::Text => f.write_str("TEXT"),
            Self::Binary => f.write_str("BINARY"),
            Self::Close => f.write_str("CLOSE"),
            Self::Ping => f.write_str("PING"),
            Self::Pong => f.write_str("PONG"),
            Self::Bad => f.write_str("BAD"),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        match op {
            OpCode::Continue => 0,
            OpCode::Text => 1,
            OpCode::Binary => 2,
            OpCode::Close => 8,
            OpCode::Ping => 9,
            OpCode::Pong => 10,
            // never encoded. a close frame tears the session down fastest
            // if it does slip through.
            OpCode::Bad => 8,
        }
    }
}

impl From<u8> for OpCode {
    fn from(byte: u8) -> OpCode {
        match byte {
            0 => OpCode::Continue,
            1 => OpCode::Text,
            2 => OpCode::Binary,
            8 => OpCode::Close,
            9 => OpCode::Ping,
            10 => OpCode::Pong,
            _ => OpCode::Bad,
        }
    }
}

/// Close status codes. The named ones cover rfc 6455 section 7.4.1;
/// everything else round trips through [CloseCode::Other].
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum CloseCode {
    /// 1000. The purpose of the connection was fulfilled.
    Normal,
    /// 1001. Endpoint going away.
    Away,
    /// 1002. Protocol error.
    Protocol,
    /// 1003. Data the endpoint cannot accept.
    Unsupported,
    /// 1006. Abnormal closure, never sent on the wire.
    Abnormal,
    /// 1007. Payload inconsistent with message type.
    Invalid,
    /// 1008. Policy violation.
    Policy,
    /// 1009. Message too big.
    Size,
    /// 1010. Client required an extension the server did not negotiate.
    Extension,
    /// 1011. Server hit an unexpected condition.
    Error,
    /// 1012. Server restarting.
    Restart,
    /// 1013. Try again later.
    Again,
    Other(u16),
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Restart => 1012,
            CloseCode::Again => 1013,
            CloseCode::Other(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            1012 => CloseCode::Restart,
            1013 => CloseCode::Again,
            code => CloseCode::Other(code),
        }
    }
}

/// Why an endpoint is closing the connection.
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct CloseReason {
    pub code: CloseCode,
    pub description: Option<String>,
}

impl From<CloseCode> for CloseReason {
    fn from(code: CloseCode) -> Self {
        CloseReason {
            code,
            description: None,
        }
    }
}

impl<T: Into<String>> From<(CloseCode, T)> for CloseReason {
    fn from((code, description): (CloseCode, T)) -> Self {
        CloseReason {
            code,
            description: Some(description.into()),
        }
    }
}

/// The fixed rfc 6455 handshake GUID.
const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` for a given `Sec-WebSocket-Key` value:
/// base64(sha1(key + GUID)), always 28 bytes.
pub fn hash_key(key: &[u8]) -> [u8; 28] {
    use sha1::Digest as _;

    let mut hasher = sha1::Sha1::new();
    hasher.update(key);
    hasher.update(WS_GUID);
    let hash = hasher.finalize();

    let mut out = [0; 28];
    let n = base64::engine::Engine::encode_slice(&base64::engine::general_purpose::STANDARD, hash, &mut out)
        .expect("sha1 output is 20 bytes, base64 of it 28");
    debug_assert_eq!(n, 28);
    out
}
