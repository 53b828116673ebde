use std::{error, fmt, io};

use bytes::Bytes;
use http::{Method, StatusCode};

use crate::h1::error::ProtoError;
use crate::ws::error::{HandshakeError, ProtocolError};

/// Error type shared by the whole framework.
///
/// Routing and conversion failures carry enough context to render the client
/// facing response; everything else maps to a generic 500.
#[derive(Debug)]
pub enum Error {
    /// A read or write ran over its deadline.
    Timeout,

    /// EOF hit before the requested delimiter/length. Carries whatever bytes
    /// did arrive.
    PartialRead(Bytes),

    /// Operation on a closed connection.
    Closed,

    /// Transport level error.
    Io(io::Error),

    /// Malformed http head.
    Proto(ProtoError),

    /// WebSocket handshake rejection.
    Handshake(HandshakeError),

    /// WebSocket frame level violation.
    WebSocket(ProtocolError),

    /// No route pattern matched the request path.
    NotFound { path: String },

    /// A pattern matched but with different methods registered.
    MethodNotAllowed { allow: Vec<Method> },

    /// A captured path parameter or body model failed typed conversion.
    BadConversion { param: String, ty: &'static str },

    /// Programmer error raised synchronously at registration time.
    /// Never reported to clients.
    Registration(String),

    /// Early exit from a handler with an explicit status, see
    /// `Request::abort` and `Request::redirect`.
    Status { status: StatusCode, message: Option<String> },

    /// Body (de)serialization failure.
    Json(serde_json::Error),
}

impl Error {
    /// Status code used when reporting this error to the peer.
    pub fn status_code(&self) -> StatusCode {
        match *self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::BadConversion { .. } | Self::Proto(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::Handshake(HandshakeError::GetMethodRequired) => StatusCode::METHOD_NOT_ALLOWED,
            Self::Handshake(_) => StatusCode::BAD_REQUEST,
            Self::Status { status, .. } => status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Timeout => f.write_str("operation timed out"),
            Self::PartialRead(ref partial) => {
                write!(f, "connection closed mid read ({} bytes buffered)", partial.len())
            }
            Self::Closed => f.write_str("connection is closed"),
            Self::Io(ref e) => write!(f, "io error: {e}"),
            Self::Proto(ref e) => write!(f, "protocol error: {e}"),
            Self::Handshake(ref e) => write!(f, "websocket handshake error: {e}"),
            Self::WebSocket(ref e) => write!(f, "websocket protocol error: {e}"),
            Self::NotFound { ref path } => write!(f, "could not find {path:?}"),
            Self::MethodNotAllowed { ref allow } => {
                write!(f, "method not allowed. allowed: {allow:?}")
            }
            Self::BadConversion { ref param, ty } => {
                write!(f, "failed conversion to {ty:?} for parameter {param:?}")
            }
            Self::Registration(ref msg) => f.write_str(msg),
            Self::Status { status, ref message } => match message {
                Some(msg) => write!(f, "{status}: {msg}"),
                None => write!(f, "{status}"),
            },
            Self::Json(ref e) => write!(f, "json error: {e}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Self::Io(ref e) => Some(e),
            Self::Json(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ProtoError> for Error {
    fn from(e: ProtoError) -> Self {
        Self::Proto(e)
    }
}

impl From<HandshakeError> for Error {
    fn from(e: HandshakeError) -> Self {
        Self::Handshake(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::WebSocket(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_mapping() {
        let e = Error::NotFound { path: "/x".into() };
        assert_eq!(e.status_code(), StatusCode::NOT_FOUND);

        let e = Error::MethodNotAllowed { allow: vec![Method::GET] };
        assert_eq!(e.status_code(), StatusCode::METHOD_NOT_ALLOWED);

        let e = Error::BadConversion {
            param: "id".into(),
            ty: "i64",
        };
        assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);
        assert!(e.to_string().contains("id"));
        assert!(e.to_string().contains("i64"));

        let e = Error::Timeout;
        assert_eq!(e.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
