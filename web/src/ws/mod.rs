//! WebSocket upgrade handshake, frame codec and the post-upgrade socket.

pub mod error;

mod codec;
mod frame;
mod proto;
mod socket;

pub use self::codec::{Codec, Item, Message};
pub use self::proto::{hash_key, CloseCode, CloseReason, OpCode};
pub use self::socket::{WebSocket, WsState};

use http::{Method, StatusCode, Version};

use self::error::HandshakeError;
use crate::{headers::Headers, response::Response};

/// Validate an upgrade request, returning the raw `Sec-WebSocket-Key` value.
pub(crate) fn verify_handshake<'a>(
    method: &Method,
    version: Version,
    headers: &'a Headers,
) -> Result<&'a str, HandshakeError> {
    if method != Method::GET {
        return Err(HandshakeError::GetMethodRequired);
    }

    if version != Version::HTTP_11 {
        return Err(HandshakeError::WrongHttpVersion);
    }

    if !headers.contains("host") {
        return Err(HandshakeError::NoHostHeader);
    }

    let upgrade = headers
        .get("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgrade {
        return Err(HandshakeError::NoWebsocketUpgrade);
    }

    let connection = headers
        .get("connection")
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
    if !connection {
        return Err(HandshakeError::NoConnectionUpgrade);
    }

    match headers.get("sec-websocket-version") {
        None => return Err(HandshakeError::NoVersionHeader),
        Some("13") => {}
        Some(_) => return Err(HandshakeError::UnsupportedVersion),
    }

    let key = headers.get("sec-websocket-key").ok_or(HandshakeError::BadWebsocketKey)?;
    let decoded = base64::engine::Engine::decode(&base64::engine::general_purpose::STANDARD, key)
        .map_err(|_| HandshakeError::BadWebsocketKey)?;
    if decoded.len() != 16 {
        return Err(HandshakeError::BadWebsocketKey);
    }

    Ok(key)
}

/// Build the 101 switching protocols response for a verified key.
pub(crate) fn handshake_response(
    key: &str,
    subprotocol: Option<&str>,
    extensions: Option<&str>,
) -> Response {
    let accept = hash_key(key.as_bytes());

    let mut response = Response::new(StatusCode::SWITCHING_PROTOCOLS);
    response.headers_mut().append("upgrade", "websocket");
    response.headers_mut().append("connection", "Upgrade");
    response
        .headers_mut()
        .append("sec-websocket-accept", std::str::from_utf8(&accept).unwrap());

    if let Some(subprotocol) = subprotocol {
        response.headers_mut().append("sec-websocket-protocol", subprotocol);
    }
    if let Some(extensions) = extensions {
        response.headers_mut().append("sec-websocket-extensions", extensions);
    }

    response
}
