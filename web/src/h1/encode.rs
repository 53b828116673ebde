use bytes::BytesMut;
use http::{StatusCode, Version};

use crate::{date::DateHandle, headers::Headers};

/// Name advertised through the `Server` header when the handler set none.
pub(crate) const SERVER_NAME: &str = "trestle";

/// How the response body is framed on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BodySize {
    /// No body and no framing headers at all (101, HEAD...).
    None,
    /// Fixed size body. `Content-Length` is filled in when absent.
    Sized(usize),
    /// Producer driven body. `Transfer-Encoding: chunked` is filled in.
    Stream,
}

/// Serialize status line + headers + terminating blank line.
///
/// User supplied headers are written verbatim in insertion order. `Date`,
/// `Server` and the body framing header are appended only when the map does
/// not already carry them.
pub(crate) fn encode_head(
    buf: &mut BytesMut,
    version: Version,
    status: StatusCode,
    headers: &Headers,
    size: BodySize,
    date: &DateHandle,
) {
    encode_status_line(buf, version, status);

    let mut has_length = false;
    let mut has_te = false;
    let mut has_date = false;
    let mut has_server = false;

    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("content-length") {
            has_length = true;
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            has_te = true;
        } else if name.eq_ignore_ascii_case("date") {
            has_date = true;
        } else if name.eq_ignore_ascii_case("server") {
            has_server = true;
        }

        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if !has_length && !has_te {
        match size {
            BodySize::None => {}
            BodySize::Sized(len) => write_content_length(buf, len),
            BodySize::Stream => buf.extend_from_slice(b"transfer-encoding: chunked\r\n"),
        }
    }

    if !has_date {
        buf.extend_from_slice(b"date: ");
        date.with_date(|slice| buf.extend_from_slice(slice));
        buf.extend_from_slice(b"\r\n");
    }

    if !has_server {
        buf.extend_from_slice(b"server: ");
        buf.extend_from_slice(SERVER_NAME.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"\r\n");
}

fn encode_status_line(buf: &mut BytesMut, version: Version, status: StatusCode) {
    // happy path shortcut.
    if version == Version::HTTP_11 && status == StatusCode::OK {
        buf.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
        return;
    }

    match version {
        Version::HTTP_10 => buf.extend_from_slice(b"HTTP/1.0 "),
        _ => buf.extend_from_slice(b"HTTP/1.1 "),
    }

    buf.extend_from_slice(status.as_str().as_bytes());
    buf.extend_from_slice(b" ");
    // a reason must be written. plenty of parsers expect one.
    buf.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buf.extend_from_slice(b"\r\n");
}

fn write_content_length(buf: &mut BytesMut, len: usize) {
    let mut itoa = itoa::Buffer::new();
    let digits = itoa.format(len);
    buf.extend_from_slice(b"content-length: ");
    buf.extend_from_slice(digits.as_bytes());
    buf.extend_from_slice(b"\r\n");
}

/// Write one chunk of a `Transfer-Encoding: chunked` body. Empty input is
/// skipped: a zero sized chunk would terminate the stream early.
pub(crate) fn encode_chunk(buf: &mut BytesMut, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    let hex = format!("{:x}", data.len());
    buf.extend_from_slice(hex.as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

/// Terminate a chunked body.
pub(crate) fn encode_chunk_eof(buf: &mut BytesMut) {
    buf.extend_from_slice(b"0\r\n\r\n");
}
