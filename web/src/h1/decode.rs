use std::time::Duration;

use bytes::Bytes;
use http::{Method, Version};

use super::error::ProtoError;
use crate::{
    error::Error,
    headers::Headers,
    stream::{with_timeout, Reader},
    url::Url,
};

/// Upper bound on the request head (status line + headers + blank line).
pub(crate) const HEAD_LIMIT: usize = 64 * 1024;

pub(crate) const MAX_HEADERS: usize = 64;

/// Parsed request head. Body bytes stay on the reader.
pub(crate) struct RequestHead {
    pub method: Method,
    pub url: Url,
    pub version: Version,
    pub headers: Headers,
}

/// Decode one request head off the reader.
///
/// `Ok(None)` means the peer went away without starting (or finishing) a
/// request; the caller closes silently. Anything malformed surfaces as a
/// [ProtoError].
pub(crate) async fn decode_head(
    reader: &mut Reader,
    timeout: Option<Duration>,
) -> Result<Option<RequestHead>, Error> {
    let Some(head) = read_head_bytes(reader, timeout).await? else {
        return Ok(None);
    };

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    match parsed.parse(&head).map_err(ProtoError::from)? {
        httparse::Status::Complete(_) => {}
        // the terminating blank line was read, so a partial parse means the
        // head itself is malformed rather than still in flight.
        httparse::Status::Partial => return Err(ProtoError::Incomplete.into()),
    }

    let method =
        Method::from_bytes(parsed.method.unwrap_or_default().as_bytes()).map_err(|_| ProtoError::Method)?;

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(ProtoError::Parse(httparse::Error::Version).into()),
    };

    let url = Url::parse(parsed.path.ok_or(ProtoError::Target)?)?;

    let mut out = Headers::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let value = std::str::from_utf8(header.value).map_err(|_| ProtoError::HeaderValue)?;
        out.append(header.name, value);
    }

    check_content_length(&out)?;

    Ok(Some(RequestHead {
        method,
        url,
        version,
        headers: out,
    }))
}

/// Pull bytes until the head terminator, bounded by [HEAD_LIMIT].
/// `Ok(None)` on EOF before the terminator.
async fn read_head_bytes(reader: &mut Reader, timeout: Option<Duration>) -> Result<Option<Bytes>, Error> {
    with_timeout(timeout, async {
        loop {
            if let Some(head) = reader.take_buffered_until(b"\r\n\r\n") {
                return Ok(Some(head));
            }
            if reader.buffered() > HEAD_LIMIT {
                return Err(ProtoError::HeaderTooLarge.into());
            }
            if reader.fill().await? == 0 {
                return Ok(None);
            }
        }
    })
    .await
}

/// Reject requests carrying several `Content-Length` values that disagree,
/// or one that does not parse. A repeated identical value is tolerated.
fn check_content_length(headers: &Headers) -> Result<(), ProtoError> {
    let mut seen: Option<u64> = None;
    for value in headers.get_all("content-length") {
        let parsed: u64 = value.trim().parse().map_err(|_| ProtoError::ContentLength)?;
        match seen {
            Some(prev) if prev != parsed => return Err(ProtoError::ContentLength),
            _ => seen = Some(parsed),
        }
    }
    Ok(())
}
