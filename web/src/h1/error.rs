use std::{error, fmt};

/// Malformed http/1.1 request head. Every variant ends up as a 400 except
/// [ProtoError::HeaderTooLarge] which is reported as a 431.
#[derive(Debug)]
pub enum ProtoError {
    /// Head grew past the read buffer limit before terminating.
    HeaderTooLarge,

    /// Head bytes ended before the terminating blank line.
    Incomplete,

    /// Tokenizer level rejection (bad version, folded header, ctl bytes...).
    Parse(httparse::Error),

    /// Method token could not be parsed.
    Method,

    /// Request target could not be parsed.
    Target,

    /// Header value carried bytes outside the accepted range.
    HeaderValue,

    /// Conflicting or malformed `Content-Length`.
    ContentLength,
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::HeaderTooLarge => f.write_str("request head too large"),
            Self::Incomplete => f.write_str("incomplete request head"),
            Self::Parse(ref e) => write!(f, "{e}"),
            Self::Method => f.write_str("invalid method token"),
            Self::Target => f.write_str("invalid request target"),
            Self::HeaderValue => f.write_str("invalid header value"),
            Self::ContentLength => f.write_str("invalid content-length"),
        }
    }
}

impl error::Error for ProtoError {}

impl From<httparse::Error> for ProtoError {
    fn from(e: httparse::Error) -> Self {
        Self::Parse(e)
    }
}
