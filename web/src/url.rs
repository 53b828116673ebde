use crate::error::Error;
use crate::h1::error::ProtoError;

/// A parsed request target.
///
/// Accepts the three target forms a server sees on the wire: origin form
/// (`/path?query`), absolute form (`http://host:port/path`) and authority
/// form (`host:port`, CONNECT only). Immutable once constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Url {
    scheme: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: String,
    raw_query: Option<String>,
    query: Vec<(String, String)>,
    fragment: Option<String>,
}

impl Url {
    pub fn parse(target: &str) -> Result<Self, Error> {
        if target.is_empty() {
            return Err(ProtoError::Target.into());
        }

        if target.starts_with('/') {
            return Self::parse_origin(None, None, None, target);
        }

        if let Some((scheme, rest)) = target.split_once("://") {
            if scheme.is_empty() || rest.is_empty() {
                return Err(ProtoError::Target.into());
            }
            let (authority, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => (rest, "/"),
            };
            let (host, port) = parse_authority(authority)?;
            return Self::parse_origin(Some(scheme.to_owned()), Some(host), port, path);
        }

        // authority form.
        let (host, port) = parse_authority(target)?;
        Ok(Self {
            scheme: None,
            host: Some(host),
            port,
            path: String::new(),
            raw_query: None,
            query: Vec::new(),
            fragment: None,
        })
    }

    fn parse_origin(
        scheme: Option<String>,
        host: Option<String>,
        port: Option<u16>,
        target: &str,
    ) -> Result<Self, Error> {
        let (target, fragment) = match target.split_once('#') {
            Some((t, f)) => (t, Some(f.to_owned())),
            None => (target, None),
        };
        let (path, raw_query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_owned())),
            None => (target, None),
        };

        Ok(Self {
            scheme,
            host,
            port,
            path: decode_path(path)?,
            query: raw_query.as_deref().map(parse_query).unwrap_or_default(),
            raw_query,
            fragment,
        })
    }

    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The query string exactly as it appeared on the wire.
    pub fn raw_query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    /// Query pairs in arrival order, exactly as written on the wire.
    /// Duplicate keys are retained.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// First query value for `name`.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn fragment(&self) -> Option<&str> {
        self.fragment.as_deref()
    }
}

fn parse_authority(authority: &str) -> Result<(String, Option<u16>), Error> {
    if authority.is_empty() {
        return Err(ProtoError::Target.into());
    }

    // bracketed ipv6 literal.
    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest.find(']').ok_or(ProtoError::Target)?;
        let host = format!("[{}]", &rest[..end]);
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => Some(p.parse().map_err(|_| ProtoError::Target)?),
            None if rest[end + 1..].is_empty() => None,
            None => return Err(ProtoError::Target.into()),
        };
        return Ok((host, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| ProtoError::Target)?;
            Ok((host.to_owned(), Some(port)))
        }
        None => Ok((authority.to_owned(), None)),
    }
}

// pairs keep their wire form: the query is never percent-decoded, only the
// path is (and there only for unreserved escapes).
fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.to_owned(), value.to_owned())
        })
        .collect()
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

/// Decode percent escapes in path segments, but only the ones that map to
/// unreserved characters. Reserved escapes (`%2F` and friends) keep their
/// encoded form so the segment structure cannot change under a route match.
fn decode_path(path: &str) -> Result<String, Error> {
    let bytes = path.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3).ok_or(ProtoError::Target)?;
            let value = hex_pair(hex).ok_or(ProtoError::Target)?;
            if is_unreserved(value) {
                out.push(value);
            } else {
                out.extend_from_slice(&bytes[i..i + 3]);
            }
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map_err(|_| ProtoError::Target.into())
}

fn hex_pair(hex: &[u8]) -> Option<u8> {
    let hi = (hex[0] as char).to_digit(16)?;
    let lo = (hex[1] as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}
