use std::fmt;

/// A single cookie: name, value and whatever attributes came with it.
///
/// Attributes are kept verbatim in arrival order, including ones this crate
/// knows nothing about, so a jar can round trip `Set-Cookie` lines without
/// loss.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    attributes: Vec<(String, Option<String>)>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            attributes: Vec::new(),
        }
    }

    /// Parse a `Set-Cookie` style line: `name=value; Attr; Attr=val; ...`.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(';');
        let (name, value) = split_pair(parts.next()?)?;

        let mut cookie = Cookie::new(name, value);
        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((key, val)) => cookie.set_attribute(key.trim(), Some(val.trim())),
                None => cookie.set_attribute(part, None),
            }
        }
        Some(cookie)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    /// Attribute lookup is case insensitive, mirroring how user agents treat
    /// `Path`/`path` etc.
    pub fn attribute(&self, key: &str) -> Option<Option<&str>> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_deref())
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: Option<&str>) {
        self.attributes.push((key.into(), value.map(str::to_owned)));
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }
}

impl fmt::Display for Cookie {
    /// Renders a `Set-Cookie` compatible line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        for (key, value) in &self.attributes {
            match value {
                Some(value) => write!(f, "; {key}={value}")?,
                None => write!(f, "; {key}")?,
            }
        }
        Ok(())
    }
}

fn split_pair(part: &str) -> Option<(&str, &str)> {
    let (name, value) = part.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name, value.trim()))
}

/// Name keyed cookie collection.
#[derive(Clone, Debug, Default)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name() == name)
    }

    /// Add a cookie. A duplicate name does not replace the original; the
    /// first occurrence stays authoritative for [CookieJar::get].
    pub fn add(&mut self, cookie: Cookie) {
        self.cookies.push(cookie);
    }

    pub fn remove(&mut self, name: &str) -> Option<Cookie> {
        let idx = self.cookies.iter().position(|c| c.name() == name)?;
        Some(self.cookies.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.iter()
    }

    /// Parse a request `Cookie` header (`a=1; b=2`) into the jar.
    pub(crate) fn parse_cookie_header(&mut self, value: &str) {
        for part in value.split(';') {
            if let Some((name, value)) = split_pair(part) {
                self.add(Cookie::new(name, value));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_set_cookie() {
        let cookie = Cookie::parse("session=abc123; Path=/; HttpOnly; X-Custom=keep").unwrap();
        assert_eq!(cookie.name(), "session");
        assert_eq!(cookie.value(), "abc123");
        assert_eq!(cookie.attribute("path"), Some(Some("/")));
        assert_eq!(cookie.attribute("HttpOnly"), Some(None));
        // unknown attributes survive verbatim.
        assert_eq!(cookie.attribute("x-custom"), Some(Some("keep")));
        assert_eq!(
            cookie.to_string(),
            "session=abc123; Path=/; HttpOnly; X-Custom=keep"
        );
    }

    #[test]
    fn parse_rejects_bare_token() {
        assert!(Cookie::parse("no-equals-sign").is_none());
        assert!(Cookie::parse("=value").is_none());
    }

    #[test]
    fn jar_prefers_first_duplicate() {
        let mut jar = CookieJar::new();
        jar.parse_cookie_header("a=first; b=2; a=second");
        assert_eq!(jar.len(), 3);
        assert_eq!(jar.get("a").map(|c| c.value()), Some("first"));
    }
}
