use crate::cookie::CookieJar;

/// Case insensitive ordered header multimap.
///
/// Lookup ignores ascii case, iteration preserves insertion order and
/// duplicate names are retained. This is the shape the wire gives us and the
/// shape middlewares expect to see again when a response is serialized.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value registered under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values registered under `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a value, keeping existing entries for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every entry for `name` with a single value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// Remove all entries for `name`, returning how many were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// `Content-Length` as a non negative integer, if present and well formed.
    pub fn content_length(&self) -> Option<u64> {
        self.get("content-length")?.trim().parse().ok()
    }

    /// The media type portion of `Content-Type`, without parameters.
    pub fn content_type(&self) -> Option<&str> {
        let value = self.get("content-type")?;
        Some(value.split(';').next().unwrap_or(value).trim())
    }

    /// The `charset` parameter of `Content-Type`, if any.
    pub fn charset(&self) -> Option<&str> {
        let value = self.get("content-type")?;
        value.split(';').skip(1).find_map(|part| {
            let (key, val) = part.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| val.trim().trim_matches('"'))
        })
    }

    /// Cookies parsed from every `Cookie` header on the request.
    pub fn cookies(&self) -> CookieJar {
        let mut jar = CookieJar::new();
        for value in self.get_all("cookie") {
            jar.parse_cookie_header(value);
        }
        jar
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str())))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/html");
        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
        assert!(headers.contains("Content-type"));
    }

    #[test]
    fn duplicates_in_order() {
        let mut headers = Headers::new();
        headers.append("Accept", "text/html");
        headers.append("X-Extra", "1");
        headers.append("accept", "application/json");

        let accepts: Vec<_> = headers.get_all("accept").collect();
        assert_eq!(accepts, ["text/html", "application/json"]);

        // first value wins for plain get.
        assert_eq!(headers.get("ACCEPT"), Some("text/html"));

        // insertion order preserved across names.
        let names: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["Accept", "X-Extra", "accept"]);
    }

    #[test]
    fn insert_replaces() {
        let mut headers = Headers::new();
        headers.append("x-a", "1");
        headers.append("X-A", "2");
        headers.insert("x-a", "3");
        assert_eq!(headers.get_all("x-a").count(), 1);
        assert_eq!(headers.get("x-a"), Some("3"));
    }

    #[test]
    fn typed_views() {
        let mut headers = Headers::new();
        headers.append("Content-Length", "42");
        headers.append("Content-Type", "text/html; charset=utf-8");
        assert_eq!(headers.content_length(), Some(42));
        assert_eq!(headers.content_type(), Some("text/html"));
        assert_eq!(headers.charset(), Some("utf-8"));

        let mut bad = Headers::new();
        bad.append("Content-Length", "abc");
        assert_eq!(bad.content_length(), None);
        assert_eq!(bad.content_type(), None);
    }

    #[test]
    fn cookie_view() {
        let mut headers = Headers::new();
        headers.append("Cookie", "a=1; b=2");
        let jar = headers.cookies();
        assert_eq!(jar.get("a").map(|c| c.value()), Some("1"));
        assert_eq!(jar.get("b").map(|c| c.value()), Some("2"));
    }
}
