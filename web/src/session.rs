use std::collections::HashMap;

use crate::cookie::Cookie;

/// Cookie backed session: a json object stored in a single cookie.
///
/// Nothing here is signed or encrypted; treat the contents as client
/// controlled input the same way the `Cookie` header itself is.
#[derive(Clone, Debug, Default)]
pub struct Session {
    data: HashMap<String, serde_json::Value>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a session out of its cookie. An absent or unparseable cookie
    /// yields an empty session.
    pub fn from_cookie(cookie: Option<&Cookie>) -> Self {
        let data = cookie
            .and_then(|c| serde_json::from_str(c.value()).ok())
            .unwrap_or_default();
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Render the session back into its cookie for a response.
    pub fn to_cookie(&self, name: &str) -> Cookie {
        let value = serde_json::to_string(&self.data).unwrap_or_else(|_| "{}".into());
        let mut cookie = Cookie::new(name, value);
        cookie.set_attribute("Path", Some("/"));
        cookie.set_attribute("HttpOnly", None);
        cookie
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cookie_round_trip() {
        let mut session = Session::new();
        session.insert("user", "izzy");
        session.insert("visits", 3);

        let cookie = session.to_cookie("session");
        let restored = Session::from_cookie(Some(&cookie));
        assert_eq!(restored.get("user"), Some(&serde_json::json!("izzy")));
        assert_eq!(restored.get("visits"), Some(&serde_json::json!(3)));
    }

    #[test]
    fn missing_or_garbled_cookie_is_empty() {
        assert!(Session::from_cookie(None).is_empty());
        let cookie = Cookie::new("session", "not-json");
        assert!(Session::from_cookie(Some(&cookie)).is_empty());
    }
}
