use std::collections::HashMap;

/// Environment variables with this prefix are copied into [Settings] by
/// [Settings::from_env], prefix stripped and name upper-cased.
pub const SETTING_ENV_PREFIX: &str = "TRESTLE_";

/// Flat string settings mapping. Keys are upper-cased on every access so
/// `session_cookie_name` and `SESSION_COOKIE_NAME` address the same entry.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn new() -> Self {
        let mut settings = Self::default();
        settings.set("session_cookie_name", "session");
        settings
    }

    /// Settings seeded from prefixed environment variables.
    pub fn from_env() -> Self {
        let mut settings = Self::new();
        for (name, value) in std::env::vars() {
            if let Some(key) = name.strip_prefix(SETTING_ENV_PREFIX) {
                settings.set(key, value);
            }
        }
        settings
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&key.to_uppercase()).map(String::as_str)
    }

    pub fn set(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.values.insert(key.as_ref().to_uppercase(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(&key.to_uppercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
