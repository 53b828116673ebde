use std::str::FromStr;

use crate::error::Error;

/// Path parameters captured by a route match, in pattern order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params {
    inner: Vec<(String, String)>,
}

impl Params {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.push((key.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Raw capture for `name`, exactly as it appeared in the path.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Typed capture for `name`.
    ///
    /// The annotation-as-constructor behavior of dynamic handlers maps onto
    /// [FromStr] here: a missing capture or a failed parse both surface as
    /// [Error::BadConversion] naming the parameter and the target type,
    /// which the dispatcher reports as a 400.
    pub fn parse<T>(&self, name: &str) -> Result<T, Error>
    where
        T: FromStr,
    {
        self.get(name)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| Error::BadConversion {
                param: name.to_owned(),
                ty: std::any::type_name::<T>(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
