use crate::error::{KeyMinderError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String-keyed settings store, used for both the application-wide settings and
/// the settings scoped to one file.
///
/// Keys are restricted to `[A-Za-z0-9_.:]+`; anything else is rejected with
/// [`KeyMinderError::InvalidKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':'))
}

pub fn validate_key(key: &str) -> Result<()> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(KeyMinderError::InvalidKey(key.to_string()))
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a settings map from untrusted pairs (e.g. a file on disk).
    pub fn from_map(values: BTreeMap<String, String>) -> Result<Self> {
        for key in values.keys() {
            validate_key(key)?;
        }
        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
            None => default,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Stores `value` under `key`, returning the previous value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<Option<String>> {
        validate_key(key)?;
        Ok(self.values.insert(key.to_string(), value.into()))
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dotted_and_namespaced_keys() {
        let mut s = Settings::new();
        s.set("tree.undo.limit", "30").unwrap();
        s.set("sshtools:putty_path", "/usr/bin/putty").unwrap();
        assert_eq!(s.get("tree.undo.limit"), Some("30"));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn rejects_invalid_keys() {
        let mut s = Settings::new();
        for key in ["", "with space", "slash/key", "umlaut_ä", "dash-key"] {
            let err = s.set(key, "x").unwrap_err();
            assert!(matches!(err, KeyMinderError::InvalidKey(_)), "{key}");
        }
        assert!(s.is_empty());
    }

    #[test]
    fn set_returns_previous_value() {
        let mut s = Settings::new();
        assert_eq!(s.set("a", "1").unwrap(), None);
        assert_eq!(s.set("a", "2").unwrap(), Some("1".to_string()));
        assert_eq!(s.remove("a"), Some("2".to_string()));
        assert!(!s.contains("a"));
    }

    #[test]
    fn bool_lookup_with_default() {
        let mut s = Settings::new();
        s.set("flag", "TRUE").unwrap();
        s.set("off", "no").unwrap();
        assert!(s.get_bool("flag", false));
        assert!(!s.get_bool("off", true));
        assert!(s.get_bool("absent", true));
    }

    #[test]
    fn from_map_validates_every_key() {
        let mut map = BTreeMap::new();
        map.insert("ok".to_string(), "1".to_string());
        assert!(Settings::from_map(map.clone()).is_ok());
        map.insert("not ok".to_string(), "1".to_string());
        assert!(Settings::from_map(map).is_err());
    }
}
