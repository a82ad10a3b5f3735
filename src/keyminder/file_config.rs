use crate::cipher::CipherManager;
use crate::config::EngineConfig;
use crate::error::{KeyMinderError, Result};
use crate::format::{FormatRegistry, CONTAINER_VERSION};
use crate::settings::{validate_key, Settings};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File attribute holding the password hint shown next to the prompt.
pub const ATTR_PASSWORD_HINT: &str = "PasswordHint";

/// Persistence metadata of the open document: where it lives, which handler
/// writes it, how it is encrypted and the settings scoped to this file.
///
/// File attributes are stored in plain text outside the encrypted payload;
/// file settings travel inside it.
#[derive(Debug)]
pub struct FileConfiguration {
    path: Option<PathBuf>,
    format_id: String,
    version: String,
    cipher: CipherManager,
    attributes: BTreeMap<String, String>,
    settings: Settings,
}

impl FileConfiguration {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            path: None,
            format_id: config.default_format.clone(),
            version: CONTAINER_VERSION.to_string(),
            cipher: CipherManager::new(config),
            attributes: BTreeMap::new(),
            settings: Settings::new(),
        }
    }

    pub(crate) fn from_parts(
        path: PathBuf,
        format_id: &str,
        version: String,
        cipher: CipherManager,
        attributes: BTreeMap<String, String>,
        settings: Settings,
    ) -> Self {
        Self {
            path: Some(path),
            format_id: format_id.to_string(),
            version,
            cipher,
            attributes,
            settings,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = Some(path.into());
    }

    pub fn format_id(&self) -> &str {
        &self.format_id
    }

    /// Switches the handler used on the next save. Unknown identifiers leave
    /// the configuration unchanged.
    pub fn change_format(&mut self, registry: &FormatRegistry, format_id: &str) -> Result<()> {
        if !registry.contains(format_id) {
            return Err(KeyMinderError::UnknownFormat(format_id.to_string()));
        }
        self.format_id = format_id.to_string();
        Ok(())
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_encrypted()
    }

    pub fn cipher(&self) -> &CipherManager {
        &self.cipher
    }

    pub fn cipher_mut(&mut self) -> &mut CipherManager {
        &mut self.cipher
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        validate_key(key)?;
        self.attributes.insert(key.to_string(), value.into());
        Ok(())
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<String> {
        self.attributes.remove(key)
    }

    pub fn password_hint(&self) -> Option<&str> {
        self.attribute(ATTR_PASSWORD_HINT)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Wipes key material. Called whenever the file is closed.
    pub fn destroy(&mut self) {
        self.cipher.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_configuration_uses_defaults() {
        let file = FileConfiguration::new(&EngineConfig::default());
        assert_eq!(file.format_id(), "default");
        assert_eq!(file.version(), CONTAINER_VERSION);
        assert!(file.path().is_none());
        assert!(!file.is_encrypted());
    }

    #[test]
    fn unknown_format_leaves_configuration_unchanged() {
        let config = EngineConfig::default();
        let registry = FormatRegistry::with_builtin();
        let mut file = FileConfiguration::new(&config);

        let err = file.change_format(&registry, "xml/keymindfile").unwrap_err();
        assert!(matches!(err, KeyMinderError::UnknownFormat(_)));
        assert_eq!(file.format_id(), "default");

        file.change_format(&registry, "plain").unwrap();
        assert_eq!(file.format_id(), "plain");
    }

    #[test]
    fn attributes_validate_keys() {
        let mut file = FileConfiguration::new(&EngineConfig::default());
        file.set_attribute(ATTR_PASSWORD_HINT, "first pet").unwrap();
        assert_eq!(file.password_hint(), Some("first pet"));
        assert!(file.set_attribute("bad key", "x").is_err());
    }
}
