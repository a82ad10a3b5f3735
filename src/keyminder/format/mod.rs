//! # Persistence Layer
//!
//! Converts between a [`Document`] and bytes on disk. Each on-disk format is a
//! [`StorageHandler`], registered in a [`FormatRegistry`] under an identifier
//! and a list of file extensions.
//!
//! ## Handlers
//!
//! - [`keymind::KeyMindHandler`] (`default`, `.keymind`/`.kmf`): versioned
//!   JSON container, optionally encrypted.
//! - [`plain::PlainHandler`] (`plain`, `.json`): unencrypted export of the
//!   tree and file settings. Refuses to save an encrypted configuration.
//!
//! ## Container Layout (`default`)
//!
//! ```text
//! {
//!   "format": "keyminder",
//!   "version": "1.0",
//!   "attributes": { "PasswordHint": "..." },     # always plain text
//!   "encryption": { cipher, kdf, salt, nonce },  # only when encrypted
//!   "payload": "<base64 ciphertext of body>",    # only when encrypted
//!   "body": { "settings": {..}, "nodes": [..] }  # only when not encrypted
//! }
//! ```
//!
//! Any `1.x` version is accepted. Writes go to a temporary sibling file that
//! is renamed over the target, so a failed save never truncates the old file.

use crate::cipher::{CipherManager, EncryptionHeader};
use crate::config::{EngineConfig, DEFAULT_FORMAT};
use crate::error::{KeyMinderError, Result, StorageFailure};
use crate::file_config::FileConfiguration;
use crate::model::NodeRecord;
use crate::prompt::PasswordPrompt;
use crate::settings::Settings;
use crate::store::Document;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod keymind;
pub mod plain;

pub const CONTAINER_VERSION: &str = "1.0";
pub const SUPPORTED_MAJOR: &str = "1";
pub const MAX_PASSWORD_ATTEMPTS: usize = 3;

/// Serialized document contents: the file settings plus the node tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub nodes: Vec<NodeRecord>,
}

impl Body {
    /// Re-validates settings keys read from disk.
    pub fn validated(self) -> Result<Self> {
        let settings = Settings::from_map(self.settings.as_map().clone())
            .map_err(|e| KeyMinderError::corrupt(e.to_string()))?;
        Ok(Self {
            settings,
            nodes: self.nodes,
        })
    }
}

/// A successfully read file.
#[derive(Debug)]
pub struct Loaded {
    pub nodes: Vec<NodeRecord>,
    pub file: FileConfiguration,
}

/// Where the password for an encrypted file comes from.
pub enum PasswordSource<'a> {
    /// Fail with `WrongPassword` if the file turns out to be encrypted.
    None,
    /// One attempt with this password.
    Given(&'a str),
    /// Ask up to [`MAX_PASSWORD_ATTEMPTS`] times. Cancelling or entering
    /// nothing abandons the open.
    Prompt(&'a mut dyn PasswordPrompt),
}

impl fmt::Debug for PasswordSource<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PasswordSource::None => "None",
            PasswordSource::Given(_) => "Given(***)",
            PasswordSource::Prompt(_) => "Prompt",
        };
        f.write_str(label)
    }
}

/// One on-disk format.
pub trait StorageHandler: Send + Sync {
    fn identifier(&self) -> &str;

    fn description(&self) -> &str;

    /// Lowercase extensions without the dot.
    fn extensions(&self) -> &[&str];

    fn supports_encryption(&self) -> bool;

    fn open(
        &self,
        path: &Path,
        config: &EngineConfig,
        password: PasswordSource<'_>,
    ) -> Result<Loaded>;

    fn save(&self, path: &Path, doc: &Document, file: &FileConfiguration) -> Result<()>;
}

/// Format handlers by identifier, with extension-based resolution.
pub struct FormatRegistry {
    handlers: Vec<Box<dyn StorageHandler>>,
    default_id: String,
}

impl fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("handlers", &self.identifiers().collect::<Vec<_>>())
            .field("default", &self.default_id)
            .finish()
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl FormatRegistry {
    pub fn new(default_id: impl Into<String>) -> Self {
        Self {
            handlers: Vec::new(),
            default_id: default_id.into(),
        }
    }

    /// Registry with the `default` and `plain` handlers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new(DEFAULT_FORMAT);
        registry.handlers.push(Box::new(keymind::KeyMindHandler));
        registry.handlers.push(Box::new(plain::PlainHandler));
        registry
    }

    /// Registers `handler`. Identifiers must be unique.
    pub fn register(&mut self, handler: Box<dyn StorageHandler>) -> Result<()> {
        if self.contains(handler.identifier()) {
            return Err(KeyMinderError::InvalidOperation(format!(
                "a handler for '{}' is already registered",
                handler.identifier()
            )));
        }
        debug!(format = handler.identifier(), "format handler registered");
        self.handlers.push(handler);
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.handlers.iter().any(|h| h.identifier() == id)
    }

    pub fn get(&self, id: &str) -> Result<&dyn StorageHandler> {
        self.handlers
            .iter()
            .find(|h| h.identifier() == id)
            .map(|h| h.as_ref())
            .ok_or_else(|| KeyMinderError::UnknownFormat(id.to_string()))
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|h| h.identifier())
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    /// Changes the fallback identifier. It must be registered.
    pub fn set_default_id(&mut self, id: &str) -> Result<()> {
        if !self.contains(id) {
            return Err(KeyMinderError::UnknownFormat(id.to_string()));
        }
        self.default_id = id.to_string();
        Ok(())
    }

    /// Handler identifier for `extension`, or `default` when none claims it.
    pub fn identifier_by_extension(&self, extension: &str, default: &str) -> String {
        let ext = extension.trim_start_matches('.').to_ascii_lowercase();
        self.handlers
            .iter()
            .find(|h| h.extensions().contains(&ext.as_str()))
            .map(|h| h.identifier().to_string())
            .unwrap_or_else(|| default.to_string())
    }

    /// Handler identifier for `filename`, falling back to the default.
    pub fn resolve(&self, filename: impl AsRef<Path>) -> String {
        match filename.as_ref().extension().and_then(|e| e.to_str()) {
            Some(ext) => self.identifier_by_extension(ext, &self.default_id),
            None => self.default_id.clone(),
        }
    }

    /// Reads `path` with the handler named by `format`, or the one its
    /// extension resolves to.
    pub fn open(
        &self,
        path: &Path,
        format: Option<&str>,
        config: &EngineConfig,
        password: PasswordSource<'_>,
    ) -> Result<Loaded> {
        let id = match format {
            Some(id) => id.to_string(),
            None => self.resolve(path),
        };
        let handler = self.get(&id)?;
        info!(path = %path.display(), format = %id, "opening file");
        handler.open(path, config, password)
    }

    /// Writes `doc` to the configured path with the configured handler.
    pub fn save(&self, doc: &Document, file: &FileConfiguration) -> Result<()> {
        let path = file
            .path()
            .ok_or_else(|| KeyMinderError::InvalidOperation("no file path set".to_string()))?;
        let handler = self.get(file.format_id())?;
        if file.is_encrypted() && !handler.supports_encryption() {
            return Err(KeyMinderError::IncompatibleFormat(
                handler.identifier().to_string(),
            ));
        }
        info!(path = %path.display(), format = handler.identifier(), "saving file");
        handler.save(path, doc, file)
    }
}

/// Accepts `1` and `1.x`. Anything else is reported as corrupt.
pub fn check_version(version: &str) -> Result<()> {
    let major = version.split('.').next().unwrap_or_default();
    if major == SUPPORTED_MAJOR {
        Ok(())
    } else {
        Err(KeyMinderError::corrupt(format!(
            "unsupported file version {version}"
        )))
    }
}

/// Writes `content` next to `path` under a temporary name, then renames it
/// over `path`.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");
    let tmp = dir.join(format!(".{}-{}.tmp", name, Uuid::new_v4()));
    fs::write(&tmp, content)?;
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err.into());
    }
    Ok(())
}

/// Decrypts a payload, asking for the password as `source` allows.
pub fn unlock_payload(
    config: &EngineConfig,
    header: &EncryptionHeader,
    ciphertext: &[u8],
    source: PasswordSource<'_>,
    hint: Option<&str>,
) -> Result<(CipherManager, Vec<u8>)> {
    match source {
        PasswordSource::None => Err(KeyMinderError::storage(
            StorageFailure::WrongPassword,
            "the file is encrypted and no password was given",
        )),
        PasswordSource::Given(password) => {
            CipherManager::open_sealed(config, header, ciphertext, password)
        }
        PasswordSource::Prompt(prompt) => {
            for attempt in 1..=MAX_PASSWORD_ATTEMPTS {
                let Some(password) = prompt.ask("Password", hint)? else {
                    return Err(KeyMinderError::cancelled());
                };
                if password.is_empty() {
                    return Err(KeyMinderError::cancelled());
                }
                match CipherManager::open_sealed(config, header, ciphertext, &password) {
                    Err(err) if err.storage_reason() == Some(StorageFailure::WrongPassword) => {
                        warn!(attempt, "wrong password");
                    }
                    other => return other,
                }
            }
            Err(KeyMinderError::wrong_password())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::KdfParams;
    use crate::prompt::ScriptedPrompt;

    struct NullHandler;

    impl StorageHandler for NullHandler {
        fn identifier(&self) -> &str {
            "null"
        }
        fn description(&self) -> &str {
            "discards everything"
        }
        fn extensions(&self) -> &[&str] {
            &["null", "keymind"]
        }
        fn supports_encryption(&self) -> bool {
            false
        }
        fn open(&self, _: &Path, config: &EngineConfig, _: PasswordSource<'_>) -> Result<Loaded> {
            Ok(Loaded {
                nodes: Vec::new(),
                file: FileConfiguration::new(config),
            })
        }
        fn save(&self, _: &Path, _: &Document, _: &FileConfiguration) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn resolve_by_extension_with_fallback() {
        let registry = FormatRegistry::with_builtin();
        assert_eq!(registry.resolve("vault.keymind"), "default");
        assert_eq!(registry.resolve("VAULT.KMF"), "default");
        assert_eq!(registry.resolve("export.json"), "plain");
        assert_eq!(registry.resolve("notes.txt"), "default");
        assert_eq!(registry.resolve("no_extension"), "default");
        assert_eq!(registry.identifier_by_extension(".json", "x"), "plain");
        assert_eq!(registry.identifier_by_extension("xml", "x"), "x");
    }

    #[test]
    fn duplicate_identifiers_are_rejected() {
        let mut registry = FormatRegistry::with_builtin();
        registry.register(Box::new(NullHandler)).unwrap();
        assert!(registry.register(Box::new(NullHandler)).is_err());
        // first registration wins for shared extensions
        assert_eq!(registry.resolve("a.keymind"), "default");
        assert_eq!(registry.resolve("a.null"), "null");
    }

    #[test]
    fn unknown_identifiers_fail() {
        let registry = FormatRegistry::with_builtin();
        assert!(matches!(
            registry.get("xml/keymindfile"),
            Err(KeyMinderError::UnknownFormat(_))
        ));
        let mut registry = registry;
        assert!(registry.set_default_id("nope").is_err());
        registry.set_default_id("plain").unwrap();
        assert_eq!(registry.resolve("x.txt"), "plain");
    }

    #[test]
    fn encrypted_save_through_plain_handler_is_incompatible() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            kdf: KdfParams::insecure_fast(),
            ..Default::default()
        };
        let registry = FormatRegistry::with_builtin();
        let mut file = FileConfiguration::new(&config);
        file.set_path(dir.path().join("out.json"));
        file.change_format(&registry, "plain").unwrap();
        file.cipher_mut().set_password("pw").unwrap();

        let err = registry.save(&Document::default(), &file).unwrap_err();
        assert!(matches!(err, KeyMinderError::IncompatibleFormat(_)));
        assert!(!dir.path().join("out.json").exists());
    }

    #[test]
    fn version_check_accepts_major_one() {
        assert!(check_version("1.0").is_ok());
        assert!(check_version("1.1.0").is_ok());
        assert!(check_version("1").is_ok());
        let err = check_version("2.0").unwrap_err();
        assert_eq!(err.storage_reason(), Some(StorageFailure::Corrupt));
    }

    #[test]
    fn atomic_write_replaces_file_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.keymind");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn prompt_retries_three_times() {
        let config = EngineConfig {
            kdf: KdfParams::insecure_fast(),
            ..Default::default()
        };
        let mut cipher = CipherManager::new(&config);
        cipher.set_password("right").unwrap();
        let sealed = cipher.encrypt(b"body").unwrap();

        let mut prompt = ScriptedPrompt::new([Some("a"), Some("b"), Some("right")]);
        let (_, plain) = unlock_payload(
            &config,
            &sealed.header,
            &sealed.ciphertext,
            PasswordSource::Prompt(&mut prompt),
            Some("hint"),
        )
        .unwrap();
        assert_eq!(plain, b"body");

        let mut prompt = ScriptedPrompt::new([Some("a"), Some("b"), Some("c"), Some("right")]);
        let err = unlock_payload(
            &config,
            &sealed.header,
            &sealed.ciphertext,
            PasswordSource::Prompt(&mut prompt),
            None,
        )
        .unwrap_err();
        assert_eq!(err.storage_reason(), Some(StorageFailure::WrongPassword));
        assert_eq!(prompt.remaining(), 1);

        let mut prompt = ScriptedPrompt::new([Some("a"), Some("")]);
        let err = unlock_payload(
            &config,
            &sealed.header,
            &sealed.ciphertext,
            PasswordSource::Prompt(&mut prompt),
            None,
        )
        .unwrap_err();
        assert!(err.is_user_cancelled());
    }
}
