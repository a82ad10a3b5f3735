use super::{
    check_version, unlock_payload, write_atomic, Body, Loaded, PasswordSource, StorageHandler,
    CONTAINER_VERSION,
};
use crate::cipher::EncryptionHeader;
use crate::config::{EngineConfig, DEFAULT_FORMAT};
use crate::error::{KeyMinderError, Result};
use crate::file_config::{FileConfiguration, ATTR_PASSWORD_HINT};
use crate::store::Document;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;
use zeroize::Zeroizing;

const FORMAT_MARKER: &str = "keyminder";

#[derive(Debug, Serialize, Deserialize)]
struct Container {
    format: String,
    version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encryption: Option<EncryptionHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<Body>,
}

/// The native container: JSON, versioned, optionally encrypted.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyMindHandler;

impl StorageHandler for KeyMindHandler {
    fn identifier(&self) -> &str {
        DEFAULT_FORMAT
    }

    fn description(&self) -> &str {
        "KeyMinder file"
    }

    fn extensions(&self) -> &[&str] {
        &["keymind", "kmf"]
    }

    fn supports_encryption(&self) -> bool {
        true
    }

    fn open(
        &self,
        path: &Path,
        config: &EngineConfig,
        password: PasswordSource<'_>,
    ) -> Result<Loaded> {
        let raw = fs::read(path)?;
        let container: Container = serde_json::from_slice(&raw)?;
        if container.format != FORMAT_MARKER {
            return Err(KeyMinderError::corrupt(format!(
                "not a KeyMinder file (format '{}')",
                container.format
            )));
        }
        check_version(&container.version)?;

        let hint = container.attributes.get(ATTR_PASSWORD_HINT).cloned();
        let (cipher, body) = match (container.encryption, container.payload, container.body) {
            (Some(header), Some(payload), _) => {
                let ciphertext = BASE64
                    .decode(payload.as_bytes())
                    .map_err(|e| KeyMinderError::corrupt(format!("invalid payload: {e}")))?;
                let (cipher, plain) =
                    unlock_payload(config, &header, &ciphertext, password, hint.as_deref())?;
                let plain = Zeroizing::new(plain);
                let body: Body = serde_json::from_slice(&plain)?;
                (cipher, body)
            }
            (Some(_), None, _) => {
                return Err(KeyMinderError::corrupt("encrypted file without payload"));
            }
            (None, _, Some(body)) => (crate::cipher::CipherManager::new(config), body),
            (None, _, None) => return Err(KeyMinderError::corrupt("file has no body")),
        };
        let body = body.validated()?;
        debug!(nodes = body.nodes.len(), encrypted = cipher.is_encrypted(), "container read");

        Ok(Loaded {
            nodes: body.nodes,
            file: FileConfiguration::from_parts(
                path.to_path_buf(),
                self.identifier(),
                container.version,
                cipher,
                container.attributes,
                body.settings,
            ),
        })
    }

    fn save(&self, path: &Path, doc: &Document, file: &FileConfiguration) -> Result<()> {
        let body = Body {
            settings: file.settings().clone(),
            nodes: doc.export(),
        };
        let mut container = Container {
            format: FORMAT_MARKER.to_string(),
            version: CONTAINER_VERSION.to_string(),
            attributes: file.attributes().clone(),
            encryption: None,
            payload: None,
            body: None,
        };

        if file.is_encrypted() {
            let plain = Zeroizing::new(serde_json::to_vec(&body)?);
            let sealed = file.cipher().encrypt(&plain)?;
            container.encryption = Some(sealed.header);
            container.payload = Some(BASE64.encode(&sealed.ciphertext));
        } else {
            container.body = Some(body);
        }

        let content = serde_json::to_vec_pretty(&container)?;
        write_atomic(path, &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::KdfParams;
    use crate::error::StorageFailure;
    use crate::model::NodeId;

    fn config() -> EngineConfig {
        EngineConfig {
            kdf: KdfParams::insecure_fast(),
            node_timestamps: false,
            ..Default::default()
        }
    }

    fn sample_doc() -> Document {
        let mut doc = Document::default();
        doc.set_timestamps(false);
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let b = doc.add_new(a, "B").unwrap();
        doc.set_attribute(b, "user", "alice").unwrap();
        doc
    }

    #[test]
    fn unencrypted_body_is_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.keymind");
        let config = config();
        let mut file = FileConfiguration::new(&config);
        file.settings_mut().set("tree.undo.limit", "30").unwrap();

        KeyMindHandler.save(&path, &sample_doc(), &file).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["format"], "keyminder");
        assert_eq!(json["body"]["nodes"][0]["text"], "A");
        assert_eq!(json["body"]["settings"]["tree.undo.limit"], "30");
        assert!(json.get("encryption").is_none());

        let loaded = KeyMindHandler
            .open(&path, &config, PasswordSource::None)
            .unwrap();
        assert_eq!(loaded.nodes, sample_doc().export());
        assert_eq!(loaded.file.settings().get("tree.undo.limit"), Some("30"));
        assert!(!loaded.file.is_encrypted());
    }

    #[test]
    fn encrypted_container_hides_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.keymind");
        let config = config();
        let mut file = FileConfiguration::new(&config);
        file.set_attribute(ATTR_PASSWORD_HINT, "the usual").unwrap();
        file.cipher_mut().set_password("secret1").unwrap();

        KeyMindHandler.save(&path, &sample_doc(), &file).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains("alice"));
        assert!(text.contains("the usual"));

        let loaded = KeyMindHandler
            .open(&path, &config, PasswordSource::Given("secret1"))
            .unwrap();
        assert_eq!(loaded.nodes, sample_doc().export());
        assert!(loaded.file.cipher().check_password("secret1"));
        assert_eq!(loaded.file.password_hint(), Some("the usual"));

        let err = KeyMindHandler
            .open(&path, &config, PasswordSource::Given("wrong"))
            .unwrap_err();
        assert_eq!(err.storage_reason(), Some(StorageFailure::WrongPassword));
    }

    fn save_encrypted_and_edit(path: &Path, edit: impl FnOnce(&mut serde_json::Value)) {
        let mut file = FileConfiguration::new(&config());
        file.cipher_mut().set_password("pw").unwrap();
        KeyMindHandler.save(path, &sample_doc(), &file).unwrap();

        let mut json: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        edit(&mut json);
        fs::write(path, serde_json::to_vec(&json).unwrap()).unwrap();
    }

    #[test]
    fn unknown_cipher_in_header_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.keymind");
        save_encrypted_and_edit(&path, |json| {
            json["encryption"]["cipher"] = "Twofish/Argon2id".into();
        });

        let err = KeyMindHandler
            .open(&path, &config(), PasswordSource::Given("pw"))
            .unwrap_err();
        assert_eq!(err.storage_reason(), Some(StorageFailure::Corrupt));
        assert!(err.to_string().contains("Twofish/Argon2id"));
    }

    #[test]
    fn oversized_key_derivation_cost_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.keymind");
        save_encrypted_and_edit(&path, |json| {
            json["encryption"]["kdf"]["iterations"] = u32::MAX.into();
        });
        let err = KeyMindHandler
            .open(&path, &config(), PasswordSource::Given("pw"))
            .unwrap_err();
        assert_eq!(err.storage_reason(), Some(StorageFailure::Corrupt));

        save_encrypted_and_edit(&path, |json| {
            json["encryption"]["kdf"]["memory_kib"] = (KdfParams::MAX.memory_kib + 1).into();
        });
        let err = KeyMindHandler
            .open(&path, &config(), PasswordSource::Given("pw"))
            .unwrap_err();
        assert_eq!(err.storage_reason(), Some(StorageFailure::Corrupt));
    }

    #[test]
    fn garbage_and_future_versions_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();

        let garbage = dir.path().join("garbage.keymind");
        fs::write(&garbage, "not json").unwrap();
        let err = KeyMindHandler
            .open(&garbage, &config, PasswordSource::None)
            .unwrap_err();
        assert_eq!(err.storage_reason(), Some(StorageFailure::Corrupt));

        let future = dir.path().join("future.keymind");
        fs::write(
            &future,
            r#"{"format":"keyminder","version":"2.0","body":{"nodes":[]}}"#,
        )
        .unwrap();
        let err = KeyMindHandler
            .open(&future, &config, PasswordSource::None)
            .unwrap_err();
        assert_eq!(err.storage_reason(), Some(StorageFailure::Corrupt));

        let missing = dir.path().join("missing.keymind");
        let err = KeyMindHandler
            .open(&missing, &config, PasswordSource::None)
            .unwrap_err();
        assert_eq!(err.storage_reason(), Some(StorageFailure::Io));
    }

    #[test]
    fn invalid_settings_keys_on_disk_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.keymind");
        fs::write(
            &path,
            r#"{"format":"keyminder","version":"1.1","body":{"settings":{"bad key":"1"}}}"#,
        )
        .unwrap();
        let err = KeyMindHandler
            .open(&path, &config(), PasswordSource::None)
            .unwrap_err();
        assert_eq!(err.storage_reason(), Some(StorageFailure::Corrupt));
    }
}
