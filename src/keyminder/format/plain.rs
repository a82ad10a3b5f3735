use super::{check_version, write_atomic, Body, Loaded, PasswordSource, StorageHandler, CONTAINER_VERSION};
use crate::cipher::CipherManager;
use crate::config::EngineConfig;
use crate::error::{KeyMinderError, Result};
use crate::file_config::FileConfiguration;
use crate::model::NodeRecord;
use crate::settings::Settings;
use crate::store::Document;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const PLAIN_FORMAT: &str = "plain";

#[derive(Debug, Serialize, Deserialize)]
struct PlainFile {
    version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    nodes: Vec<NodeRecord>,
}

/// Unencrypted JSON export. Saving an encrypted document through this
/// handler is refused by the registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainHandler;

impl StorageHandler for PlainHandler {
    fn identifier(&self) -> &str {
        PLAIN_FORMAT
    }

    fn description(&self) -> &str {
        "Plain JSON export (unencrypted)"
    }

    fn extensions(&self) -> &[&str] {
        &["json"]
    }

    fn supports_encryption(&self) -> bool {
        false
    }

    fn open(&self, path: &Path, config: &EngineConfig, _: PasswordSource<'_>) -> Result<Loaded> {
        let raw = fs::read(path)?;
        let plain: PlainFile = serde_json::from_slice(&raw)?;
        check_version(&plain.version)?;
        let body = Body {
            settings: plain.settings,
            nodes: plain.nodes,
        }
        .validated()?;

        Ok(Loaded {
            nodes: body.nodes,
            file: FileConfiguration::from_parts(
                path.to_path_buf(),
                self.identifier(),
                plain.version,
                CipherManager::new(config),
                plain.attributes,
                body.settings,
            ),
        })
    }

    fn save(&self, path: &Path, doc: &Document, file: &FileConfiguration) -> Result<()> {
        if file.is_encrypted() {
            return Err(KeyMinderError::IncompatibleFormat(self.identifier().to_string()));
        }
        let plain = PlainFile {
            version: CONTAINER_VERSION.to_string(),
            attributes: file.attributes().clone(),
            settings: file.settings().clone(),
            nodes: doc.export(),
        };
        write_atomic(path, &serde_json::to_vec_pretty(&plain)?)
    }
}
