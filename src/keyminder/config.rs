//! # Configuration
//!
//! Two kinds of configuration feed the engine:
//!
//! - [`EngineConfig`]: typed knobs, stored as `config.json` in the config
//!   directory. A missing file means defaults.
//! - [`Settings`]: the free-form, string-keyed application settings that
//!   collaborators read and write (`settings.json`).
//!
//! Both live in an [`EngineContext`], created once at engine start and passed
//! explicitly to the components that need it. There is no process-wide state.
//!
//! ## Available Settings
//!
//! | Key                  | Default     | Description                                   |
//! |----------------------|-------------|-----------------------------------------------|
//! | `undo_limit`         | `20`        | Undo transactions kept before the oldest goes |
//! | `default_format`     | `default`   | Format used when an extension is unknown      |
//! | `kdf`                | Argon2id    | Key derivation parameters for new passwords   |
//! | `max_key_bits`       | `256`       | Strongest key the crypto provider offers      |
//! | `node_timestamps`    | `true`      | Stamp `created`/`modified` on nodes           |
//! | `quicklinks_enabled` | `true`      | Maintain the quicklink (favorites) index      |

use crate::cipher::KdfParams;
use crate::error::Result;
use crate::settings::Settings;
use crate::undo::DEFAULT_UNDO_LIMIT;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::ThreadId;

const CONFIG_FILENAME: &str = "config.json";
const SETTINGS_FILENAME: &str = "settings.json";

pub const DEFAULT_FORMAT: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default = "default_undo_limit")]
    pub undo_limit: usize,

    #[serde(default = "default_format")]
    pub default_format: String,

    #[serde(default)]
    pub kdf: KdfParams,

    #[serde(default = "default_max_key_bits")]
    pub max_key_bits: u16,

    #[serde(default = "default_true")]
    pub node_timestamps: bool,

    #[serde(default = "default_true")]
    pub quicklinks_enabled: bool,
}

fn default_undo_limit() -> usize {
    DEFAULT_UNDO_LIMIT
}

fn default_format() -> String {
    DEFAULT_FORMAT.to_string()
}

fn default_max_key_bits() -> u16 {
    256
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            undo_limit: DEFAULT_UNDO_LIMIT,
            default_format: default_format(),
            kdf: KdfParams::default(),
            max_key_bits: default_max_key_bits(),
            node_timestamps: true,
            quicklinks_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Reads `config.json` from `config_dir`. A missing file yields the
    /// built-in defaults; a malformed one is an error.
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join(CONFIG_FILENAME);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Writes `config.json`, creating `config_dir` on first use.
    pub fn save<P: AsRef<Path>>(&self, config_dir: P) -> Result<()> {
        let config_dir = config_dir.as_ref();
        if !config_dir.exists() {
            fs::create_dir_all(config_dir)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        fs::write(config_dir.join(CONFIG_FILENAME), content)?;
        Ok(())
    }

    /// True when the crypto provider cannot offer 256-bit keys.
    pub fn is_degraded(&self) -> bool {
        self.max_key_bits < 256
    }
}

/// OS-appropriate configuration directory, if one can be determined.
pub fn default_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("de", "akubix", "keyminder").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Explicit engine-wide context: typed config, global settings and UI presence.
#[derive(Debug, Clone, Default)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub settings: Settings,
    ui_thread: Option<ThreadId>,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            settings: Settings::new(),
            ui_thread: None,
        }
    }

    /// Loads `config.json` and `settings.json` from `dir`.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut ctx = Self::new(EngineConfig::load(dir)?);
        ctx.settings = Self::load_settings(dir)?;
        Ok(ctx)
    }

    /// Global settings from `settings.json`; empty when the file is absent.
    pub fn load_settings<P: AsRef<Path>>(dir: P) -> Result<Settings> {
        let path = dir.as_ref().join(SETTINGS_FILENAME);
        if !path.exists() {
            return Ok(Settings::new());
        }
        let content = fs::read_to_string(path)?;
        let raw = serde_json::from_str(&content)?;
        Settings::from_map(raw)
    }

    pub fn save_settings<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let content = serde_json::to_string_pretty(&self.settings)?;
        fs::write(dir.join(SETTINGS_FILENAME), content)?;
        Ok(())
    }

    /// Registers the calling thread as the user interface thread.
    pub fn register_ui(&mut self) -> ThreadId {
        let id = std::thread::current().id();
        self.ui_thread = Some(id);
        id
    }

    pub fn unregister_ui(&mut self) {
        self.ui_thread = None;
    }

    pub fn ui_thread(&self) -> Option<ThreadId> {
        self.ui_thread
    }

    pub fn has_ui(&self) -> bool {
        self.ui_thread.is_some()
    }
}
