//! # Engine Facade
//!
//! [`KeyMinder`] is the single entry point collaborators (editor views, shells,
//! tools) talk to. It owns exactly one [`Document`], the [`FileConfiguration`]
//! of the open file and the [`FormatRegistry`].
//!
//! ## File Lifecycle
//!
//! ```text
//!   create / open ──► loaded ──► save / save_as ──► loaded
//!                        │
//!                        └──► close ──► empty
//! ```
//!
//! - `open` closes the current file first. A vetoed close aborts the open
//!   with a `UserCancelled` storage error; a failed read leaves nothing loaded.
//! - `close` asks [`Vetoable::AllowFileClosing`] (and, with unsaved changes,
//!   [`Vetoable::DiscardChanges`]). Any veto keeps the file open and makes
//!   `close` return `false`. Otherwise the tree and undo history are dropped
//!   and the key material is wiped.
//! - Subscriptions live on the document's bus and survive from one file to
//!   the next.
//!
//! ## Quicklinks
//!
//! Nodes carrying a `quicklink` attribute form a name → node index. It is
//! rebuilt on open and kept current by [`KeyMinder::add_quicklink`] and
//! [`KeyMinder::remove_quicklink`], which write the attribute with undo
//! recording suspended.

use crate::cipher::CipherStrength;
use crate::config::{EngineConfig, EngineContext};
use crate::error::{KeyMinderError, Result};
use crate::events::{SettingsEvent, Signal, UiExtensions, VetoOutcome, Vetoable};
use crate::file_config::FileConfiguration;
use crate::format::{FormatRegistry, PasswordSource};
use crate::model::{NodeId, ATTR_QUICKLINK, ATTR_TEXT};
use crate::prompt::PasswordPrompt;
use crate::settings::Settings;
use crate::store::Document;
use std::collections::BTreeMap;
use std::path::Path;
use std::thread::ThreadId;
use tracing::{debug, info, warn};

/// Global setting overriding the configured undo limit.
pub const SETTING_UNDO_LIMIT: &str = "tree.undo.limit";

pub struct KeyMinder {
    ctx: EngineContext,
    registry: FormatRegistry,
    document: Document,
    file: Option<FileConfiguration>,
    quicklinks: BTreeMap<String, NodeId>,
}

impl std::fmt::Debug for KeyMinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMinder")
            .field("file", &self.file)
            .field("nodes", &self.document.len())
            .field("registry", &self.registry)
            .finish()
    }
}

impl KeyMinder {
    pub fn new(ctx: EngineContext) -> Self {
        Self::with_registry(ctx, FormatRegistry::with_builtin())
    }

    pub fn with_registry(ctx: EngineContext, mut registry: FormatRegistry) -> Self {
        if let Err(err) = registry.set_default_id(&ctx.config.default_format) {
            warn!(%err, "configured default format is not registered");
        }
        let document = Document::new(&ctx);
        Self {
            ctx,
            registry,
            document,
            file: None,
            quicklinks: BTreeMap::new(),
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn registry(&self) -> &FormatRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut FormatRegistry {
        &mut self.registry
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.document
    }

    pub fn file(&self) -> Option<&FileConfiguration> {
        self.file.as_ref()
    }

    pub fn file_mut(&mut self) -> Option<&mut FileConfiguration> {
        self.file.as_mut()
    }

    pub fn is_loaded(&self) -> bool {
        self.file.is_some()
    }

    fn loaded_file(&self) -> Result<&FileConfiguration> {
        self.file
            .as_ref()
            .ok_or_else(|| KeyMinderError::InvalidOperation("no file is open".to_string()))
    }

    fn loaded_file_mut(&mut self) -> Result<&mut FileConfiguration> {
        self.file
            .as_mut()
            .ok_or_else(|| KeyMinderError::InvalidOperation("no file is open".to_string()))
    }

    // --- UI presence ---

    /// Declares the calling thread as the UI thread. From now on every event
    /// dispatch must happen on it.
    pub fn register_ui(&mut self) -> ThreadId {
        let id = self.ctx.register_ui();
        self.document.set_ui_thread(Some(id));
        id
    }

    pub fn unregister_ui(&mut self) {
        self.ctx.unregister_ui();
        self.document.set_ui_thread(None);
    }

    // --- file lifecycle ---

    /// Starts a new, empty, unsaved document.
    pub fn create(&mut self) -> Result<bool> {
        if !self.close()? {
            return Ok(false);
        }
        self.file = Some(FileConfiguration::new(&self.ctx.config));
        self.prepare_opened()?;
        info!("new document created");
        Ok(true)
    }

    /// Opens `path`, using `password` if the file is encrypted. The format is
    /// taken from `format` or resolved from the file extension.
    pub fn open(
        &mut self,
        path: impl AsRef<Path>,
        password: Option<&str>,
        format: Option<&str>,
    ) -> Result<()> {
        let source = match password {
            Some(p) => PasswordSource::Given(p),
            None => PasswordSource::None,
        };
        self.open_from(path.as_ref(), source, format)
    }

    /// Like [`Self::open`], asking `prompt` for the password (three attempts).
    pub fn open_with_prompt(
        &mut self,
        path: impl AsRef<Path>,
        prompt: &mut dyn PasswordPrompt,
        format: Option<&str>,
    ) -> Result<()> {
        self.open_from(path.as_ref(), PasswordSource::Prompt(prompt), format)
    }

    fn open_from(
        &mut self,
        path: &Path,
        source: PasswordSource<'_>,
        format: Option<&str>,
    ) -> Result<()> {
        if !self.close()? {
            return Err(KeyMinderError::cancelled());
        }
        let loaded = self.registry.open(path, format, &self.ctx.config, source)?;
        self.document.import(&loaded.nodes);
        self.file = Some(loaded.file);
        self.prepare_opened()?;
        info!(path = %path.display(), nodes = self.document.len(), "file opened");
        Ok(())
    }

    fn prepare_opened(&mut self) -> Result<()> {
        if let Some(limit) = self.ctx.settings.get(SETTING_UNDO_LIMIT) {
            match limit.parse::<usize>() {
                Ok(limit) => self.document.set_undo_limit(limit),
                Err(_) => warn!(value = limit, "ignoring invalid {}", SETTING_UNDO_LIMIT),
            }
        }
        self.document.set_undo_enabled(true);
        self.document.mark_saved();
        self.document.set_events_enabled(true);
        self.document.reset_pointer()?;
        self.document.bus_mut().fire_signal(Signal::FileOpened)?;
        self.rebuild_quicklinks()
    }

    /// Writes the open file to its path.
    pub fn save(&mut self) -> Result<()> {
        let file = self.loaded_file()?;
        if file.path().is_none() {
            return Err(KeyMinderError::InvalidOperation(
                "the document has no path yet; use save_as".to_string(),
            ));
        }
        self.registry.save(&self.document, file)?;
        self.document.mark_saved();
        Ok(())
    }

    /// Writes to `path`, optionally switching format. On failure the file
    /// configuration keeps its previous path and format.
    pub fn save_as(&mut self, path: impl AsRef<Path>, format: Option<&str>) -> Result<()> {
        let path = path.as_ref();
        let format_id = match format {
            Some(id) => id.to_string(),
            None => self.registry.resolve(path),
        };
        let handler = self.registry.get(&format_id)?;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| KeyMinderError::InvalidOperation("no file is open".to_string()))?;
        if file.is_encrypted() && !handler.supports_encryption() {
            return Err(KeyMinderError::IncompatibleFormat(format_id));
        }

        let previous_path = file.path().map(Path::to_path_buf);
        let previous_format = file.format_id().to_string();
        file.set_path(path);
        file.change_format(&self.registry, &format_id)?;

        if let Err(err) = self.registry.save(&self.document, file) {
            if let Some(previous) = previous_path {
                file.set_path(previous);
            }
            file.change_format(&self.registry, &previous_format)?;
            return Err(err);
        }
        self.document.mark_saved();
        Ok(())
    }

    /// Closes the open file unless a subscriber vetoes. Returns whether the
    /// file is closed afterwards.
    pub fn close(&mut self) -> Result<bool> {
        if self.file.is_some() {
            let unsaved = self.document.is_changed();
            let bus = self.document.bus_mut();
            if bus.fire_vetoable(Vetoable::AllowFileClosing, unsaved)? == VetoOutcome::Vetoed {
                debug!("close vetoed");
                return Ok(false);
            }
            if unsaved
                && bus.fire_vetoable(Vetoable::DiscardChanges, unsaved)? == VetoOutcome::Vetoed
            {
                debug!("discarding changes vetoed");
                return Ok(false);
            }
        }

        self.document.reset();
        self.quicklinks.clear();
        if let Some(mut file) = self.file.take() {
            file.destroy();
            self.document.bus_mut().fire_signal(Signal::FileClosed)?;
            info!("file closed");
        }
        Ok(true)
    }

    /// Tells subscribers the application is shutting down.
    pub fn exit(&mut self) -> Result<()> {
        self.document.bus_mut().fire_signal(Signal::Exit)
    }

    // --- undo ---

    pub fn undo(&mut self) -> Result<bool> {
        let undone = self.document.undo()?;
        if undone {
            self.rebuild_quicklinks()?;
        }
        Ok(undone)
    }

    // --- settings ---

    pub fn settings(&self) -> &Settings {
        &self.ctx.settings
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.ctx.settings.get(key)
    }

    pub fn set_setting(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        self.ctx.settings.set(key, value)?;
        self.document.bus_mut().fire_signal(Signal::SettingsChanged)
    }

    pub fn file_setting(&self, key: &str) -> Option<&str> {
        self.file.as_ref().and_then(|f| f.settings().get(key))
    }

    /// Writes a setting scoped to the open file; the file becomes dirty.
    pub fn set_file_setting(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        self.loaded_file_mut()?.settings_mut().set(key, value)?;
        self.document.set_changed(true);
        self.document.bus_mut().fire_signal(Signal::FileSettingsChanged)
    }

    /// Resolves a template variable for tool collaborators. Sources are
    /// tried in order: `extra`, the node's own attributes, file settings,
    /// global settings, and finally the node's text when `name` is `text`.
    pub fn lookup(
        &self,
        name: &str,
        node: Option<NodeId>,
        extra: Option<&BTreeMap<String, String>>,
    ) -> Option<String> {
        let node = node.and_then(|id| self.document.node(id).ok());
        extra
            .and_then(|vars| vars.get(name).map(String::as_str))
            .or_else(|| node.and_then(|n| n.attributes().get(name).map(String::as_str)))
            .or_else(|| self.file_setting(name))
            .or_else(|| self.setting(name))
            .or_else(|| node.filter(|_| name == ATTR_TEXT).map(|n| n.text()))
            .map(str::to_string)
    }

    /// Lets subscribers edit the global settings and contribute UI pages.
    /// The settings as left by the subscribers are kept.
    pub fn open_settings_dialog(&mut self) -> Result<UiExtensions> {
        let mut extensions = UiExtensions::new();
        self.document.bus_mut().fire_settings(
            SettingsEvent::SettingsDialogOpened,
            &mut self.ctx.settings,
            &mut extensions,
        )?;
        self.document.bus_mut().fire_signal(Signal::SettingsChanged)?;
        Ok(extensions)
    }

    /// Per-file counterpart of [`Self::open_settings_dialog`].
    pub fn open_file_settings_dialog(&mut self) -> Result<UiExtensions> {
        let mut extensions = UiExtensions::new();
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| KeyMinderError::InvalidOperation("no file is open".to_string()))?;
        let before = file.settings().clone();
        self.document.bus_mut().fire_settings(
            SettingsEvent::FileSettingsDialogOpened,
            file.settings_mut(),
            &mut extensions,
        )?;
        if *file.settings() != before {
            self.document.set_changed(true);
        }
        self.document
            .bus_mut()
            .fire_signal(Signal::FileSettingsChanged)?;
        Ok(extensions)
    }

    // --- encryption ---

    pub fn set_password(&mut self, password: &str) -> Result<()> {
        self.loaded_file_mut()?.cipher_mut().set_password(password)?;
        self.document.set_changed(true);
        Ok(())
    }

    pub fn change_password(&mut self, current: &str, new: &str) -> Result<()> {
        self.loaded_file_mut()?
            .cipher_mut()
            .change_password(current, new)?;
        self.document.set_changed(true);
        Ok(())
    }

    /// Asks for the current and twice for the new password. `Ok(false)` when
    /// the confirmation did not match.
    pub fn change_password_interactive(&mut self, prompt: &mut dyn PasswordPrompt) -> Result<bool> {
        let file = self.loaded_file_mut()?;
        let hint = file.password_hint().map(str::to_string);
        let changed = file
            .cipher_mut()
            .change_password_interactive(prompt, hint.as_deref())?;
        if changed {
            self.document.set_changed(true);
        }
        Ok(changed)
    }

    pub fn check_password(&self, candidate: &str) -> bool {
        self.file
            .as_ref()
            .is_some_and(|f| f.cipher().check_password(candidate))
    }

    pub fn set_cipher(&mut self, name: &str) -> Result<()> {
        self.loaded_file_mut()?.cipher_mut().set_cipher(name)?;
        self.document.set_changed(true);
        Ok(())
    }

    pub fn disable_encryption(&mut self) -> Result<()> {
        self.loaded_file_mut()?.cipher_mut().disable();
        self.document.set_changed(true);
        Ok(())
    }

    /// Capability query for the crypto provider; `degraded` asks callers to
    /// warn the user.
    pub fn cipher_strength(&self) -> CipherStrength {
        match &self.file {
            Some(file) => file.cipher().strength(),
            None => crate::cipher::CipherManager::new(&self.ctx.config).strength(),
        }
    }

    // --- quicklinks ---

    /// Quicklink names mapped to nodes that still exist.
    pub fn quicklinks(&self) -> impl Iterator<Item = (&str, NodeId)> {
        self.quicklinks
            .iter()
            .filter(move |(_, id)| self.document.contains(**id))
            .map(|(name, id)| (name.as_str(), *id))
    }

    pub fn quicklink(&self, name: &str) -> Option<NodeId> {
        self.quicklinks
            .get(name)
            .copied()
            .filter(|id| self.document.contains(*id))
    }

    pub fn add_quicklink(&mut self, name: &str, node: NodeId) -> Result<()> {
        self.ensure_quicklinks()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(KeyMinderError::InvalidOperation(
                "quicklink name must not be empty".to_string(),
            ));
        }
        if self.quicklink(name).is_some_and(|existing| existing != node) {
            return Err(KeyMinderError::InvalidOperation(format!(
                "quicklink '{name}' is already in use"
            )));
        }
        if !self.document.contains(node) {
            return Err(KeyMinderError::NodeNotFound(node));
        }
        if let Some(old) = self
            .document
            .node(node)?
            .attribute(ATTR_QUICKLINK)
            .map(str::to_string)
        {
            self.quicklinks.remove(&old);
        }
        self.document
            .with_undo_suspended(|doc| doc.set_attribute(node, ATTR_QUICKLINK, name))?;
        self.quicklinks.insert(name.to_string(), node);
        self.document
            .bus_mut()
            .fire_signal(Signal::QuicklinksUpdated)
    }

    /// Returns false if no quicklink had that name.
    pub fn remove_quicklink(&mut self, name: &str) -> Result<bool> {
        self.ensure_quicklinks()?;
        let Some(node) = self.quicklinks.remove(name) else {
            return Ok(false);
        };
        if self.document.contains(node) {
            self.document
                .with_undo_suspended(|doc| doc.remove_attribute(node, ATTR_QUICKLINK))?;
        }
        self.document
            .bus_mut()
            .fire_signal(Signal::QuicklinksUpdated)?;
        Ok(true)
    }

    fn ensure_quicklinks(&self) -> Result<()> {
        if self.ctx.config.quicklinks_enabled {
            Ok(())
        } else {
            Err(KeyMinderError::InvalidOperation(
                "quicklinks are disabled".to_string(),
            ))
        }
    }

    /// Rebuilds the index from the `quicklink` attributes in the tree.
    pub fn rebuild_quicklinks(&mut self) -> Result<()> {
        self.quicklinks.clear();
        if !self.ctx.config.quicklinks_enabled {
            return Ok(());
        }
        for node in self.document.descendants(NodeId::ROOT) {
            if let Some(name) = node.attribute(ATTR_QUICKLINK).filter(|n| !n.is_empty()) {
                if self.quicklinks.insert(name.to_string(), node.id()).is_some() {
                    warn!(quicklink = name, "duplicate quicklink, last one wins");
                }
            }
        }
        debug!(count = self.quicklinks.len(), "quicklinks rebuilt");
        self.document
            .bus_mut()
            .fire_signal(Signal::QuicklinksUpdated)
    }
}
