//! # Event Bus
//!
//! Synchronous publish/subscribe between the document engine and whoever is
//! watching it (editor views, shells, tools). Events form a closed set, split
//! into four shapes that differ in what a handler receives:
//!
//! | Shape        | Variants                                                   | Handler          |
//! |--------------|------------------------------------------------------------|------------------|
//! | [`Signal`]   | file opened/closed, settings changed, quicklinks, exit     | `FnMut()`        |
//! | [`Vetoable`] | allow-file-closing, discard-changes                        | `FnMut(bool) -> bool` |
//! | [`NodeEvent`]| added, edited, moved, removed, selection changed, reset    | `FnMut(&Node)`   |
//! | [`SettingsEvent`] | settings dialog opened (global / per file)            | `FnMut(&mut Settings, &mut UiExtensions)` |
//!
//! Handlers run depth-first in registration order on the calling thread.
//!
//! ## Vetoes
//!
//! Every vetoable event has a *cancel trigger* (default `false`). Handlers run
//! in order until one returns the trigger value; the remaining handlers are
//! skipped and the emitter sees [`VetoOutcome::Vetoed`]. With no subscribers
//! the outcome is [`VetoOutcome::Proceed`].
//!
//! ## Thread Affinity
//!
//! Once a UI thread is registered via [`EventBus::set_ui_thread`], every
//! dispatch must come from that thread. Anything else fails with
//! [`KeyMinderError::WrongThread`] before a single handler runs. Headless
//! callers never register a thread and may dispatch from anywhere.
//!
//! ## Gate
//!
//! [`EventBus::set_enabled`] switches dispatch off entirely, which bulk
//! operations (loading a file, replaying undo) use to avoid notification
//! storms. A disabled bus does not check thread affinity because it does not
//! dispatch.

use crate::error::{KeyMinderError, Result};
use crate::model::Node;
use crate::settings::Settings;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::thread::ThreadId;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    FileOpened,
    FileClosed,
    SettingsChanged,
    FileSettingsChanged,
    QuicklinksUpdated,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vetoable {
    /// Payload: the document has unsaved changes.
    AllowFileClosing,
    /// Payload: the document has unsaved changes.
    DiscardChanges,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeEvent {
    Added,
    Edited,
    VerticallyMoved,
    Removed,
    SelectionChanged,
    /// The tree was replaced wholesale (load, undo). Carries the root.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsEvent {
    SettingsDialogOpened,
    FileSettingsDialogOpened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VetoOutcome {
    Proceed,
    Vetoed,
}

impl VetoOutcome {
    pub fn is_vetoed(self) -> bool {
        self == VetoOutcome::Vetoed
    }
}

/// Handle returned by every `subscribe_*` call, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Slot where settings subscribers drop the configuration surfaces they
/// contribute. The engine never looks inside; the presentation layer does.
#[derive(Default)]
pub struct UiExtensions {
    items: Vec<(String, Box<dyn Any + Send>)>,
}

impl UiExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, title: impl Into<String>, item: Box<dyn Any + Send>) {
        self.items.push((title.into(), item));
    }

    pub fn titles(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|(t, _)| t.as_str())
    }

    pub fn get<T: Any>(&self, title: &str) -> Option<&T> {
        self.items
            .iter()
            .find(|(t, _)| t == title)
            .and_then(|(_, item)| item.downcast_ref::<T>())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl fmt::Debug for UiExtensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.titles()).finish()
    }
}

type SignalHandler = Box<dyn FnMut() + Send>;
type VetoHandler = Box<dyn FnMut(bool) -> bool + Send>;
type NodeHandler = Box<dyn FnMut(&Node) + Send>;
type SettingsHandler = Box<dyn FnMut(&mut Settings, &mut UiExtensions) + Send>;

type Subscribers<H> = Vec<(SubscriptionId, H)>;

pub struct EventBus {
    signals: HashMap<Signal, Subscribers<SignalHandler>>,
    vetoables: HashMap<Vetoable, Subscribers<VetoHandler>>,
    nodes: HashMap<NodeEvent, Subscribers<NodeHandler>>,
    settings: HashMap<SettingsEvent, Subscribers<SettingsHandler>>,
    cancel_triggers: HashMap<Vetoable, bool>,
    ui_thread: Option<ThreadId>,
    enabled: bool,
    next_subscription: u64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            signals: HashMap::new(),
            vetoables: HashMap::new(),
            nodes: HashMap::new(),
            settings: HashMap::new(),
            cancel_triggers: HashMap::new(),
            ui_thread: None,
            enabled: true,
            next_subscription: 1,
        }
    }

    fn next_id(&mut self) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        id
    }

    pub fn set_ui_thread(&mut self, thread: Option<ThreadId>) {
        self.ui_thread = thread;
    }

    pub fn ui_thread(&self) -> Option<ThreadId> {
        self.ui_thread
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Switches dispatch on or off and returns the previous state.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.enabled, enabled)
    }

    /// Sets the handler return value that vetoes `event`.
    pub fn set_cancel_trigger(&mut self, event: Vetoable, trigger: bool) {
        self.cancel_triggers.insert(event, trigger);
    }

    pub fn cancel_trigger(&self, event: Vetoable) -> bool {
        self.cancel_triggers.get(&event).copied().unwrap_or(false)
    }

    /// Fails with `WrongThread` if a UI thread is registered and the caller
    /// runs elsewhere.
    pub fn ensure_thread(&self) -> Result<()> {
        match self.ui_thread {
            Some(ui) if ui != std::thread::current().id() => Err(KeyMinderError::WrongThread),
            _ => Ok(()),
        }
    }

    pub fn subscribe_signal<F>(&mut self, event: Signal, handler: F) -> SubscriptionId
    where
        F: FnMut() + Send + 'static,
    {
        let id = self.next_id();
        self.signals.entry(event).or_default().push((id, Box::new(handler)));
        id
    }

    pub fn subscribe_vetoable<F>(&mut self, event: Vetoable, handler: F) -> SubscriptionId
    where
        F: FnMut(bool) -> bool + Send + 'static,
    {
        let id = self.next_id();
        self.vetoables.entry(event).or_default().push((id, Box::new(handler)));
        id
    }

    pub fn subscribe_node<F>(&mut self, event: NodeEvent, handler: F) -> SubscriptionId
    where
        F: FnMut(&Node) + Send + 'static,
    {
        let id = self.next_id();
        self.nodes.entry(event).or_default().push((id, Box::new(handler)));
        id
    }

    pub fn subscribe_settings<F>(&mut self, event: SettingsEvent, handler: F) -> SubscriptionId
    where
        F: FnMut(&mut Settings, &mut UiExtensions) + Send + 'static,
    {
        let id = self.next_id();
        self.settings.entry(event).or_default().push((id, Box::new(handler)));
        id
    }

    /// Removes a subscription of any shape. Returns false if it was unknown.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        fn drop_from<K, H>(map: &mut HashMap<K, Subscribers<H>>, id: SubscriptionId) -> bool {
            let mut found = false;
            for subs in map.values_mut() {
                let before = subs.len();
                subs.retain(|(sid, _)| *sid != id);
                found |= subs.len() != before;
            }
            found
        }

        drop_from(&mut self.signals, id)
            || drop_from(&mut self.vetoables, id)
            || drop_from(&mut self.nodes, id)
            || drop_from(&mut self.settings, id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.signals.values().map(Vec::len).sum::<usize>()
            + self.vetoables.values().map(Vec::len).sum::<usize>()
            + self.nodes.values().map(Vec::len).sum::<usize>()
            + self.settings.values().map(Vec::len).sum::<usize>()
    }

    pub fn fire_signal(&mut self, event: Signal) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.ensure_thread()?;
        trace!(?event, "signal");
        if let Some(subs) = self.signals.get_mut(&event) {
            for (_, handler) in subs.iter_mut() {
                handler();
            }
        }
        Ok(())
    }

    /// Runs the handlers of `event` until one returns the cancel trigger.
    ///
    /// A disabled bus reports `Proceed` without asking anyone.
    pub fn fire_vetoable(&mut self, event: Vetoable, payload: bool) -> Result<VetoOutcome> {
        if !self.enabled {
            return Ok(VetoOutcome::Proceed);
        }
        self.ensure_thread()?;
        let trigger = self.cancel_trigger(event);
        if let Some(subs) = self.vetoables.get_mut(&event) {
            for (id, handler) in subs.iter_mut() {
                if handler(payload) == trigger {
                    trace!(?event, subscription = id.0, "vetoed");
                    return Ok(VetoOutcome::Vetoed);
                }
            }
        }
        Ok(VetoOutcome::Proceed)
    }

    pub fn fire_node(&mut self, event: NodeEvent, node: &Node) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.ensure_thread()?;
        trace!(?event, node = %node.id(), "node event");
        if let Some(subs) = self.nodes.get_mut(&event) {
            for (_, handler) in subs.iter_mut() {
                handler(node);
            }
        }
        Ok(())
    }

    /// Hands `settings` to every subscriber. Whatever the map holds afterwards
    /// is what the caller persists.
    pub fn fire_settings(
        &mut self,
        event: SettingsEvent,
        settings: &mut Settings,
        extensions: &mut UiExtensions,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        self.ensure_thread()?;
        if let Some(subs) = self.settings.get_mut(&event) {
            for (_, handler) in subs.iter_mut() {
                handler(settings, extensions);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("ui_thread", &self.ui_thread)
            .field("enabled", &self.enabled)
            .finish()
    }
}
