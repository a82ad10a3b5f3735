//! # Node Store
//!
//! [`Document`] owns one rooted tree of [`Node`]s plus the state that travels
//! with it: the selection cursor, the dirty flag, the [`UndoLog`] and the
//! [`EventBus`].
//!
//! ## Arena
//!
//! Nodes live in a `HashMap<NodeId, Node>`. Parent/child links are ids, so
//! the tree owns everything and a node never holds a reference to another.
//! A node is *attached* when it is reachable from the root. [`Document::create`]
//! and [`Document::clone_subtree`] produce detached nodes that become part of
//! the tree through [`Document::add_child`].
//!
//! ## Mutation Pipeline
//!
//! Every mutation of an attached node follows the same steps:
//!
//! 1. Check event thread affinity (fail before touching anything)
//! 2. Apply the change to the arena
//! 3. Record the inverse operation in the undo log
//! 4. Set the dirty flag
//! 5. Fire the matching [`NodeEvent`]
//!
//! Mutations of detached nodes skip steps 3 to 5: they are not part of the
//! document yet.
//!
//! ## Undo
//!
//! [`Document::undo`] replays the newest transaction backwards with recording
//! and events switched off, then fires a single [`NodeEvent::Reset`].
//! Composite operations ([`Document::move_to`], [`Document::sort_children`],
//! attribute writes that also refresh the `modified` stamp) run inside one
//! transaction and therefore undo in one step.
//!
//! ## Traversal
//!
//! [`Document::descendants`] is a lazy preorder iterator borrowing the
//! document. [`Walker`] is the detached variant: it only remembers ids, so
//! callers may write attributes between steps. Structural changes while
//! walking are not supported.

use crate::config::EngineContext;
use crate::error::{KeyMinderError, Result};
use crate::events::{EventBus, NodeEvent};
use crate::model::{
    join_linked_ids, parse_linked_ids, Direction, Node, NodeId, NodeRecord, ATTR_CREATED,
    ATTR_LINKED_NODES, ATTR_MODIFIED, ATTR_TEXT,
};
use crate::undo::{InverseOp, SubtreeSnapshot, UndoLog};
use std::collections::HashMap;
use std::thread::ThreadId;
use tracing::{debug, warn};

fn now_millis() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

fn invalid(message: impl Into<String>) -> KeyMinderError {
    KeyMinderError::InvalidOperation(message.into())
}

#[derive(Debug)]
pub struct Document {
    nodes: HashMap<NodeId, Node>,
    next_id: u64,
    selected: NodeId,
    changed: bool,
    timestamps: bool,
    undo: UndoLog,
    bus: EventBus,
}

impl Default for Document {
    fn default() -> Self {
        Self::new(&EngineContext::default())
    }
}

impl Document {
    pub fn new(ctx: &EngineContext) -> Self {
        let mut bus = EventBus::new();
        bus.set_ui_thread(ctx.ui_thread());
        let mut doc = Self {
            nodes: HashMap::new(),
            next_id: 1,
            selected: NodeId::ROOT,
            changed: false,
            timestamps: ctx.config.node_timestamps,
            undo: UndoLog::new(ctx.config.undo_limit),
            bus,
        };
        doc.install_root();
        doc
    }

    fn install_root(&mut self) {
        let mut root = Node::new(NodeId::ROOT, String::new());
        root.attached = true;
        self.nodes.insert(NodeId::ROOT, root);
    }

    /// Drops every node and the undo history. Subscriptions survive.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.install_root();
        self.selected = NodeId::ROOT;
        self.undo.clear();
        self.changed = false;
        debug!("document reset");
    }

    // --- queries ---

    pub fn root(&self) -> &Node {
        &self.nodes[&NodeId::ROOT]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(KeyMinderError::NodeNotFound(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or(KeyMinderError::NodeNotFound(id))
    }

    /// True when `id` is part of the tree (reachable from the root).
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(|n| n.attached)
    }

    /// Number of nodes in the tree, root included.
    pub fn len(&self) -> usize {
        self.nodes.values().filter(|n| n.attached).count()
    }

    /// True when the root has no children.
    pub fn is_empty(&self) -> bool {
        !self.root().has_children()
    }

    pub fn index_of(&self, id: NodeId) -> Result<usize> {
        let node = self.node(id)?;
        let parent = node
            .parent
            .ok_or_else(|| invalid(format!("node {id} has no parent")))?;
        self.node(parent)?
            .children
            .iter()
            .position(|c| *c == id)
            .ok_or_else(|| invalid(format!("node {id} is not listed by its parent")))
    }

    /// True when `ancestor` lies on the parent chain of `node`.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = self.nodes.get(&node).and_then(|n| n.parent);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.nodes.get(&id).and_then(|n| n.parent);
        }
        false
    }

    pub fn get_attribute(&self, id: NodeId, key: &str, default: &str) -> Result<String> {
        Ok(self
            .node(id)?
            .attribute(key)
            .unwrap_or(default)
            .to_string())
    }

    // --- selection ---

    pub fn selected(&self) -> NodeId {
        self.selected
    }

    pub fn selected_node(&self) -> &Node {
        self.nodes.get(&self.selected).unwrap_or_else(|| self.root())
    }

    pub fn select(&mut self, id: NodeId) -> Result<()> {
        if !self.contains(id) {
            return Err(KeyMinderError::NodeNotFound(id));
        }
        if self.selected == id {
            return Ok(());
        }
        self.check_affinity()?;
        self.selected = id;
        self.emit(NodeEvent::SelectionChanged, id)
    }

    /// Points the selection back at the root.
    pub fn reset_pointer(&mut self) -> Result<()> {
        self.select(NodeId::ROOT)
    }

    // --- flags ---

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn set_changed(&mut self, changed: bool) {
        self.changed = changed;
    }

    pub fn mark_saved(&mut self) {
        self.changed = false;
    }

    pub fn timestamps_enabled(&self) -> bool {
        self.timestamps
    }

    pub fn set_timestamps(&mut self, enabled: bool) {
        self.timestamps = enabled;
    }

    pub fn events_enabled(&self) -> bool {
        self.bus.is_enabled()
    }

    /// Returns the previous state.
    pub fn set_events_enabled(&mut self, enabled: bool) -> bool {
        self.bus.set_enabled(enabled)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    pub fn set_ui_thread(&mut self, thread: Option<ThreadId>) {
        self.bus.set_ui_thread(thread);
    }

    fn check_affinity(&self) -> Result<()> {
        if self.bus.is_enabled() {
            self.bus.ensure_thread()
        } else {
            Ok(())
        }
    }

    fn emit(&mut self, event: NodeEvent, id: NodeId) -> Result<()> {
        match self.nodes.get(&id) {
            Some(node) => self.bus.fire_node(event, node),
            None => Ok(()),
        }
    }

    // --- undo ---

    pub fn undo_log(&self) -> &UndoLog {
        &self.undo
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn undo_enabled(&self) -> bool {
        self.undo.is_enabled()
    }

    /// Returns the previous state.
    pub fn set_undo_enabled(&mut self, enabled: bool) -> bool {
        self.undo.set_enabled(enabled)
    }

    pub fn set_undo_limit(&mut self, limit: usize) {
        self.undo.set_limit(limit);
    }

    pub fn begin_transaction(&mut self) {
        self.undo.begin(self.selected);
    }

    pub fn end_transaction(&mut self) -> Result<()> {
        self.undo.end()
    }

    /// Runs `f` as one undo transaction. If the outermost transaction fails,
    /// whatever it already changed is rolled back and the dirty flag is put
    /// back as it was.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let outermost = !self.undo.in_transaction();
        let changed_before = self.changed;
        self.begin_transaction();
        let tx_id = self.undo.open_id();
        let result = f(self);
        self.undo.end()?;
        if result.is_err() && outermost && tx_id.is_some() && self.undo.last_id() == tx_id {
            debug!("rolling back failed transaction");
            self.undo()?;
            self.changed = changed_before;
        }
        result
    }

    /// Runs `f` with undo recording switched off. The previous recording state
    /// is restored even when `f` fails.
    pub fn with_undo_suspended<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let previous = self.undo.set_enabled(false);
        let result = f(self);
        self.undo.set_enabled(previous);
        result
    }

    /// Runs `f` with event dispatch switched off, restoring the gate afterwards.
    pub fn with_events_suspended<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let previous = self.bus.set_enabled(false);
        let result = f(self);
        self.bus.set_enabled(previous);
        result
    }

    /// Reverts the most recent transaction. Returns false if there is none.
    pub fn undo(&mut self) -> Result<bool> {
        if self.undo.in_transaction() {
            return Err(invalid("cannot undo inside an open transaction"));
        }
        self.check_affinity()?;
        let Some(tx) = self.undo.pop() else {
            return Ok(false);
        };
        debug!(transaction = tx.id, ops = tx.ops.len(), "undo");

        let recording = self.undo.set_enabled(false);
        let events = self.bus.set_enabled(false);
        let result = tx
            .ops
            .iter()
            .rev()
            .try_for_each(|op| self.apply_inverse(op));
        self.undo.set_enabled(recording);
        self.bus.set_enabled(events);
        result?;

        self.selected = if self.contains(tx.selected_before) {
            tx.selected_before
        } else {
            NodeId::ROOT
        };
        self.changed = true;
        self.emit(NodeEvent::Reset, NodeId::ROOT)?;
        Ok(true)
    }

    fn apply_inverse(&mut self, op: &InverseOp) -> Result<()> {
        match op {
            InverseOp::RemoveNode { node } => {
                self.detach_and_drop(*node)?;
            }
            InverseOp::RestoreSubtree {
                parent,
                index,
                subtree,
            } => {
                let attached = self.node(*parent)?.attached;
                self.restore_snapshot(subtree, *parent, attached);
                let siblings = &mut self.node_mut(*parent)?.children;
                let at = (*index).min(siblings.len());
                siblings.insert(at, subtree.id);
            }
            InverseOp::SetAttribute {
                node,
                key,
                previous,
            } => {
                let attributes = &mut self.node_mut(*node)?.attributes;
                match previous {
                    Some(value) => {
                        attributes.insert(key.clone(), value.clone());
                    }
                    None => {
                        attributes.remove(key);
                    }
                }
            }
            InverseOp::SetText { node, previous } => {
                self.node_mut(*node)?.text = previous.clone();
            }
            InverseOp::Move { node, direction } => {
                self.swap_with_sibling(*node, *direction)?;
            }
            InverseOp::Reorder { parent, order } => {
                self.node_mut(*parent)?.children = order.clone();
            }
        }
        Ok(())
    }

    // --- structure ---

    /// Allocates a detached node. It stays in the arena until it is attached
    /// with [`Document::add_child`], dropped with [`Document::discard`], or
    /// the document is reset.
    pub fn create(&mut self, text: impl Into<String>) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, Node::new(id, text.into()));
        id
    }

    /// Creates a node and appends it under `parent` in one step.
    pub fn add_new(&mut self, parent: NodeId, text: impl Into<String>) -> Result<NodeId> {
        if !self.nodes.contains_key(&parent) {
            return Err(invalid(format!("parent {parent} does not belong to this document")));
        }
        let id = self.create(text);
        if let Err(err) = self.add_child(id, parent, None) {
            self.nodes.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Inserts the detached `node` as a child of `parent`, appending when
    /// `at` is `None`.
    pub fn add_child(&mut self, node: NodeId, parent: NodeId, at: Option<usize>) -> Result<()> {
        if node.is_root() {
            return Err(invalid("the root cannot become a child"));
        }
        let parent_attached = match self.nodes.get(&parent) {
            Some(p) => p.attached,
            None => {
                return Err(invalid(format!(
                    "parent {parent} does not belong to this document"
                )))
            }
        };
        if self.node(node)?.parent.is_some() {
            return Err(invalid(format!("node {node} already has a parent")));
        }
        if node == parent || self.is_ancestor(node, parent) {
            return Err(invalid(format!(
                "adding {node} under {parent} would create a cycle"
            )));
        }
        let len = self.node(parent)?.children.len();
        let index = at.unwrap_or(len);
        if index > len {
            return Err(invalid(format!(
                "index {index} out of range (parent has {len} children)"
            )));
        }
        if parent_attached {
            self.check_affinity()?;
        }

        self.node_mut(parent)?.children.insert(index, node);
        self.node_mut(node)?.parent = Some(parent);

        if parent_attached {
            self.set_attached(node, true);
            if self.timestamps {
                self.stamp_created(node);
            }
            self.undo.record(InverseOp::RemoveNode { node }, self.selected);
            self.changed = true;
            debug!(%node, %parent, index, "node added");
            self.emit(NodeEvent::Added, node)?;
        }
        Ok(())
    }

    /// Removes `node` and its subtree. The selection moves to the former
    /// parent first if it pointed into the removed subtree.
    pub fn remove(&mut self, node: NodeId) -> Result<()> {
        if node.is_root() {
            return Err(invalid("the root cannot be removed"));
        }
        if !self.contains(node) {
            return Err(KeyMinderError::NodeNotFound(node));
        }
        self.check_affinity()?;

        let index = self.index_of(node)?;
        let parent = self
            .node(node)?
            .parent
            .ok_or_else(|| invalid(format!("node {node} has no parent")))?;
        let reselect = self.selected == node || self.is_ancestor(node, self.selected);
        let subtree = self.snapshot(node)?;

        let removed = self.detach_and_drop(node)?;
        self.undo.record(
            InverseOp::RestoreSubtree {
                parent,
                index,
                subtree,
            },
            self.selected,
        );
        self.changed = true;
        debug!(%node, "node removed");

        if reselect {
            self.selected = parent;
            self.emit(NodeEvent::SelectionChanged, parent)?;
        }
        self.bus.fire_node(NodeEvent::Removed, &removed)
    }

    /// Releases a detached node (and its subtree) that was never added.
    pub fn discard(&mut self, node: NodeId) -> Result<()> {
        let n = self.node(node)?;
        if n.attached || n.parent.is_some() || node.is_root() {
            return Err(invalid(format!("node {node} is part of a tree")));
        }
        self.detach_and_drop(node)?;
        Ok(())
    }

    /// Swaps `node` with its neighbour. Returns false at the boundary.
    pub fn move_node(&mut self, node: NodeId, direction: Direction) -> Result<bool> {
        let attached = self.node(node)?.attached;
        if attached {
            self.check_affinity()?;
        }
        if !self.swap_with_sibling(node, direction)? {
            return Ok(false);
        }
        if attached {
            self.undo.record(
                InverseOp::Move {
                    node,
                    direction: direction.opposite(),
                },
                self.selected,
            );
            self.changed = true;
            self.emit(NodeEvent::VerticallyMoved, node)?;
        }
        Ok(true)
    }

    fn swap_with_sibling(&mut self, node: NodeId, direction: Direction) -> Result<bool> {
        let index = self.index_of(node)?;
        let parent = self
            .node(node)?
            .parent
            .ok_or_else(|| invalid(format!("node {node} has no parent")))?;
        let siblings = &mut self.node_mut(parent)?.children;
        let target = match direction {
            Direction::Up if index > 0 => index - 1,
            Direction::Down if index + 1 < siblings.len() => index + 1,
            _ => return Ok(false),
        };
        siblings.swap(index, target);
        Ok(true)
    }

    /// Copies `node` (optionally with its subtree) into fresh, detached nodes.
    pub fn clone_subtree(&mut self, node: NodeId, include_children: bool) -> Result<NodeId> {
        let (text, attributes, children) = {
            let src = self.node(node)?;
            (src.text.clone(), src.attributes.clone(), src.children.clone())
        };
        let copy = self.create(text);
        self.node_mut(copy)?.attributes = attributes;
        if include_children {
            for child in children {
                let child_copy = self.clone_subtree(child, true)?;
                self.node_mut(child_copy)?.parent = Some(copy);
                self.node_mut(copy)?.children.push(child_copy);
            }
        }
        Ok(copy)
    }

    /// Moves `node` under `new_parent` as a clone-then-remove, undone in one
    /// step. Returns the id of the node at its new place.
    ///
    /// `at` addresses the destination children before the source is removed.
    pub fn move_to(
        &mut self,
        node: NodeId,
        new_parent: NodeId,
        at: Option<usize>,
    ) -> Result<NodeId> {
        if node.is_root() {
            return Err(invalid("the root cannot be moved"));
        }
        if !self.contains(node) {
            return Err(KeyMinderError::NodeNotFound(node));
        }
        if !self.contains(new_parent) {
            return Err(invalid(format!(
                "parent {new_parent} does not belong to this document"
            )));
        }
        if node == new_parent || self.is_ancestor(node, new_parent) {
            return Err(invalid(format!(
                "moving {node} under {new_parent} would create a cycle"
            )));
        }

        let was_selected = self.selected == node;
        self.transaction(|doc| {
            let copy = doc.clone_subtree(node, true)?;
            if let Err(err) = doc.add_child(copy, new_parent, at) {
                doc.detach_and_drop(copy)?;
                return Err(err);
            }
            doc.remove(node)?;
            if was_selected {
                doc.select(copy)?;
            }
            Ok(copy)
        })
    }

    /// Stable sort of the children of `node` by text.
    pub fn sort_children(&mut self, node: NodeId, recursive: bool) -> Result<()> {
        let mut targets = vec![node];
        if recursive {
            targets.extend(self.descendants(node).map(Node::id));
        }
        let attached = self.node(node)?.attached;

        self.transaction(|doc| {
            for target in targets {
                let order = doc.node(target)?.children.clone();
                let mut sorted = order.clone();
                let nodes = &doc.nodes;
                sorted.sort_by(|a, b| {
                    let ta = nodes.get(a).map(|n| n.text.as_str()).unwrap_or_default();
                    let tb = nodes.get(b).map(|n| n.text.as_str()).unwrap_or_default();
                    ta.cmp(tb)
                });
                if sorted == order {
                    continue;
                }
                doc.node_mut(target)?.children = sorted;
                if attached {
                    doc.undo.record(
                        InverseOp::Reorder {
                            parent: target,
                            order,
                        },
                        doc.selected,
                    );
                    doc.changed = true;
                    doc.emit(NodeEvent::VerticallyMoved, target)?;
                }
            }
            Ok(())
        })
    }

    // --- attributes ---

    pub fn set_text(&mut self, node: NodeId, text: impl Into<String>) -> Result<()> {
        let attached = self.node(node)?.attached;
        if attached {
            self.check_affinity()?;
        }
        let previous = std::mem::replace(&mut self.node_mut(node)?.text, text.into());
        if attached {
            self.begin_transaction();
            self.undo.record(InverseOp::SetText { node, previous }, self.selected);
            self.touch_modified(node);
            self.undo.end()?;
            self.changed = true;
            self.emit(NodeEvent::Edited, node)?;
        }
        Ok(())
    }

    /// Stores `value` under `key`. The key `text` is routed to [`Self::set_text`].
    pub fn set_attribute(
        &mut self,
        node: NodeId,
        key: &str,
        value: impl Into<String>,
    ) -> Result<()> {
        if key == ATTR_TEXT {
            return self.set_text(node, value);
        }
        let attached = self.node(node)?.attached;
        if attached {
            self.check_affinity()?;
        }
        let previous = self
            .node_mut(node)?
            .attributes
            .insert(key.to_string(), value.into());
        if attached {
            self.begin_transaction();
            self.undo.record(
                InverseOp::SetAttribute {
                    node,
                    key: key.to_string(),
                    previous,
                },
                self.selected,
            );
            if key != ATTR_MODIFIED {
                self.touch_modified(node);
            }
            self.undo.end()?;
            self.changed = true;
            self.emit(NodeEvent::Edited, node)?;
        }
        Ok(())
    }

    /// Deletes `key`, returning the previous value.
    pub fn remove_attribute(&mut self, node: NodeId, key: &str) -> Result<Option<String>> {
        if key == ATTR_TEXT {
            return Err(invalid("the text of a node cannot be removed"));
        }
        let attached = self.node(node)?.attached;
        if attached {
            self.check_affinity()?;
        }
        let previous = self.node_mut(node)?.attributes.remove(key);
        if attached && previous.is_some() {
            self.begin_transaction();
            self.undo.record(
                InverseOp::SetAttribute {
                    node,
                    key: key.to_string(),
                    previous: previous.clone(),
                },
                self.selected,
            );
            self.touch_modified(node);
            self.undo.end()?;
            self.changed = true;
            self.emit(NodeEvent::Edited, node)?;
        }
        Ok(previous)
    }

    fn touch_modified(&mut self, node: NodeId) {
        if !self.timestamps {
            return;
        }
        if let Some(n) = self.nodes.get_mut(&node) {
            let previous = n.attributes.insert(ATTR_MODIFIED.to_string(), now_millis());
            self.undo.record(
                InverseOp::SetAttribute {
                    node,
                    key: ATTR_MODIFIED.to_string(),
                    previous,
                },
                self.selected,
            );
        }
    }

    fn stamp_created(&mut self, node: NodeId) {
        let now = now_millis();
        for id in self.subtree_ids(node) {
            if let Some(n) = self.nodes.get_mut(&id) {
                if !n.attributes.contains_key(ATTR_CREATED) {
                    n.attributes.insert(ATTR_CREATED.to_string(), now.clone());
                    n.attributes.insert(ATTR_MODIFIED.to_string(), now.clone());
                }
            }
        }
    }

    // --- arena helpers ---

    fn subtree_ids(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if let Some(n) = self.nodes.get(&id) {
                out.push(id);
                stack.extend(n.children.iter().rev());
            }
        }
        out
    }

    fn set_attached(&mut self, node: NodeId, attached: bool) {
        for id in self.subtree_ids(node) {
            if let Some(n) = self.nodes.get_mut(&id) {
                n.attached = attached;
            }
        }
    }

    fn snapshot(&self, node: NodeId) -> Result<SubtreeSnapshot> {
        let n = self.node(node)?;
        Ok(SubtreeSnapshot {
            id: n.id,
            text: n.text.clone(),
            attributes: n.attributes.clone(),
            children: n
                .children
                .iter()
                .map(|c| self.snapshot(*c))
                .collect::<Result<_>>()?,
        })
    }

    fn restore_snapshot(&mut self, snapshot: &SubtreeSnapshot, parent: NodeId, attached: bool) {
        let mut node = Node::new(snapshot.id, snapshot.text.clone());
        node.attributes = snapshot.attributes.clone();
        node.parent = Some(parent);
        node.attached = attached;
        node.children = snapshot.children.iter().map(|c| c.id).collect();
        self.nodes.insert(snapshot.id, node);
        for child in &snapshot.children {
            self.restore_snapshot(child, snapshot.id, attached);
        }
    }

    /// Unlinks `node` from its parent and drops its subtree from the arena,
    /// returning the node itself.
    fn detach_and_drop(&mut self, node: NodeId) -> Result<Node> {
        if let Some(parent) = self.node(node)?.parent {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.children.retain(|c| *c != node);
            }
        }
        let ids = self.subtree_ids(node);
        let mut top = None;
        for id in ids {
            let dropped = self.nodes.remove(&id);
            if id == node {
                top = dropped;
            }
        }
        top.ok_or(KeyMinderError::NodeNotFound(node))
    }

    // --- traversal ---

    /// The node after `node` among its siblings. Past the last sibling the
    /// parent's next sibling is tried, climbing up; at the end of the top
    /// level the root is returned.
    pub fn next_node(&self, node: NodeId) -> Result<NodeId> {
        let mut current = node;
        while let Some(parent) = self.node(current)?.parent {
            let siblings = &self.node(parent)?.children;
            let index = self.index_of(current)?;
            if let Some(next) = siblings.get(index + 1) {
                return Ok(*next);
            }
            current = parent;
        }
        Ok(current)
    }

    /// The node before `node` among its siblings. The first child yields its
    /// parent, except on the top level where the node itself is returned.
    pub fn previous_node(&self, node: NodeId) -> Result<NodeId> {
        let Some(parent) = self.node(node)?.parent else {
            return Ok(node);
        };
        match self.index_of(node)? {
            0 if parent.is_root() => Ok(node),
            0 => Ok(parent),
            index => Ok(self.node(parent)?.children[index - 1]),
        }
    }

    /// Direct children of `node`, in order.
    pub fn children(&self, node: NodeId) -> impl Iterator<Item = &Node> + '_ {
        self.nodes
            .get(&node)
            .map(|n| n.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.nodes.get(id))
    }

    /// Every node below `node` in preorder. `node` itself is not included.
    pub fn descendants(&self, node: NodeId) -> Descendants<'_> {
        Descendants {
            doc: self,
            walker: Walker::new(node),
        }
    }

    pub fn for_each_child(&self, node: NodeId, mut f: impl FnMut(&Node)) -> Result<()> {
        self.node(node)?;
        self.children(node).for_each(|n| f(n));
        Ok(())
    }

    pub fn for_each_descendant(&self, node: NodeId, mut f: impl FnMut(&Node)) -> Result<()> {
        self.node(node)?;
        self.descendants(node).for_each(|n| f(n));
        Ok(())
    }

    pub fn walker(&self, node: NodeId) -> Walker {
        Walker::new(node)
    }

    // --- paths ---

    /// Slash-separated path of texts from the root, `/` for the root itself.
    pub fn node_path(&self, node: NodeId) -> Result<String> {
        let mut parts = Vec::new();
        let mut current = self.node(node)?;
        while let Some(parent) = current.parent {
            parts.push(current.text.as_str());
            current = self.node(parent)?;
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    /// Resolves an absolute path (`/A/B`) or one relative to the selection,
    /// honouring `.` and `..`. The first child with a matching text wins.
    pub fn node_by_path(&self, path: &str) -> Option<NodeId> {
        let mut current = if path.starts_with('/') {
            NodeId::ROOT
        } else {
            self.selected
        };
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = match segment {
                "." => current,
                ".." => self.nodes.get(&current)?.parent?,
                name => self.children(current).find(|n| n.text == name)?.id,
            };
        }
        Some(current)
    }

    // --- linked nodes ---

    /// Linked node ids of `node` that still exist in the tree.
    pub fn linked_nodes(&self, node: NodeId) -> Result<Vec<NodeId>> {
        let raw = self.node(node)?.attribute(ATTR_LINKED_NODES).unwrap_or("");
        Ok(parse_linked_ids(raw)
            .into_iter()
            .filter(|id| self.contains(*id))
            .collect())
    }

    /// Returns false if the link already existed.
    pub fn add_linked_node(&mut self, node: NodeId, target: NodeId) -> Result<bool> {
        if node == target {
            return Err(invalid("a node cannot link to itself"));
        }
        if !self.contains(target) {
            return Err(KeyMinderError::NodeNotFound(target));
        }
        let mut ids = parse_linked_ids(self.node(node)?.attribute(ATTR_LINKED_NODES).unwrap_or(""));
        if ids.contains(&target) {
            return Ok(false);
        }
        ids.push(target);
        self.set_attribute(node, ATTR_LINKED_NODES, join_linked_ids(&ids))?;
        Ok(true)
    }

    /// Returns false if there was no such link.
    pub fn remove_linked_node(&mut self, node: NodeId, target: NodeId) -> Result<bool> {
        let mut ids = parse_linked_ids(self.node(node)?.attribute(ATTR_LINKED_NODES).unwrap_or(""));
        let before = ids.len();
        ids.retain(|id| *id != target);
        if ids.len() == before {
            return Ok(false);
        }
        self.write_links(node, &ids)?;
        Ok(true)
    }

    /// Drops links to nodes that no longer exist. Returns how many went.
    pub fn prune_linked_nodes(&mut self, node: NodeId) -> Result<usize> {
        let raw = parse_linked_ids(self.node(node)?.attribute(ATTR_LINKED_NODES).unwrap_or(""));
        let alive: Vec<NodeId> = raw.iter().copied().filter(|id| self.contains(*id)).collect();
        let dropped = raw.len() - alive.len();
        if dropped > 0 {
            warn!(%node, dropped, "pruning dangling linked nodes");
            self.write_links(node, &alive)?;
        }
        Ok(dropped)
    }

    fn write_links(&mut self, node: NodeId, ids: &[NodeId]) -> Result<()> {
        if ids.is_empty() {
            self.remove_attribute(node, ATTR_LINKED_NODES)?;
        } else {
            self.set_attribute(node, ATTR_LINKED_NODES, join_linked_ids(ids))?;
        }
        Ok(())
    }

    // --- bulk import/export ---

    /// Appends `records` under the root without recording undo, firing events
    /// or touching timestamps. Used when loading a file.
    pub fn import(&mut self, records: &[NodeRecord]) {
        for record in records {
            self.insert_record(record, NodeId::ROOT);
        }
        self.changed = false;
    }

    fn insert_record(&mut self, record: &NodeRecord, parent: NodeId) {
        let id = self.create(record.text.clone());
        if let Some(node) = self.nodes.get_mut(&id) {
            node.attributes = record
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            node.parent = Some(parent);
            node.attached = true;
        }
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.push(id);
        }
        for child in &record.children {
            self.insert_record(child, id);
        }
    }

    /// The tree below the root as id-free records.
    pub fn export(&self) -> Vec<NodeRecord> {
        self.children(NodeId::ROOT)
            .map(|n| self.record_of(n))
            .collect()
    }

    fn record_of(&self, node: &Node) -> NodeRecord {
        NodeRecord {
            text: node.text.clone(),
            attributes: node
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            children: self.children(node.id).map(|c| self.record_of(c)).collect(),
        }
    }
}

/// Preorder iterator over a subtree. Clone it to restart.
#[derive(Clone)]
pub struct Descendants<'a> {
    doc: &'a Document,
    walker: Walker,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.walker.next(self.doc)?;
        self.doc.get(id)
    }
}

/// Restartable preorder cursor that holds ids only, so the document can be
/// borrowed mutably between steps for attribute writes.
#[derive(Debug, Clone)]
pub struct Walker {
    start: NodeId,
    stack: Vec<NodeId>,
    primed: bool,
}

impl Walker {
    pub fn new(start: NodeId) -> Self {
        Self {
            start,
            stack: Vec::new(),
            primed: false,
        }
    }

    pub fn next(&mut self, doc: &Document) -> Option<NodeId> {
        if !self.primed {
            self.primed = true;
            self.push_children(doc, self.start);
        }
        loop {
            let id = self.stack.pop()?;
            if doc.get(id).is_some() {
                self.push_children(doc, id);
                return Some(id);
            }
        }
    }

    /// Starts over from the first descendant.
    pub fn restart(&mut self) {
        self.stack.clear();
        self.primed = false;
    }

    fn push_children(&mut self, doc: &Document, id: NodeId) {
        if let Some(node) = doc.get(id) {
            self.stack.extend(node.children().iter().rev());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use std::sync::{Arc, Mutex};

    fn doc() -> Document {
        let ctx = EngineContext::new(EngineConfig {
            node_timestamps: false,
            ..Default::default()
        });
        Document::new(&ctx)
    }

    fn texts(doc: &Document, parent: NodeId) -> Vec<String> {
        doc.children(parent).map(|n| n.text().to_string()).collect()
    }

    fn record_events(doc: &mut Document, event: NodeEvent) -> Arc<Mutex<Vec<NodeId>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        doc.bus_mut()
            .subscribe_node(event, move |n| sink.lock().unwrap().push(n.id()));
        log
    }

    #[test]
    fn create_assigns_fresh_ids_never_reused() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        doc.remove(a).unwrap();
        let b = doc.add_new(NodeId::ROOT, "B").unwrap();
        assert_ne!(a, b);
        assert!(!a.is_root() && !b.is_root());
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn add_child_respects_index_and_rejects_out_of_range() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let c = doc.add_new(NodeId::ROOT, "C").unwrap();
        let b = doc.create("B");
        doc.add_child(b, NodeId::ROOT, Some(1)).unwrap();
        assert_eq!(texts(&doc, NodeId::ROOT), vec!["A", "B", "C"]);
        assert_eq!(doc.index_of(c).unwrap(), 2);
        assert_eq!(doc.node(b).unwrap().parent(), Some(NodeId::ROOT));

        let d = doc.create("D");
        let err = doc.add_child(d, a, Some(5)).unwrap_err();
        assert!(matches!(err, KeyMinderError::InvalidOperation(_)));
    }

    #[test]
    fn add_child_rejects_cycles_and_foreign_parents() {
        let mut doc = doc();
        let a = doc.create("A");
        let b = doc.create("B");
        doc.add_child(b, a, None).unwrap();
        assert!(matches!(
            doc.add_child(a, b, None),
            Err(KeyMinderError::InvalidOperation(_))
        ));
        assert!(matches!(
            doc.add_child(a, NodeId(999), None),
            Err(KeyMinderError::InvalidOperation(_))
        ));
        assert!(matches!(
            doc.add_child(NodeId::ROOT, a, None),
            Err(KeyMinderError::InvalidOperation(_))
        ));
        // building detached subtrees does not touch the document
        assert!(!doc.is_changed());
        assert!(!doc.can_undo());

        doc.add_child(a, NodeId::ROOT, None).unwrap();
        assert!(doc.contains(b));
        assert!(matches!(
            doc.add_child(b, NodeId::ROOT, None),
            Err(KeyMinderError::InvalidOperation(_))
        ));
    }

    #[test]
    fn move_at_boundary_returns_false() {
        let mut doc = doc();
        let _a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let b = doc.add_new(NodeId::ROOT, "B").unwrap();
        assert!(doc.move_node(b, Direction::Up).unwrap());
        assert_eq!(texts(&doc, NodeId::ROOT), vec!["B", "A"]);

        let undo_entries = doc.undo_log().len();
        assert!(!doc.move_node(b, Direction::Up).unwrap());
        assert_eq!(texts(&doc, NodeId::ROOT), vec!["B", "A"]);
        assert_eq!(doc.undo_log().len(), undo_entries);
    }

    #[test]
    fn removing_selected_node_moves_selection_first() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let b = doc.add_new(a, "B").unwrap();
        doc.select(b).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let sel_order = Arc::clone(&order);
        doc.bus_mut()
            .subscribe_node(NodeEvent::SelectionChanged, move |n| {
                sel_order.lock().unwrap().push(("selected", n.id()))
            });
        let rm_order = Arc::clone(&order);
        doc.bus_mut().subscribe_node(NodeEvent::Removed, move |n| {
            rm_order.lock().unwrap().push(("removed", n.id()))
        });

        doc.remove(b).unwrap();
        assert_eq!(doc.selected(), a);
        assert_eq!(
            *order.lock().unwrap(),
            vec![("selected", a), ("removed", b)]
        );
    }

    #[test]
    fn removing_ancestor_of_selection_repoints_selection() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let b = doc.add_new(a, "B").unwrap();
        let c = doc.add_new(b, "C").unwrap();
        doc.select(c).unwrap();
        let removed = record_events(&mut doc, NodeEvent::Removed);

        doc.remove(b).unwrap();
        assert_eq!(doc.selected(), a);
        assert!(doc.get(c).is_none());
        assert_eq!(*removed.lock().unwrap(), vec![b]);
    }

    #[test]
    fn root_cannot_be_removed() {
        let mut doc = doc();
        assert!(matches!(
            doc.remove(NodeId::ROOT),
            Err(KeyMinderError::InvalidOperation(_))
        ));
    }

    #[test]
    fn undo_restores_removed_subtree_in_place() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let b = doc.add_new(NodeId::ROOT, "B").unwrap();
        let b1 = doc.add_new(b, "B1").unwrap();
        doc.set_attribute(b1, "user", "alice").unwrap();
        let _c = doc.add_new(NodeId::ROOT, "C").unwrap();
        doc.select(b1).unwrap();
        let before = doc.export();

        doc.remove(b).unwrap();
        assert_eq!(texts(&doc, NodeId::ROOT), vec!["A", "C"]);
        assert!(doc.undo().unwrap());

        assert_eq!(doc.export(), before);
        assert_eq!(doc.selected(), b1);
        assert!(doc.contains(a));
        assert_eq!(doc.node(b1).unwrap().parent(), Some(b));
    }

    #[test]
    fn undo_reverts_attribute_and_text_writes() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        doc.set_attribute(a, "user", "alice").unwrap();
        doc.set_attribute(a, "user", "bob").unwrap();
        doc.set_attribute(a, "text", "Renamed").unwrap();
        assert_eq!(doc.node(a).unwrap().text(), "Renamed");

        assert!(doc.undo().unwrap());
        assert_eq!(doc.node(a).unwrap().text(), "A");
        assert!(doc.undo().unwrap());
        assert_eq!(doc.get_attribute(a, "user", "-").unwrap(), "alice");
        assert!(doc.undo().unwrap());
        assert_eq!(doc.get_attribute(a, "user", "-").unwrap(), "-");
        assert!(doc.undo().unwrap());
        assert!(doc.get(a).is_none());
        assert!(!doc.undo().unwrap());
    }

    #[test]
    fn undo_reverts_remove_attribute_and_move() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let _b = doc.add_new(NodeId::ROOT, "B").unwrap();
        doc.set_attribute(a, "color", "#ff0000").unwrap();

        assert_eq!(
            doc.remove_attribute(a, "color").unwrap(),
            Some("#ff0000".to_string())
        );
        assert_eq!(doc.remove_attribute(a, "color").unwrap(), None);
        doc.move_node(a, Direction::Down).unwrap();

        doc.undo().unwrap();
        assert_eq!(texts(&doc, NodeId::ROOT), vec!["A", "B"]);
        doc.undo().unwrap();
        assert_eq!(doc.get_attribute(a, "color", "").unwrap(), "#ff0000");
    }

    #[test]
    fn transaction_undoes_in_one_step() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let entries = doc.undo_log().len();

        doc.transaction(|d| {
            d.set_attribute(a, "user", "alice")?;
            d.set_attribute(a, "pass", "pw")?;
            d.add_new(a, "child")?;
            d.set_text(a, "Mail")
        })
        .unwrap();
        assert_eq!(doc.undo_log().len(), entries + 1);

        assert!(doc.undo().unwrap());
        let node = doc.node(a).unwrap();
        assert_eq!(node.text(), "A");
        assert!(node.attributes().is_empty());
        assert!(!node.has_children());
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let result: Result<()> = doc.transaction(|d| {
            d.set_attribute(a, "user", "alice")?;
            d.remove(NodeId::ROOT)
        });
        assert!(result.is_err());
        assert!(!doc.node(a).unwrap().has_attribute("user"));
    }

    #[test]
    fn failed_transaction_keeps_a_clean_document_clean() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        doc.mark_saved();
        let result: Result<()> = doc.transaction(|d| {
            d.add_new(a, "child")?;
            d.remove(NodeId::ROOT)
        });
        assert!(result.is_err());
        assert!(!doc.is_changed());
        assert_eq!(doc.children(a).count(), 0);

        doc.set_text(a, "A2").unwrap();
        let result: Result<()> = doc.transaction(|d| d.remove(NodeId::ROOT));
        assert!(result.is_err());
        assert!(doc.is_changed());
    }

    #[test]
    fn next_and_previous_follow_sibling_order() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let a1 = doc.add_new(a, "A1").unwrap();
        let a2 = doc.add_new(a, "A2").unwrap();
        let b = doc.add_new(NodeId::ROOT, "B").unwrap();

        assert_eq!(doc.next_node(a).unwrap(), b);
        assert_eq!(doc.next_node(a1).unwrap(), a2);
        assert_eq!(doc.next_node(a2).unwrap(), b);
        assert_eq!(doc.next_node(b).unwrap(), NodeId::ROOT);
        assert_eq!(doc.next_node(NodeId::ROOT).unwrap(), NodeId::ROOT);

        assert_eq!(doc.previous_node(b).unwrap(), a);
        assert_eq!(doc.previous_node(a2).unwrap(), a1);
        assert_eq!(doc.previous_node(a1).unwrap(), a);
        assert_eq!(doc.previous_node(a).unwrap(), a);
        assert_eq!(doc.previous_node(NodeId::ROOT).unwrap(), NodeId::ROOT);
    }

    #[test]
    fn undo_suspension_restores_previous_state_on_error() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let entries = doc.undo_log().len();
        let result: Result<()> = doc.with_undo_suspended(|d| {
            d.set_attribute(a, "quicklink", "mail")?;
            Err(invalid("boom"))
        });
        assert!(result.is_err());
        assert!(doc.undo_enabled());
        assert_eq!(doc.undo_log().len(), entries);
        assert_eq!(doc.get_attribute(a, "quicklink", "").unwrap(), "mail");
    }

    #[test]
    fn clone_subtree_makes_detached_copy() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let b = doc.add_new(a, "B").unwrap();
        doc.set_attribute(b, "user", "alice").unwrap();

        let copy = doc.clone_subtree(a, true).unwrap();
        assert_ne!(copy, a);
        assert!(!doc.contains(copy));
        assert_eq!(doc.len(), 3);
        let child = doc.node(copy).unwrap().children()[0];
        assert_ne!(child, b);
        assert_eq!(doc.get_attribute(child, "user", "").unwrap(), "alice");

        let shallow = doc.clone_subtree(a, false).unwrap();
        assert!(!doc.node(shallow).unwrap().has_children());
        doc.discard(shallow).unwrap();
        assert!(doc.get(shallow).is_none());
    }

    #[test]
    fn move_to_is_one_undo_step() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let b = doc.add_new(NodeId::ROOT, "B").unwrap();
        let b1 = doc.add_new(b, "B1").unwrap();
        doc.select(b).unwrap();
        let before = doc.export();

        let moved = doc.move_to(b, a, None).unwrap();
        assert_eq!(doc.node_path(moved).unwrap(), "/A/B");
        assert_eq!(doc.selected(), moved);
        assert!(doc.get(b1).is_none());
        assert_eq!(texts(&doc, NodeId::ROOT), vec!["A"]);

        assert!(doc.undo().unwrap());
        assert_eq!(doc.export(), before);
        assert_eq!(doc.selected(), b);
    }

    #[test]
    fn move_to_rejects_own_subtree() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let b = doc.add_new(a, "B").unwrap();
        assert!(matches!(
            doc.move_to(a, b, None),
            Err(KeyMinderError::InvalidOperation(_))
        ));
        assert_eq!(doc.len(), 3);
    }

    #[test]
    fn sort_is_stable_and_undoable() {
        let mut doc = doc();
        for t in ["b", "a", "c", "a"] {
            doc.add_new(NodeId::ROOT, t).unwrap();
        }
        let first_a = doc.root().children()[1];
        let folder = doc.root().children()[2];
        doc.add_new(folder, "z").unwrap();
        doc.add_new(folder, "y").unwrap();

        doc.sort_children(NodeId::ROOT, true).unwrap();
        assert_eq!(texts(&doc, NodeId::ROOT), vec!["a", "a", "b", "c"]);
        assert_eq!(doc.root().children()[0], first_a);
        assert_eq!(texts(&doc, folder), vec!["y", "z"]);

        assert!(doc.undo().unwrap());
        assert_eq!(texts(&doc, NodeId::ROOT), vec!["b", "a", "c", "a"]);
        assert_eq!(texts(&doc, folder), vec!["z", "y"]);
    }

    #[test]
    fn traversal_is_preorder_and_restartable() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        doc.add_new(a, "A1").unwrap();
        doc.add_new(NodeId::ROOT, "B").unwrap();

        let order: Vec<_> = doc.descendants(NodeId::ROOT).map(|n| n.text().to_string()).collect();
        assert_eq!(order, vec!["A", "A1", "B"]);

        let mut walker = doc.walker(NodeId::ROOT);
        while let Some(id) = walker.next(&doc) {
            doc.set_attribute(id, "seen", "yes").unwrap();
        }
        assert!(doc.descendants(NodeId::ROOT).all(|n| n.has_attribute("seen")));

        walker.restart();
        assert_eq!(walker.next(&doc), Some(a));

        let mut direct = Vec::new();
        doc.for_each_child(NodeId::ROOT, |n| direct.push(n.text().to_string()))
            .unwrap();
        assert_eq!(direct, vec!["A", "B"]);
    }

    #[test]
    fn events_follow_mutations_and_respect_gate() {
        let mut doc = doc();
        let added = record_events(&mut doc, NodeEvent::Added);
        let edited = record_events(&mut doc, NodeEvent::Edited);

        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        doc.set_attribute(a, "user", "alice").unwrap();
        doc.set_events_enabled(false);
        let b = doc.add_new(NodeId::ROOT, "B").unwrap();
        doc.set_events_enabled(true);

        assert_eq!(*added.lock().unwrap(), vec![a]);
        assert_eq!(*edited.lock().unwrap(), vec![a]);
        assert!(doc.contains(b));
    }

    #[test]
    fn dirty_flag_tracks_mutations() {
        let mut doc = doc();
        assert!(!doc.is_changed());
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        assert!(doc.is_changed());
        doc.mark_saved();
        doc.get_attribute(a, "user", "").unwrap();
        assert!(!doc.is_changed());
        doc.set_text(a, "B").unwrap();
        assert!(doc.is_changed());
    }

    #[test]
    fn timestamps_are_stamped_and_undone_together() {
        let mut doc = Document::default();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let created = doc.get_attribute(a, ATTR_CREATED, "").unwrap();
        assert!(!created.is_empty());
        assert!(doc.node(a).unwrap().has_attribute(ATTR_MODIFIED));

        doc.node_mut(a).unwrap().attributes.insert(ATTR_MODIFIED.into(), "1".into());
        doc.set_attribute(a, "user", "alice").unwrap();
        assert_ne!(doc.get_attribute(a, ATTR_MODIFIED, "").unwrap(), "1");

        doc.undo().unwrap();
        assert_eq!(doc.get_attribute(a, ATTR_MODIFIED, "").unwrap(), "1");
        assert!(!doc.node(a).unwrap().has_attribute("user"));
    }

    #[test]
    fn paths_resolve_absolute_and_relative() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "Mail").unwrap();
        let b = doc.add_new(a, "Work").unwrap();
        let c = doc.add_new(NodeId::ROOT, "Servers").unwrap();

        assert_eq!(doc.node_path(b).unwrap(), "/Mail/Work");
        assert_eq!(doc.node_path(NodeId::ROOT).unwrap(), "/");
        assert_eq!(doc.node_by_path("/Mail/Work"), Some(b));
        assert_eq!(doc.node_by_path("/"), Some(NodeId::ROOT));

        doc.select(b).unwrap();
        assert_eq!(doc.node_by_path("../../Servers"), Some(c));
        assert_eq!(doc.node_by_path("./"), Some(b));
        assert_eq!(doc.node_by_path("/Nope"), None);
        assert_eq!(doc.node_by_path("/.."), None);
    }

    #[test]
    fn linked_nodes_skip_and_prune_dangling_ids() {
        let mut doc = doc();
        let a = doc.add_new(NodeId::ROOT, "A").unwrap();
        let b = doc.add_new(NodeId::ROOT, "B").unwrap();
        let c = doc.add_new(NodeId::ROOT, "C").unwrap();

        assert!(doc.add_linked_node(a, b).unwrap());
        assert!(doc.add_linked_node(a, c).unwrap());
        assert!(!doc.add_linked_node(a, b).unwrap());
        assert!(doc.add_linked_node(a, a).is_err());

        doc.remove(c).unwrap();
        assert_eq!(doc.linked_nodes(a).unwrap(), vec![b]);
        assert_eq!(doc.prune_linked_nodes(a).unwrap(), 1);
        assert_eq!(doc.get_attribute(a, ATTR_LINKED_NODES, "").unwrap(), b.to_string());

        assert!(doc.remove_linked_node(a, b).unwrap());
        assert!(!doc.node(a).unwrap().has_attribute(ATTR_LINKED_NODES));
    }

    #[test]
    fn import_and_export_preserve_structure() {
        let records = vec![
            NodeRecord::new("A").with_child(NodeRecord::new("B").with_attribute("user", "alice")),
            NodeRecord::new("C"),
        ];
        let mut doc = Document::default();
        let added = record_events(&mut doc, NodeEvent::Added);
        doc.import(&records);

        assert_eq!(doc.export(), records);
        assert_eq!(doc.len(), 4);
        assert!(!doc.is_changed());
        assert!(!doc.can_undo());
        assert!(added.lock().unwrap().is_empty());
    }

    #[test]
    fn reset_clears_tree_but_keeps_subscriptions() {
        let mut doc = doc();
        let added = record_events(&mut doc, NodeEvent::Added);
        doc.add_new(NodeId::ROOT, "A").unwrap();
        doc.reset();
        assert_eq!(doc.len(), 1);
        assert!(!doc.can_undo());
        assert_eq!(doc.selected(), NodeId::ROOT);

        doc.add_new(NodeId::ROOT, "B").unwrap();
        assert_eq!(added.lock().unwrap().len(), 2);
    }
}
