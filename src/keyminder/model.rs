//! # Domain Model
//!
//! A KeyMinder document is a single rooted tree of [`Node`]s. Every node is a
//! folder or a credential entry at the same time: it has a display `text`, an
//! opaque string attribute map and an ordered list of children.
//!
//! ## Identity
//!
//! Nodes are addressed by [`NodeId`]. Ids are handed out by the owning
//! [`Document`](crate::store::Document) from a monotonic counter, so an id is
//! never reused within one document instance, not even after the node was
//! removed. `NodeId::ROOT` (`0`) is reserved for the root node.
//!
//! Ids are *not* persisted: reopening a file may assign different ids.
//!
//! ## Ownership
//!
//! The document owns every node in a central arena. `parent` and `children`
//! are ids into that arena, never references, so there is no shared ownership
//! and no cycle between a node and its parent.
//!
//! ## Reserved Attributes
//!
//! | Key            | Meaning                                         |
//! |----------------|-------------------------------------------------|
//! | `created`      | Creation time, epoch milliseconds               |
//! | `modified`     | Last modification time, epoch milliseconds      |
//! | `color`        | Display color (HTML notation)                   |
//! | `style`        | Style flags for the presentation layer          |
//! | `linked_nodes` | `;`-joined list of linked node ids              |
//! | `quicklink`    | Name of the favorite slot this node occupies    |
//!
//! The pseudo key `text` addresses the node's label.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

pub const ATTR_TEXT: &str = "text";
pub const ATTR_CREATED: &str = "created";
pub const ATTR_MODIFIED: &str = "modified";
pub const ATTR_COLOR: &str = "color";
pub const ATTR_STYLE: &str = "style";
pub const ATTR_LINKED_NODES: &str = "linked_nodes";
pub const ATTR_QUICKLINK: &str = "quicklink";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(NodeId)
    }
}

/// Direction of a vertical move among siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) text: String,
    pub(crate) attributes: HashMap<String, String>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    /// Reachable from the root. Freshly created and cloned nodes start detached.
    pub(crate) attached: bool,
}

impl Node {
    pub(crate) fn new(id: NodeId, text: String) -> Self {
        Self {
            id,
            text,
            attributes: HashMap::new(),
            parent: None,
            children: Vec::new(),
            attached: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        self.id.is_root()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        if key == ATTR_TEXT {
            return Some(&self.text);
        }
        self.attributes.get(key).map(String::as_str)
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }
}

/// Id-free, serializable form of a subtree, as written to and read from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeRecord>,
}

impl NodeRecord {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_child(mut self, child: NodeRecord) -> Self {
        self.children.push(child);
        self
    }
}

/// Parses a `linked_nodes` attribute value. Malformed entries are skipped.
pub fn parse_linked_ids(value: &str) -> Vec<NodeId> {
    value
        .split(';')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

pub fn join_linked_ids(ids: &[NodeId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(";")
}
