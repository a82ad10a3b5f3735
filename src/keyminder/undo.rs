//! Undo log: bounded history of inverse operations grouped into transactions.
//!
//! The log only stores what to do; replaying an [`InverseOp`] needs the node
//! arena and therefore lives in [`Document::undo`](crate::store::Document::undo).

use crate::error::{KeyMinderError, Result};
use crate::model::{Direction, NodeId};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, warn};

pub const DEFAULT_UNDO_LIMIT: usize = 20;

/// A removed subtree, captured with its original ids so a restore brings back
/// the very same nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtreeSnapshot {
    pub id: NodeId,
    pub text: String,
    pub attributes: HashMap<String, String>,
    pub children: Vec<SubtreeSnapshot>,
}

impl SubtreeSnapshot {
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(SubtreeSnapshot::count).sum::<usize>()
    }
}

/// The operation that reverts one primitive mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InverseOp {
    /// Reverts an insertion: detach `node` and release its subtree.
    RemoveNode { node: NodeId },
    /// Reverts a removal: put `subtree` back under `parent` at `index`.
    RestoreSubtree {
        parent: NodeId,
        index: usize,
        subtree: SubtreeSnapshot,
    },
    /// Reverts an attribute write. `None` means the key did not exist.
    SetAttribute {
        node: NodeId,
        key: String,
        previous: Option<String>,
    },
    SetText { node: NodeId, previous: String },
    /// Reverts a vertical move by moving back.
    Move { node: NodeId, direction: Direction },
    /// Reverts a sort by reinstating the previous child order.
    Reorder { parent: NodeId, order: Vec<NodeId> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: u64,
    pub ops: Vec<InverseOp>,
    /// Selected node when the transaction started.
    pub selected_before: NodeId,
}

#[derive(Debug)]
pub struct UndoLog {
    entries: VecDeque<Transaction>,
    open: Option<Transaction>,
    depth: usize,
    limit: usize,
    enabled: bool,
    next_id: u64,
}

impl Default for UndoLog {
    fn default() -> Self {
        Self::new(DEFAULT_UNDO_LIMIT)
    }
}

impl UndoLog {
    pub fn new(limit: usize) -> Self {
        let mut log = Self {
            entries: VecDeque::new(),
            open: None,
            depth: 0,
            limit: DEFAULT_UNDO_LIMIT,
            enabled: true,
            next_id: 1,
        };
        log.set_limit(limit);
        log
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Changes the bound, evicting the oldest transactions if needed.
    pub fn set_limit(&mut self, limit: usize) {
        if limit == 0 {
            warn!("undo limit 0 is not usable, keeping {}", self.limit);
            return;
        }
        self.limit = limit;
        self.evict();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Switches recording on or off and returns the previous state. Entries
    /// already recorded are kept either way.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        std::mem::replace(&mut self.enabled, enabled)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    /// Id of the transaction currently being built, if any.
    pub fn open_id(&self) -> Option<u64> {
        self.open.as_ref().map(|tx| tx.id)
    }

    /// Id of the most recent committed transaction.
    pub fn last_id(&self) -> Option<u64> {
        self.entries.back().map(|tx| tx.id)
    }

    pub fn begin(&mut self, selected: NodeId) {
        self.depth += 1;
        if self.depth == 1 {
            self.open = Some(self.new_transaction(selected));
        }
    }

    /// Closes one level. Only the outermost `end` commits the transaction;
    /// an empty transaction is dropped.
    pub fn end(&mut self) -> Result<()> {
        if self.depth == 0 {
            return Err(KeyMinderError::InvalidOperation(
                "undo transaction ended without begin".to_string(),
            ));
        }
        self.depth -= 1;
        if self.depth == 0 {
            if let Some(tx) = self.open.take() {
                if !tx.ops.is_empty() {
                    debug!(transaction = tx.id, ops = tx.ops.len(), "undo commit");
                    self.push(tx);
                }
            }
        }
        Ok(())
    }

    /// Appends `op` to the open transaction, or commits it as a transaction
    /// of its own.
    pub fn record(&mut self, op: InverseOp, selected: NodeId) {
        if !self.enabled {
            return;
        }
        if let Some(open) = self.open.as_mut() {
            open.ops.push(op);
            return;
        }
        let mut tx = self.new_transaction(selected);
        tx.ops.push(op);
        self.push(tx);
    }

    /// Removes and returns the most recent committed transaction.
    pub fn pop(&mut self) -> Option<Transaction> {
        self.entries.pop_back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops all history, including a half-open transaction.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.open = None;
        self.depth = 0;
    }

    fn new_transaction(&mut self, selected: NodeId) -> Transaction {
        let id = self.next_id;
        self.next_id += 1;
        Transaction {
            id,
            ops: Vec::new(),
            selected_before: selected,
        }
    }

    fn push(&mut self, tx: Transaction) {
        self.entries.push_back(tx);
        self.evict();
    }

    fn evict(&mut self) {
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_op(n: u64) -> InverseOp {
        InverseOp::SetText {
            node: NodeId(n),
            previous: format!("old {n}"),
        }
    }

    #[test]
    fn record_outside_transaction_commits_single_op() {
        let mut log = UndoLog::default();
        log.record(text_op(1), NodeId::ROOT);
        log.record(text_op(2), NodeId::ROOT);
        assert_eq!(log.len(), 2);
        let tx = log.pop().unwrap();
        assert_eq!(tx.ops, vec![text_op(2)]);
    }

    #[test]
    fn nested_begin_commits_on_outermost_end() {
        let mut log = UndoLog::default();
        log.begin(NodeId(5));
        log.record(text_op(1), NodeId::ROOT);
        log.begin(NodeId::ROOT);
        log.record(text_op(2), NodeId::ROOT);
        log.end().unwrap();
        assert!(log.is_empty());
        log.end().unwrap();

        assert_eq!(log.len(), 1);
        let tx = log.pop().unwrap();
        assert_eq!(tx.ops.len(), 2);
        assert_eq!(tx.selected_before, NodeId(5));
    }

    #[test]
    fn end_without_begin_is_invalid() {
        let mut log = UndoLog::default();
        assert!(matches!(
            log.end(),
            Err(KeyMinderError::InvalidOperation(_))
        ));
    }

    #[test]
    fn empty_transactions_are_dropped() {
        let mut log = UndoLog::default();
        log.begin(NodeId::ROOT);
        log.end().unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn disabled_log_keeps_existing_entries() {
        let mut log = UndoLog::default();
        log.record(text_op(1), NodeId::ROOT);
        assert!(log.set_enabled(false));
        log.record(text_op(2), NodeId::ROOT);
        assert_eq!(log.len(), 1);
        log.set_enabled(true);
        log.record(text_op(3), NodeId::ROOT);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn oldest_transactions_are_evicted() {
        let mut log = UndoLog::new(3);
        for n in 0..5 {
            log.record(text_op(n), NodeId::ROOT);
        }
        assert_eq!(log.len(), 3);
        let ids: Vec<_> = std::iter::from_fn(|| log.pop()).map(|tx| tx.ops[0].clone()).collect();
        assert_eq!(ids, vec![text_op(4), text_op(3), text_op(2)]);
    }

    #[test]
    fn zero_limit_is_ignored() {
        let mut log = UndoLog::new(0);
        assert_eq!(log.limit(), DEFAULT_UNDO_LIMIT);
        log.set_limit(2);
        log.set_limit(0);
        assert_eq!(log.limit(), 2);
    }
}
