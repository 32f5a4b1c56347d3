//! Undo/redo history of attribute value changes.

use std::collections::VecDeque;

use crate::broadcast::DispatchMode;
use crate::error::Result;
use crate::event::{ChangeKind, ChangeMask};
use crate::logging::targets;
use crate::node::NodeId;
use crate::session::Session;
use crate::value::Value;

/// One recorded attribute write.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    pub node: NodeId,
    pub old: Value,
    pub new: Value,
}

#[derive(Debug)]
pub(crate) struct CommandHistory {
    undo: VecDeque<ValueChange>,
    redo: Vec<ValueChange>,
    depth: usize,
}

impl CommandHistory {
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            depth,
        }
    }

    fn record(&mut self, change: ValueChange) {
        if self.depth == 0 {
            return;
        }
        if self.undo.len() == self.depth {
            self.undo.pop_front();
        }
        self.undo.push_back(change);
        self.redo.clear();
    }
}

impl Session {
    pub(crate) fn record_value_change(&self, change: ValueChange) {
        self.inner_history().lock().record(change);
    }

    /// Revert the most recent value change.
    ///
    /// Changes of destroyed nodes are discarded. Returns `false` when there
    /// was nothing to undo.
    pub fn undo(&self) -> Result<bool> {
        loop {
            let Some(change) = self.inner_history().lock().undo.pop_back() else {
                return Ok(false);
            };
            if !self.contains(change.node) {
                continue;
            }
            self.apply_history_value(change.node, change.old.clone(), ChangeKind::Undo)?;
            self.inner_history().lock().redo.push(change);
            return Ok(true);
        }
    }

    /// Re-apply the most recently undone value change.
    pub fn redo(&self) -> Result<bool> {
        loop {
            let Some(change) = self.inner_history().lock().redo.pop() else {
                return Ok(false);
            };
            if !self.contains(change.node) {
                continue;
            }
            self.apply_history_value(change.node, change.new.clone(), ChangeKind::Redo)?;
            self.inner_history().lock().undo.push_back(change);
            return Ok(true);
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.inner_history().lock().undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.inner_history().lock().redo.is_empty()
    }

    /// The recorded changes, oldest first.
    pub fn undo_stack(&self) -> Vec<ValueChange> {
        self.inner_history().lock().undo.iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        let mut history = self.inner_history().lock();
        history.undo.clear();
        history.redo.clear();
    }

    /// Write a value without hooks or validation and without recording it.
    fn apply_history_value(&self, node: NodeId, value: Value, kind: ChangeKind) -> Result<()> {
        let current = self.value(node)?;
        tracing::debug!(target: targets::VALUE, ?node, ?kind, "applying history value");
        self.write_value(node, &current, value, kind)?;
        self.broadcast(node, ChangeMask::VALUE, kind, DispatchMode::Immediate)?;
        Ok(())
    }
}
