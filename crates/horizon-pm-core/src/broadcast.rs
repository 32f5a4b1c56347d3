//! Event broadcasting.
//!
//! A broadcast delivers one change to every node of a subtree in three
//! passes over the same pre-order node list:
//!
//! 1. **Pre-process**: listeners that asked for it see the event first.
//! 2. **Handle**: affected caches are cleared and every matching listener is
//!    called. The pre-process event of a node is reused, so requests a
//!    listener attached during pre-processing are still there.
//! 3. **Post-process**: attached post-processing requests run, then a
//!    propagation event travels from the broadcast root up to the enclosing
//!    conversation.
//!
//! Dynamic children and nested conversations are not part of a parent's
//! broadcast. In [`DispatchMode::Deferred`], subtrees configured to defer
//! events whose bean has not been read yet are parked instead: the pending
//! broadcast is stored on the node and runs once, in immediate mode, when
//! the bean is read or [`Session::flush_deferred_events`] sweeps the tree.

use std::collections::HashMap;

use crate::cache::CacheAspect;
use crate::error::{PmError, Result};
use crate::event::{ChangeKind, ChangeMask, PmEvent};
use crate::listener::DispatchPhase;
use crate::logging::targets;
use crate::node::{NodeId, NodeKind};
use crate::session::Session;

/// How a broadcast treats nodes with deferred event handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Visit every node now.
    #[default]
    Immediate,
    /// Park the broadcast for nodes whose bean was not read yet.
    Deferred,
}

/// Progress of a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BroadcastState {
    Created,
    PreProcessed,
    Handled,
    PostProcessed,
}

/// A broadcast parked on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBroadcast {
    /// Source of the original broadcast.
    pub source: NodeId,
    pub mask: ChangeMask,
    pub kind: ChangeKind,
}

impl PendingBroadcast {
    /// Combine with a broadcast parked later on the same node.
    ///
    /// Masks are united. A reload is never downgraded, otherwise the later
    /// broadcast's kind and source win.
    pub fn merge(self, later: PendingBroadcast) -> PendingBroadcast {
        let mask = self.mask | later.mask;
        if self.kind == ChangeKind::Reload && later.kind != ChangeKind::Reload {
            PendingBroadcast { mask, ..self }
        } else {
            PendingBroadcast { mask, ..later }
        }
    }
}

/// Node property holding a parked broadcast.
pub(crate) const PENDING_BROADCAST: &str = "pm.deferred_broadcast";

fn trace_state(root: NodeId, state: BroadcastState) {
    tracing::trace!(target: targets::BROADCAST, ?root, ?state, "broadcast phase done");
}

impl Session {
    /// Broadcast a change of `root` to its subtree and propagate it upwards.
    #[tracing::instrument(skip(self), target = "horizon_pm_core::broadcast", level = "trace")]
    pub fn broadcast(
        &self,
        root: NodeId,
        mask: ChangeMask,
        kind: ChangeKind,
        mode: DispatchMode,
    ) -> Result<BroadcastState> {
        self.run_broadcast(root, root, mask, kind, mode, true)
    }

    fn run_broadcast(
        &self,
        root: NodeId,
        source: NodeId,
        mask: ChangeMask,
        kind: ChangeKind,
        mode: DispatchMode,
        propagate: bool,
    ) -> Result<BroadcastState> {
        let nodes = self.broadcast_targets(root, source, mask, kind, mode)?;
        tracing::trace!(
            target: targets::BROADCAST,
            ?root,
            ?mask,
            ?kind,
            nodes = nodes.len(),
            "broadcast started"
        );

        let mut events: HashMap<NodeId, PmEvent> = HashMap::new();
        for &node in &nodes {
            // A pre-process listener may have destroyed part of the subtree.
            if !self.contains(node) {
                continue;
            }
            let event = PmEvent::new(source, node, mask, kind);
            let listeners =
                self.with_node(node, |d| d.listeners.snapshot(&event, DispatchPhase::PreProcess))?;
            if listeners.is_empty() {
                continue;
            }
            listeners
                .fire_event(self, &event)
                .map_err(|err| PmError::listener(self.node_path(node), err))?;
            events.insert(node, event);
        }
        trace_state(root, BroadcastState::PreProcessed);

        let mut post_processing = Vec::new();
        for node in nodes {
            // A listener may have destroyed part of the subtree.
            if !self.contains(node) {
                continue;
            }
            let event = events
                .remove(&node)
                .unwrap_or_else(|| PmEvent::new(source, node, mask, kind));
            self.clear_for_event(node, &event)?;
            self.dispatch(node, &event, DispatchPhase::Handle)?;
            if event.has_post_processing() {
                post_processing.push(event);
            }
        }
        trace_state(root, BroadcastState::Handled);

        for event in &post_processing {
            event.run_post_processing(self)?;
        }
        if propagate && self.contains(root) {
            self.propagate(root, source, mask, kind)?;
        }
        trace_state(root, BroadcastState::PostProcessed);
        Ok(BroadcastState::PostProcessed)
    }

    /// Pre-order target list. Parks deferred subtrees in deferred mode.
    fn broadcast_targets(
        &self,
        root: NodeId,
        source: NodeId,
        mask: ChangeMask,
        kind: ChangeKind,
        mode: DispatchMode,
    ) -> Result<Vec<NodeId>> {
        let mut tree = self.write_tree();
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let data = tree.node(id)?;
            if id != root && (data.dynamic || data.kind == NodeKind::Conversation) {
                continue;
            }
            if mode == DispatchMode::Deferred && data.meta.defers_events() && !data.bean_accessed {
                let parked = PendingBroadcast { source, mask, kind };
                let parked = match tree.property::<PendingBroadcast>(id, PENDING_BROADCAST)? {
                    Some(&earlier) => earlier.merge(parked),
                    None => parked,
                };
                tracing::trace!(
                    target: targets::BROADCAST,
                    node = ?id,
                    mask = ?parked.mask,
                    "broadcast parked"
                );
                tree.set_property(id, PENDING_BROADCAST, parked)?;
                continue;
            }
            order.push(id);
            stack.extend(data.children.iter().rev().copied());
        }
        Ok(order)
    }

    fn clear_for_event(&self, node: NodeId, event: &PmEvent) -> Result<()> {
        if event.is_reload() {
            return self.clear_cache(node, &CacheAspect::ALL);
        }
        // The source's own value cache already holds the new value.
        let keeps_value = node == event.source()
            && matches!(event.kind(), ChangeKind::Value | ChangeKind::Undo | ChangeKind::Redo);
        let aspects: Vec<CacheAspect> = CacheAspect::for_mask(event.mask())
            .filter(|&aspect| !(keeps_value && aspect == CacheAspect::Value))
            .collect();
        if aspects.is_empty() {
            return Ok(());
        }
        self.clear_cache(node, &aspects)
    }

    fn dispatch(&self, node: NodeId, event: &PmEvent, phase: DispatchPhase) -> Result<()> {
        // Snapshot under the tree lock, deliver after releasing it.
        let listeners = self.with_node(node, |d| d.listeners.snapshot(event, phase))?;
        listeners
            .fire_event(self, event)
            .map_err(|err| PmError::listener(self.node_path(node), err))
    }

    fn propagate(
        &self,
        root: NodeId,
        source: NodeId,
        mask: ChangeMask,
        kind: ChangeKind,
    ) -> Result<()> {
        let chain = self.read_tree().scope_chain(root)?;
        for node in chain {
            if !self.contains(node) {
                break;
            }
            let event = PmEvent::propagation(source, node, mask, kind);
            self.dispatch(node, &event, DispatchPhase::Handle)?;
        }
        Ok(())
    }

    /// Run the broadcast parked on `node`, if any. Resumed broadcasts do not propagate.
    pub(crate) fn resume_deferred(&self, node: NodeId) -> Result<bool> {
        let pending = self.write_tree().remove_property(node, PENDING_BROADCAST)?;
        let Some(pending) = pending.and_then(|p| p.downcast::<PendingBroadcast>().ok()) else {
            return Ok(false);
        };
        tracing::trace!(
            target: targets::BROADCAST,
            ?node,
            mask = ?pending.mask,
            "resuming parked broadcast"
        );
        self.run_broadcast(
            node,
            pending.source,
            pending.mask,
            pending.kind,
            DispatchMode::Immediate,
            false,
        )?;
        Ok(true)
    }

    /// Whether a broadcast is parked on `node`.
    pub fn has_deferred_events(&self, node: NodeId) -> Result<bool> {
        Ok(self
            .read_tree()
            .property::<PendingBroadcast>(node, PENDING_BROADCAST)?
            .is_some())
    }

    /// The broadcast parked on `node`, if any.
    pub fn pending_broadcast(&self, node: NodeId) -> Result<Option<PendingBroadcast>> {
        Ok(self
            .read_tree()
            .property::<PendingBroadcast>(node, PENDING_BROADCAST)?
            .copied())
    }

    /// Run every broadcast parked in the visible part of the subtree.
    ///
    /// Returns the number of resumed broadcasts.
    #[tracing::instrument(skip(self), target = "horizon_pm_core::broadcast", level = "trace")]
    pub fn flush_deferred_events(&self, root: NodeId) -> Result<usize> {
        let mut resumed = 0;
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if !self.contains(node) || !self.is_visible(node)? {
                continue;
            }
            if self.resume_deferred(node)? {
                resumed += 1;
            }
            stack.extend(self.children(node)?.into_iter().rev());
        }
        Ok(resumed)
    }
}
