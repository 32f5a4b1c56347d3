//! The presentation-model node tree.
//!
//! Nodes live in an arena owned by a [`Session`](crate::Session):
//! - Unique node identifiers via arena-based storage
//! - Parent-child ownership with cascade destroy
//! - Structural names and position-derived paths
//! - Dynamic (type-erased) node properties
//!
//! Every node shares its configuration with all other nodes at the same
//! structural position through an `Arc<MetaData>`; the per-instance state
//! (cache slots, listeners, attribute state, bean) is stored here.
//!
//! # Key Types
//!
//! - [`NodeId`] - Stable, generational handle of a node
//! - [`NodeKind`] - What a node represents
//! - [`PmTree`] - The arena holding all nodes of a session

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use slotmap::{new_key_type, SlotMap};

use crate::cache::CacheSlots;
use crate::command::CommandDecorator;
use crate::error::{PmError, Result};
use crate::listener::ListenerRegistry;
use crate::logging::targets;
use crate::meta::MetaData;
use crate::value::{Value, ValueChangeDecorator};

new_key_type! {
    /// A unique identifier for a node in a session's tree.
    ///
    /// `NodeId`s are generational: once the node is destroyed the id never
    /// matches another node, so a stale id reads as [`PmError::InvalidNode`].
    pub struct NodeId;
}

impl NodeId {
    /// Convert the NodeId to a raw u64 value.
    #[inline]
    pub fn as_raw(self) -> u64 {
        use slotmap::Key;
        self.data().as_ffi()
    }

    /// Create a NodeId from a raw u64 value.
    ///
    /// Note: This does not check if the node exists.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self::from(slotmap::KeyData::from_ffi(raw))
    }
}

/// What a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A scope root. Propagation stops here; broadcasts skip nested ones.
    Conversation,
    /// A wrapper around a domain bean.
    Bean,
    /// A single field with a value.
    Attribute,
    /// An executable command.
    Command,
    /// A host for factory-generated bean wrappers.
    Collection,
    /// Any other structural element.
    Element,
}

impl NodeKind {
    /// Human readable kind name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Bean => "bean",
            Self::Attribute => "attribute",
            Self::Command => "command",
            Self::Collection => "collection",
            Self::Element => "element",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write that failed validation, kept for display.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidValue {
    /// The rejected value.
    pub value: Value,
    /// Its string form as the user entered it.
    pub text: String,
}

/// Attribute value state.
#[derive(Debug, Default)]
pub(crate) struct AttributeState {
    /// The value written through the presentation model, if any.
    pub(crate) backing: Option<Value>,
    /// The value before the first change since the last reset.
    pub(crate) original: Option<Value>,
    pub(crate) changed: bool,
    pub(crate) invalid: Option<InvalidValue>,
}

/// Internal data stored in the tree for each node.
pub(crate) struct NodeData {
    pub(crate) name: String,
    /// Instance path; equals the structural path except below dynamic nodes.
    pub(crate) path: String,
    pub(crate) kind: NodeKind,
    pub(crate) meta: Arc<MetaData>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    /// Created by a bean factory rather than by the structure.
    pub(crate) dynamic: bool,
    pub(crate) properties: HashMap<String, Box<dyn Any + Send + Sync>>,
    pub(crate) cache: CacheSlots,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) attribute: AttributeState,
    pub(crate) bean: Option<Arc<dyn Any + Send + Sync>>,
    /// Whether the bean was read since it was last set.
    pub(crate) bean_accessed: bool,
    pub(crate) value_decorators: Vec<Arc<dyn ValueChangeDecorator>>,
    pub(crate) command_decorators: Vec<Arc<dyn CommandDecorator>>,
}

impl NodeData {
    pub(crate) fn new(meta: Arc<MetaData>, path: String, dynamic: bool) -> Self {
        Self {
            name: meta.name().to_string(),
            path,
            kind: meta.kind(),
            meta,
            parent: None,
            children: Vec::new(),
            dynamic,
            properties: HashMap::new(),
            cache: CacheSlots::default(),
            listeners: ListenerRegistry::new(),
            attribute: AttributeState::default(),
            bean: None,
            bean_accessed: false,
            value_decorators: Vec::new(),
            command_decorators: Vec::new(),
        }
    }
}

/// The arena that holds every node of a session.
///
/// Uses SlotMap storage for stable node IDs. Read access is public so
/// callers can inspect the structure through
/// [`Session::with_tree`](crate::Session::with_tree); mutation goes through
/// the session.
pub struct PmTree {
    nodes: SlotMap<NodeId, NodeData>,
}

impl PmTree {
    /// Create a new empty tree.
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
        }
    }

    /// Insert a node below `parent` (or as a root) and return its ID.
    pub(crate) fn insert(&mut self, mut data: NodeData, parent: Option<NodeId>) -> Result<NodeId> {
        if let Some(parent_id) = parent {
            if !self.nodes.contains_key(parent_id) {
                return Err(PmError::InvalidNode);
            }
        }
        data.parent = parent;
        let path = data.path.clone();
        let id = self.nodes.insert(data);
        if let Some(parent_id) = parent {
            if let Some(parent_data) = self.nodes.get_mut(parent_id) {
                parent_data.children.push(id);
            }
        }
        tracing::trace!(target: targets::NODE, ?id, %path, "inserted node");
        Ok(id)
    }

    /// Remove a node and all its descendants.
    #[tracing::instrument(skip(self), target = "horizon_pm_core::node", level = "trace")]
    pub(crate) fn destroy(&mut self, id: NodeId) -> Result<Vec<NodeData>> {
        let descendants = self.collect_descendants(id)?;
        tracing::trace!(
            target: targets::NODE,
            ?id,
            descendant_count = descendants.len(),
            "destroying node subtree"
        );

        if let Some(parent_id) = self.nodes.get(id).and_then(|d| d.parent) {
            if let Some(parent_data) = self.nodes.get_mut(parent_id) {
                parent_data.children.retain(|&child| child != id);
            }
        }

        // Removed data is handed back so it can be dropped outside any lock.
        let mut removed = Vec::with_capacity(descendants.len() + 1);
        for child_id in descendants {
            removed.extend(self.nodes.remove(child_id));
        }
        removed.extend(self.nodes.remove(id));
        Ok(removed)
    }

    /// Collect all descendant IDs in depth-first order (children before parents).
    fn collect_descendants(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut result = Vec::new();
        self.collect_descendants_recursive(id, &mut result)?;
        Ok(result)
    }

    fn collect_descendants_recursive(&self, id: NodeId, result: &mut Vec<NodeId>) -> Result<()> {
        let data = self.nodes.get(id).ok_or(PmError::InvalidNode)?;
        for &child_id in &data.children {
            self.collect_descendants_recursive(child_id, result)?;
            result.push(child_id);
        }
        Ok(())
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<&NodeData> {
        self.nodes.get(id).ok_or(PmError::InvalidNode)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut NodeData> {
        self.nodes.get_mut(id).ok_or(PmError::InvalidNode)
    }

    /// Check if a node exists.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Get the number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get the parent of a node.
    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>> {
        self.node(id).map(|d| d.parent)
    }

    /// Get the children of a node.
    pub fn children(&self, id: NodeId) -> Result<&[NodeId]> {
        self.node(id).map(|d| d.children.as_slice())
    }

    /// Get the node's structural name.
    pub fn name(&self, id: NodeId) -> Result<&str> {
        self.node(id).map(|d| d.name.as_str())
    }

    /// Get the node's instance path.
    pub fn path(&self, id: NodeId) -> Result<&str> {
        self.node(id).map(|d| d.path.as_str())
    }

    /// Get the node's kind.
    pub fn kind(&self, id: NodeId) -> Result<NodeKind> {
        self.node(id).map(|d| d.kind)
    }

    /// Get the node's shared meta data.
    pub fn meta(&self, id: NodeId) -> Result<&Arc<MetaData>> {
        self.node(id).map(|d| &d.meta)
    }

    /// Find a child by name (direct children only).
    pub fn find_child_by_name(&self, id: NodeId, name: &str) -> Result<Option<NodeId>> {
        let children = self.children(id)?;
        Ok(children
            .iter()
            .copied()
            .find(|&child| self.nodes.get(child).is_some_and(|d| d.name == name)))
    }

    /// Resolve a relative expression starting at `from`.
    ///
    /// Segments are separated by `/`; `..` moves to the parent and `.` stays.
    pub fn resolve_relative(&self, from: NodeId, expr: &str) -> Result<Option<NodeId>> {
        let mut current = from;
        for segment in expr.split('/') {
            match segment {
                "" | "." => {}
                ".." => match self.parent(current)? {
                    Some(parent) => current = parent,
                    None => return Ok(None),
                },
                name => match self.find_child_by_name(current, name)? {
                    Some(child) => current = child,
                    None => return Ok(None),
                },
            }
        }
        Ok(Some(current))
    }

    /// The node itself followed by its ancestors, up to and including the
    /// first conversation.
    pub fn scope_chain(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut chain = vec![id];
        let mut current = Some(id);
        while let Some(current_id) = current {
            let data = self.node(current_id)?;
            if data.kind == NodeKind::Conversation {
                break;
            }
            current = data.parent;
            if let Some(parent) = current {
                chain.push(parent);
            }
        }
        Ok(chain)
    }

    /// Perform a depth-first pre-order traversal starting from a node.
    pub fn depth_first_preorder(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut result = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let data = self.node(current)?;
            result.push(current);
            stack.extend(data.children.iter().rev().copied());
        }
        Ok(result)
    }

    /// Iterate over all root nodes (nodes with no parent).
    pub fn root_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .filter(|(_, data)| data.parent.is_none())
            .map(|(id, _)| id)
    }

    /// Set a dynamic property on a node.
    pub(crate) fn set_property<T: Any + Send + Sync>(
        &mut self,
        id: NodeId,
        name: impl Into<String>,
        value: T,
    ) -> Result<()> {
        let data = self.node_mut(id)?;
        data.properties.insert(name.into(), Box::new(value));
        Ok(())
    }

    /// Get a dynamic property of a node.
    pub fn property<T: Any>(&self, id: NodeId, name: &str) -> Result<Option<&T>> {
        let data = self.node(id)?;
        Ok(data.properties.get(name).and_then(|v| v.downcast_ref::<T>()))
    }

    /// Remove a dynamic property from a node.
    pub(crate) fn remove_property(
        &mut self,
        id: NodeId,
        name: &str,
    ) -> Result<Option<Box<dyn Any + Send + Sync>>> {
        let data = self.node_mut(id)?;
        Ok(data.properties.remove(name))
    }

    /// Get all dynamic property names of a node.
    pub fn property_names(&self, id: NodeId) -> Result<Vec<&str>> {
        let data = self.node(id)?;
        Ok(data.properties.keys().map(|s| s.as_str()).collect())
    }
}

impl Default for PmTree {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PmTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmTree").field("nodes", &self.nodes.len()).finish()
    }
}
