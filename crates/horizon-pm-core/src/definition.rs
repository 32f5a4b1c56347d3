//! Node definitions.
//!
//! A [`NodeDef`] declares one structural node position: its kind, declared
//! type, optional name, configuration sources, behavior, fixed children and
//! listener factories. Definitions are turned into shared
//! [`MetaData`](crate::MetaData) by the [`MetaDataRegistry`](crate::MetaDataRegistry).
//!
//! # Example
//!
//! ```
//! use horizon_pm_core::{CacheAspect, CacheDecl, NodeDef};
//!
//! let order = NodeDef::conversation("Order")
//!     .child(NodeDef::attribute("customer").required().build())
//!     .child(
//!         NodeDef::attribute("city")
//!             .cache(CacheAspect::Options, CacheDecl::on().observe("country"))
//!             .build(),
//!     )
//!     .child(NodeDef::attribute("country").build())
//!     .build();
//! assert_eq!(order.children().len(), 3);
//! ```

use std::fmt;
use std::sync::Arc;

use crate::cache::CacheAspect;
use crate::command::CommandBehavior;
use crate::config::{CacheDecl, ConfigSource, NodeConfig, ValidationTiming};
use crate::error::Result;
use crate::event::ChangeMask;
use crate::listener::PmEventListener;
use crate::message::ValidationError;
use crate::node::{NodeId, NodeKind};
use crate::session::Session;
use crate::value::{Validator, Value};

/// Type-specific behavior of a node.
///
/// Every method has a neutral default, so implementations only override what
/// their node type needs.
pub trait NodeBehavior: Send + Sync {
    /// Title text. `None` looks up the title resource key.
    fn title(&self, _session: &Session, _node: NodeId) -> Option<String> {
        None
    }

    /// Tooltip text. `None` looks up `<title key>_tooltip`.
    fn tooltip(&self, _session: &Session, _node: NodeId) -> Option<String> {
        None
    }

    fn is_visible(&self, _session: &Session, _node: NodeId) -> bool {
        true
    }

    /// Own enablement; the effective state also requires an enabled parent.
    fn is_enabled(&self, _session: &Session, _node: NodeId) -> bool {
        true
    }

    fn is_read_only(&self, _session: &Session, _node: NodeId) -> bool {
        false
    }

    /// Selectable options of an attribute.
    fn options(&self, _session: &Session, _node: NodeId) -> Vec<Value> {
        Vec::new()
    }

    /// Called before an attribute value is written. Returning `false` vetoes
    /// the write.
    fn before_change(
        &self,
        _session: &Session,
        _node: NodeId,
        _old: &Value,
        _new: &Value,
    ) -> Result<bool> {
        Ok(true)
    }

    /// Called after an attribute value was written.
    fn after_change(
        &self,
        _session: &Session,
        _node: NodeId,
        _old: &Value,
        _new: &Value,
    ) -> Result<()> {
        Ok(())
    }

    /// Type-specific value validation, run before the configured validators.
    fn validate(
        &self,
        _session: &Session,
        _node: NodeId,
        _value: &Value,
    ) -> std::result::Result<(), ValidationError> {
        Ok(())
    }
}

/// Behavior with every default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBehavior;

impl NodeBehavior for DefaultBehavior {}

/// Creates one listener per node instance.
pub type ListenerFactory = Arc<dyn Fn() -> Arc<dyn PmEventListener> + Send + Sync>;

/// Declaration of a structural node position.
pub struct NodeDef {
    kind: NodeKind,
    type_name: String,
    name: Option<String>,
    sources: Vec<Arc<dyn ConfigSource>>,
    behavior: Arc<dyn NodeBehavior>,
    command: Option<Arc<dyn CommandBehavior>>,
    children: Vec<Arc<NodeDef>>,
    listeners: Vec<(ChangeMask, ListenerFactory)>,
    validators: Vec<Arc<dyn Validator>>,
}

impl NodeDef {
    fn builder(kind: NodeKind, type_name: impl Into<String>) -> NodeDefBuilder {
        NodeDefBuilder {
            def: NodeDef {
                kind,
                type_name: type_name.into(),
                name: None,
                sources: Vec::new(),
                behavior: Arc::new(DefaultBehavior),
                command: None,
                children: Vec::new(),
                listeners: Vec::new(),
                validators: Vec::new(),
            },
            inline: NodeConfig::new(),
        }
    }

    /// A scope root of the given type.
    pub fn conversation(type_name: impl Into<String>) -> NodeDefBuilder {
        Self::builder(NodeKind::Conversation, type_name)
    }

    /// A structural element of the given type.
    pub fn element(type_name: impl Into<String>) -> NodeDefBuilder {
        Self::builder(NodeKind::Element, type_name)
    }

    /// A wrapper for beans of the given type.
    pub fn bean(type_name: impl Into<String>) -> NodeDefBuilder {
        Self::builder(NodeKind::Bean, type_name)
    }

    /// A named attribute.
    pub fn attribute(name: impl Into<String>) -> NodeDefBuilder {
        Self::builder(NodeKind::Attribute, "Attribute").name(name)
    }

    /// A named host for bean wrappers.
    pub fn collection(name: impl Into<String>) -> NodeDefBuilder {
        Self::builder(NodeKind::Collection, "Collection").name(name)
    }

    /// A named command.
    pub fn command(
        name: impl Into<String>,
        behavior: impl CommandBehavior + 'static,
    ) -> NodeDefBuilder {
        let mut builder = Self::builder(NodeKind::Command, "Command").name(name);
        builder.def.command = Some(Arc::new(behavior));
        builder
    }

    /// Node kind.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Declared type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Declared name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The name used in paths: the declared name, or the type name.
    pub fn path_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.type_name)
    }

    /// Configuration sources in application order.
    pub fn sources(&self) -> &[Arc<dyn ConfigSource>] {
        &self.sources
    }

    pub fn behavior(&self) -> &Arc<dyn NodeBehavior> {
        &self.behavior
    }

    pub fn command_behavior(&self) -> Option<&Arc<dyn CommandBehavior>> {
        self.command.as_ref()
    }

    /// Definitions of the fixed children.
    pub fn children(&self) -> &[Arc<NodeDef>] {
        &self.children
    }

    pub fn listener_factories(&self) -> &[(ChangeMask, ListenerFactory)] {
        &self.listeners
    }

    pub fn validators(&self) -> &[Arc<dyn Validator>] {
        &self.validators
    }
}

impl fmt::Debug for NodeDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDef")
            .field("kind", &self.kind)
            .field("type_name", &self.type_name)
            .field("name", &self.name)
            .field("sources", &self.sources.len())
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`NodeDef`].
///
/// Inline configuration set through the builder is applied after every
/// explicitly added [`ConfigSource`].
pub struct NodeDefBuilder {
    def: NodeDef,
    inline: NodeConfig,
}

impl NodeDefBuilder {
    /// Set the structural name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.def.name = Some(name.into());
        self
    }

    /// Override the declared type name.
    pub fn type_name(mut self, type_name: impl Into<String>) -> Self {
        self.def.type_name = type_name.into();
        self
    }

    /// Add a configuration source.
    pub fn source(mut self, source: impl ConfigSource + 'static) -> Self {
        self.def.sources.push(Arc::new(source));
        self
    }

    /// Declare the cache of one aspect.
    pub fn cache(mut self, aspect: CacheAspect, decl: CacheDecl) -> Self {
        self.inline.cache.insert(aspect, decl);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.inline.read_only = Some(true);
        self
    }

    pub fn validation(mut self, timing: ValidationTiming) -> Self {
        self.inline.validation = Some(timing);
        self
    }

    /// Park broadcasts for this node until its bean is read.
    pub fn defer_events(mut self) -> Self {
        self.inline.defer_events = Some(true);
        self
    }

    pub fn title_key(mut self, key: impl Into<String>) -> Self {
        self.inline.title_key = Some(key.into());
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.inline.default_value = Some(value.into());
        self
    }

    /// Use a request parameter as default value.
    pub fn request_default(mut self, param: impl Into<String>) -> Self {
        self.inline.request_default = Some(param.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.inline.required = Some(true);
        self
    }

    pub fn behavior(mut self, behavior: impl NodeBehavior + 'static) -> Self {
        self.def.behavior = Arc::new(behavior);
        self
    }

    /// Add a fixed child.
    pub fn child(mut self, child: Arc<NodeDef>) -> Self {
        self.def.children.push(child);
        self
    }

    /// Register a listener on every instance of this node.
    pub fn listener<F>(mut self, mask: ChangeMask, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn PmEventListener> + Send + Sync + 'static,
    {
        self.def.listeners.push((mask, Arc::new(factory)));
        self
    }

    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.def.validators.push(Arc::new(validator));
        self
    }

    /// Finish the definition.
    pub fn build(mut self) -> Arc<NodeDef> {
        if self.inline != NodeConfig::default() {
            self.def.sources.push(Arc::new(self.inline));
        }
        Arc::new(self.def)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_name_prefers_declared_name() {
        let unnamed = NodeDef::element("Address").build();
        let named = NodeDef::element("Address").name("billing").build();
        assert_eq!(unnamed.path_name(), "Address");
        assert_eq!(named.path_name(), "billing");
    }

    #[test]
    fn inline_config_is_last_source() {
        let def = NodeDef::attribute("city")
            .source(NodeConfig::new().with_read_only(true))
            .title_key("city.title")
            .build();
        assert_eq!(def.sources().len(), 2);

        let mut config = NodeConfig::new();
        for source in def.sources() {
            source.apply(&mut config).unwrap();
        }
        assert_eq!(config.read_only, Some(true));
        assert_eq!(config.title_key.as_deref(), Some("city.title"));
    }

    #[test]
    fn empty_inline_config_adds_no_source() {
        let def = NodeDef::attribute("name").build();
        assert!(def.sources().is_empty());
        assert_eq!(def.kind(), NodeKind::Attribute);
    }
}
