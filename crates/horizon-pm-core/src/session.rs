//! The presentation-model session.
//!
//! A [`Session`] owns one node tree together with the scope services its
//! nodes use: the meta-data registry, the request-scope store, the message
//! log, the command history, resources and the hooks into the view layer
//! ([`ExceptionHandler`], [`ViewConnector`]).
//!
//! # Locking
//!
//! The tree sits behind a `parking_lot::RwLock`. Locks are only held for
//! short reads and writes of node data and are always released before user
//! code (behaviors, listeners, decorators, strategies) runs, so callbacks may
//! call back into the session freely.
//!
//! # Example
//!
//! ```
//! use horizon_pm_core::{NodeDef, Session};
//!
//! let session = Session::builder().private_registry().build();
//! let form = NodeDef::conversation("LoginForm")
//!     .child(NodeDef::attribute("user").build())
//!     .build();
//! let root = session.create_root(&form).unwrap();
//! let user = session.find_child(root, "user").unwrap().unwrap();
//!
//! assert!(session.set_value(user, "alice"));
//! assert_eq!(session.value_as_string(user).unwrap(), "alice");
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::broadcast::DispatchMode;
use crate::cache::{CacheAspect, CachedValue};
use crate::definition::NodeDef;
use crate::error::{PmError, Result};
use crate::event::{ChangeKind, ChangeMask};
use crate::history::CommandHistory;
use crate::listener::PmEventListener;
use crate::logging::targets;
use crate::message::{format_text, MessageLog, PmMessage, Severity};
use crate::meta::{MetaData, MetaDataRegistry};
use crate::node::{NodeData, NodeId, NodeKind, PmTree};
use crate::value::Value;

/// A navigation target produced by a command or an error handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub target: String,
}

impl Redirect {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

/// Decides what happens when an operation on a node fails.
pub trait ExceptionHandler: Send + Sync {
    /// Handle `error`. A returned redirect is forwarded to the view connector.
    fn on_error(
        &self,
        session: &Session,
        node: Option<NodeId>,
        error: &PmError,
        navigation: Option<&str>,
    ) -> Option<Redirect>;
}

/// Logs the error, records an error message and follows `navigation`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExceptionHandler;

impl ExceptionHandler for DefaultExceptionHandler {
    fn on_error(
        &self,
        session: &Session,
        node: Option<NodeId>,
        error: &PmError,
        navigation: Option<&str>,
    ) -> Option<Redirect> {
        tracing::warn!(target: targets::SESSION, ?node, %error, "operation failed");
        session.add_message(
            node,
            Severity::Error,
            "pm.error.operation_failed",
            vec![error.to_string()],
        );
        navigation.map(Redirect::new)
    }
}

/// The view layer as seen from the session.
pub trait ViewConnector: Send + Sync {
    /// Navigate to `redirect`.
    fn redirect(&self, _redirect: &Redirect) {}

    /// Read a parameter of the current request.
    fn read_request_value(&self, _name: &str) -> Option<String> {
        None
    }
}

/// A connector without a view.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedConnector;

impl ViewConnector for DetachedConnector {}

/// Resource text lookup.
pub trait Resources: Send + Sync {
    /// The text for `key` in `locale`, if known.
    fn lookup(&self, key: &str, locale: &str) -> Option<String>;
}

/// Locale-independent resources backed by a map.
#[derive(Debug, Clone, Default)]
pub struct MapResources {
    entries: HashMap<String, String>,
}

impl MapResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry.
    pub fn with(mut self, key: impl Into<String>, text: impl Into<String>) -> Self {
        self.entries.insert(key.into(), text.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, text: impl Into<String>) {
        self.entries.insert(key.into(), text.into());
    }
}

impl Resources for MapResources {
    fn lookup(&self, key: &str, _locale: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }
}

/// Session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Locale used for resource lookup.
    pub locale: String,
    /// Time zone name handed to converters.
    pub time_zone: String,
    /// Reject equal but distinct beans in bean factories.
    pub debug_identity_checks: bool,
    /// Maximum number of undoable value changes.
    pub history_depth: usize,
    /// Maximum number of stored messages; 0 means unbounded.
    pub max_messages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            locale: "en".to_string(),
            time_zone: "UTC".to_string(),
            debug_identity_checks: cfg!(debug_assertions),
            history_depth: 100,
            max_messages: 1000,
        }
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    registry: Option<Arc<MetaDataRegistry>>,
    exception_handler: Arc<dyn ExceptionHandler>,
    connector: Arc<dyn ViewConnector>,
    resources: Arc<dyn Resources>,
}

impl SessionBuilder {
    fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            registry: None,
            exception_handler: Arc::new(DefaultExceptionHandler),
            connector: Arc::new(DetachedConnector),
            resources: Arc::new(MapResources::new()),
        }
    }

    /// Replace all settings.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.config.locale = locale.into();
        self
    }

    pub fn time_zone(mut self, time_zone: impl Into<String>) -> Self {
        self.config.time_zone = time_zone.into();
        self
    }

    pub fn debug_identity_checks(mut self, enabled: bool) -> Self {
        self.config.debug_identity_checks = enabled;
        self
    }

    pub fn history_depth(mut self, depth: usize) -> Self {
        self.config.history_depth = depth;
        self
    }

    pub fn max_messages(mut self, limit: usize) -> Self {
        self.config.max_messages = limit;
        self
    }

    /// Use `registry` instead of the global one.
    pub fn registry(mut self, registry: Arc<MetaDataRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a fresh registry owned by this session.
    pub fn private_registry(self) -> Self {
        self.registry(Arc::new(MetaDataRegistry::new()))
    }

    pub fn exception_handler(mut self, handler: impl ExceptionHandler + 'static) -> Self {
        self.exception_handler = Arc::new(handler);
        self
    }

    pub fn view_connector(mut self, connector: Arc<dyn ViewConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn resources(mut self, resources: impl Resources + 'static) -> Self {
        self.resources = Arc::new(resources);
        self
    }

    /// Build the session.
    pub fn build(self) -> Session {
        let history = CommandHistory::new(self.config.history_depth);
        let messages = MessageLog::new(self.config.max_messages);
        tracing::debug!(
            target: targets::SESSION,
            locale = %self.config.locale,
            history_depth = self.config.history_depth,
            "session created"
        );
        Session {
            inner: Arc::new(SessionInner {
                registry: self.registry.unwrap_or_else(MetaDataRegistry::global),
                config: self.config,
                tree: RwLock::new(PmTree::new()),
                request: Mutex::new(HashMap::new()),
                request_generation: AtomicU64::new(0),
                messages: Mutex::new(messages),
                history: Mutex::new(history),
                exception_handler: self.exception_handler,
                connector: self.connector,
                resources: self.resources,
                dynamic_seq: AtomicU64::new(0),
            }),
        }
    }
}

pub(crate) struct SessionInner {
    config: SessionConfig,
    registry: Arc<MetaDataRegistry>,
    tree: RwLock<PmTree>,
    request: Mutex<HashMap<String, CachedValue>>,
    request_generation: AtomicU64,
    messages: Mutex<MessageLog>,
    history: Mutex<CommandHistory>,
    exception_handler: Arc<dyn ExceptionHandler>,
    connector: Arc<dyn ViewConnector>,
    resources: Arc<dyn Resources>,
    dynamic_seq: AtomicU64,
}

/// A presentation-model session. Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// A non-owning handle to a [`Session`].
#[derive(Clone)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }
}

impl fmt::Debug for WeakSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakSession")
            .field(&(self.0.strong_count() > 0))
            .finish()
    }
}

static_assertions::assert_impl_all!(Session: Send, Sync);
static_assertions::assert_impl_all!(WeakSession: Send, Sync);

impl Session {
    /// A session with default settings and the global registry.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn locale(&self) -> &str {
        &self.inner.config.locale
    }

    pub fn time_zone(&self) -> &str {
        &self.inner.config.time_zone
    }

    pub fn registry(&self) -> &Arc<MetaDataRegistry> {
        &self.inner.registry
    }

    pub fn view_connector(&self) -> &Arc<dyn ViewConnector> {
        &self.inner.connector
    }

    // -------------------------------------------------------------------------
    // Tree access
    // -------------------------------------------------------------------------

    pub(crate) fn read_tree(&self) -> RwLockReadGuard<'_, PmTree> {
        self.inner.tree.read()
    }

    pub(crate) fn write_tree(&self) -> RwLockWriteGuard<'_, PmTree> {
        self.inner.tree.write()
    }

    pub(crate) fn inner_history(&self) -> &Mutex<CommandHistory> {
        &self.inner.history
    }

    /// Run `f` with read access to the node tree.
    ///
    /// `f` must not call back into the session.
    pub fn with_tree<R>(&self, f: impl FnOnce(&PmTree) -> R) -> R {
        f(&self.read_tree())
    }

    pub(crate) fn with_node<R>(&self, node: NodeId, f: impl FnOnce(&NodeData) -> R) -> Result<R> {
        let tree = self.read_tree();
        tree.node(node).map(f)
    }

    pub(crate) fn with_node_mut<R>(
        &self,
        node: NodeId,
        f: impl FnOnce(&mut NodeData) -> R,
    ) -> Result<R> {
        let mut tree = self.write_tree();
        tree.node_mut(node).map(f)
    }

    /// Instance path for diagnostics; destroyed nodes render as `<destroyed>`.
    pub(crate) fn node_path(&self, node: NodeId) -> String {
        self.with_node(node, |d| d.path.clone())
            .unwrap_or_else(|_| "<destroyed>".to_string())
    }

    pub(crate) fn ensure_kind(
        &self,
        node: NodeId,
        kind: NodeKind,
        expected: &'static str,
    ) -> Result<()> {
        let (actual, path) = self.with_node(node, |d| (d.kind, d.path.clone()))?;
        if actual == kind {
            Ok(())
        } else {
            Err(PmError::WrongKind { path, expected })
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.read_tree().contains(node)
    }

    pub fn meta(&self, node: NodeId) -> Result<Arc<MetaData>> {
        self.with_node(node, |d| d.meta.clone())
    }

    pub fn path(&self, node: NodeId) -> Result<String> {
        self.with_node(node, |d| d.path.clone())
    }

    pub fn name(&self, node: NodeId) -> Result<String> {
        self.with_node(node, |d| d.name.clone())
    }

    pub fn kind(&self, node: NodeId) -> Result<NodeKind> {
        self.with_node(node, |d| d.kind)
    }

    pub fn parent(&self, node: NodeId) -> Result<Option<NodeId>> {
        self.with_node(node, |d| d.parent)
    }

    pub fn children(&self, node: NodeId) -> Result<Vec<NodeId>> {
        self.with_node(node, |d| d.children.clone())
    }

    /// Find a direct child by name.
    pub fn find_child(&self, node: NodeId, name: &str) -> Result<Option<NodeId>> {
        self.read_tree().find_child_by_name(node, name)
    }

    /// Resolve a `/`-separated relative path (`..` moves up).
    pub fn find(&self, from: NodeId, expr: &str) -> Result<Option<NodeId>> {
        self.read_tree().resolve_relative(from, expr)
    }

    // -------------------------------------------------------------------------
    // Node lifecycle
    // -------------------------------------------------------------------------

    /// Resolve the meta data of `def` below the structural path `parent_path`.
    pub fn resolve_meta_data(
        &self,
        parent_path: &str,
        def: &Arc<NodeDef>,
    ) -> Result<Arc<MetaData>> {
        self.inner.registry.resolve(parent_path, def)
    }

    /// Create a root node and its fixed subtree.
    ///
    /// Fails with a configuration error if a root with the same instance
    /// path already exists in this session.
    pub fn create_root(&self, def: &Arc<NodeDef>) -> Result<NodeId> {
        let meta = self.resolve_meta_data("", def)?;
        let path = meta.path().to_string();
        self.create_subtree(meta, path, None, false)
    }

    /// Create a fixed child and its subtree below `parent`.
    pub fn add_child(&self, parent: NodeId, def: &Arc<NodeDef>) -> Result<NodeId> {
        let (parent_meta, parent_path) =
            self.with_node(parent, |d| (d.meta.clone(), d.path.clone()))?;
        let meta = self.resolve_meta_data(parent_meta.path(), def)?;
        if self.find_child(parent, meta.name())?.is_some() {
            return Err(PmError::config(format!(
                "'{parent_path}' already has a child named '{}'",
                meta.name()
            )));
        }
        let path = format!("{parent_path}/{}", meta.name());
        let id = self.create_subtree(meta, path, Some(parent), false)?;
        self.broadcast(
            parent,
            ChangeMask::CHILD_NODES,
            ChangeKind::Other,
            DispatchMode::Immediate,
        )?;
        Ok(id)
    }

    /// Create a factory-generated child below `parent`.
    ///
    /// Dynamic nodes share the meta data of their structural position; their
    /// instance path carries a sequence number.
    pub(crate) fn add_dynamic_child(&self, parent: NodeId, def: &Arc<NodeDef>) -> Result<NodeId> {
        let (parent_meta, parent_path) =
            self.with_node(parent, |d| (d.meta.clone(), d.path.clone()))?;
        let meta = self.resolve_meta_data(parent_meta.path(), def)?;
        let seq = self.inner.dynamic_seq.fetch_add(1, Ordering::Relaxed);
        let path = format!("{parent_path}/{}[{seq}]", meta.name());
        let id = self.create_subtree(meta, path, Some(parent), true)?;
        self.broadcast(
            parent,
            ChangeMask::CHILD_NODES,
            ChangeKind::Other,
            DispatchMode::Immediate,
        )?;
        Ok(id)
    }

    fn create_subtree(
        &self,
        meta: Arc<MetaData>,
        path: String,
        parent: Option<NodeId>,
        dynamic: bool,
    ) -> Result<NodeId> {
        let created = {
            let mut tree = self.write_tree();
            // Instance paths key request-scoped caches, so roots must not share one.
            let duplicate = parent.is_none()
                && tree.root_nodes().any(|r| tree.path(r).is_ok_and(|p| p == path));
            if duplicate {
                return Err(PmError::config(format!("a root at '{path}' already exists")));
            }
            let mut created = Vec::new();
            let mut pending = vec![(meta, path, parent, dynamic)];
            while let Some((meta, path, parent, dynamic)) = pending.pop() {
                let children = meta.children().to_vec();
                let id = tree.insert(NodeData::new(meta, path.clone(), dynamic), parent)?;
                created.push(id);
                for child in children.into_iter().rev() {
                    let child_path = format!("{path}/{}", child.name());
                    pending.push((child, child_path, Some(id), false));
                }
            }
            created
        };
        let Some(&root) = created.first() else {
            return Err(PmError::InvalidNode);
        };

        if let Err(err) = self.init_nodes(&created) {
            tracing::debug!(target: targets::SESSION, error = %err, "node initialization failed");
            if let Err(cleanup) = self.destroy_node(root) {
                tracing::trace!(
                    target: targets::SESSION,
                    error = %cleanup,
                    "cleanup of partial subtree failed"
                );
            }
            return Err(err);
        }
        tracing::debug!(
            target: targets::SESSION,
            node = ?root,
            count = created.len(),
            "created subtree"
        );
        Ok(root)
    }

    /// Register configured listeners and cascade-clear observers.
    fn init_nodes(&self, nodes: &[NodeId]) -> Result<()> {
        for &node in nodes {
            let meta = self.meta(node)?;
            for (mask, factory) in meta.listener_factories() {
                self.register_listener(node, *mask, factory(), true)?;
            }
        }
        for &node in nodes {
            self.register_cache_observers(node)?;
        }
        Ok(())
    }

    /// Destroy a node and its subtree.
    pub fn destroy_node(&self, node: NodeId) -> Result<()> {
        let (removed, parent) = {
            let mut tree = self.write_tree();
            let parent = tree.parent(node)?;
            (tree.destroy(node)?, parent)
        };
        {
            let mut request = self.inner.request.lock();
            let mut messages = self.inner.messages.lock();
            for data in &removed {
                let suffix = format!(":{}", data.path);
                request.retain(|key, _| !key.ends_with(&suffix));
            }
            for id in removed_ids(&removed, node) {
                messages.clear(Some(id));
            }
        }
        tracing::debug!(
            target: targets::SESSION,
            ?node,
            count = removed.len(),
            "destroyed subtree"
        );
        // Node data may own bean handles and listeners; dropped after the locks.
        drop(removed);

        if let Some(parent) = parent {
            if self.contains(parent) {
                self.broadcast(
                    parent,
                    ChangeMask::CHILD_NODES,
                    ChangeKind::Other,
                    DispatchMode::Immediate,
                )?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Aspects
    // -------------------------------------------------------------------------

    /// Display title.
    pub fn title(&self, node: NodeId) -> Result<String> {
        self.cached_aspect(node, CacheAspect::Title, || {
            let meta = self.meta(node)?;
            Ok(meta
                .behavior()
                .title(self, node)
                .or_else(|| self.resource(meta.title_key()))
                .unwrap_or_else(|| meta.title_key().to_string()))
        })
    }

    /// Tooltip, if any.
    pub fn tooltip(&self, node: NodeId) -> Result<Option<String>> {
        self.cached_aspect(node, CacheAspect::Tooltip, || {
            let meta = self.meta(node)?;
            Ok(meta
                .behavior()
                .tooltip(self, node)
                .or_else(|| self.resource(&format!("{}_tooltip", meta.title_key()))))
        })
    }

    pub fn is_visible(&self, node: NodeId) -> Result<bool> {
        self.cached_aspect(node, CacheAspect::Visibility, || {
            Ok(self.meta(node)?.behavior().is_visible(self, node))
        })
    }

    /// Effective enablement: the node and all its ancestors are enabled.
    pub fn is_enabled(&self, node: NodeId) -> Result<bool> {
        self.cached_aspect(node, CacheAspect::Enablement, || {
            if !self.meta(node)?.behavior().is_enabled(self, node) {
                return Ok(false);
            }
            match self.parent(node)? {
                Some(parent) => self.is_enabled(parent),
                None => Ok(true),
            }
        })
    }

    /// Selectable options of an attribute.
    pub fn options(&self, node: NodeId) -> Result<Vec<Value>> {
        self.cached_aspect(node, CacheAspect::Options, || {
            Ok(self.meta(node)?.behavior().options(self, node))
        })
    }

    /// Child nodes as exposed to the view.
    pub fn child_nodes(&self, node: NodeId) -> Result<Vec<NodeId>> {
        self.cached_aspect(node, CacheAspect::ChildNodes, || self.children(node))
    }

    // -------------------------------------------------------------------------
    // Beans
    // -------------------------------------------------------------------------

    /// Replace the bean behind a node.
    ///
    /// Broadcasts a reload in deferred mode: subtrees configured to defer
    /// event handling are only updated once their bean is read.
    pub fn set_bean<B: Any + Send + Sync>(&self, node: NodeId, bean: Arc<B>) -> Result<()> {
        self.attach_bean(node, bean)?;
        self.broadcast(
            node,
            ChangeMask::ALL_ASPECTS | ChangeMask::BEAN,
            ChangeKind::Reload,
            DispatchMode::Deferred,
        )?;
        Ok(())
    }

    pub(crate) fn attach_bean<B: Any + Send + Sync>(
        &self,
        node: NodeId,
        bean: Arc<B>,
    ) -> Result<()> {
        let bean: Arc<dyn Any + Send + Sync> = bean;
        self.with_node_mut(node, |d| {
            d.bean = Some(bean);
            d.bean_accessed = false;
        })
    }

    /// The bean behind a node, if it is of type `B`.
    ///
    /// Reading the bean runs a broadcast parked for this node.
    pub fn bean<B: Any + Send + Sync>(&self, node: NodeId) -> Result<Option<Arc<B>>> {
        Ok(self
            .bean_any(node)?
            .and_then(|bean| bean.downcast::<B>().ok()))
    }

    /// The bean behind a node, type-erased.
    pub fn bean_any(&self, node: NodeId) -> Result<Option<Arc<dyn Any + Send + Sync>>> {
        self.with_node_mut(node, |d| d.bean_accessed = true)?;
        self.resume_deferred(node)?;
        self.with_node(node, |d| d.bean.clone())
    }

    // -------------------------------------------------------------------------
    // Listeners
    // -------------------------------------------------------------------------

    /// Register a listener on a node.
    ///
    /// With `owning` the node keeps the listener alive; otherwise the
    /// registration ends when the caller drops its last reference.
    pub fn register_listener(
        &self,
        node: NodeId,
        mask: ChangeMask,
        listener: Arc<dyn PmEventListener>,
        owning: bool,
    ) -> Result<()> {
        self.with_node_mut(node, |d| {
            if owning {
                d.listeners.add_listener_ref(mask, listener);
            } else {
                d.listeners.add_weak_listener_ref(mask, &listener);
            }
        })?;
        tracing::trace!(target: targets::LISTENER, ?node, ?mask, owning, "registered listener");
        Ok(())
    }

    /// Remove a listener from a node; returns the number of registrations left.
    pub fn unregister_listener(
        &self,
        node: NodeId,
        listener: &Arc<dyn PmEventListener>,
    ) -> Result<usize> {
        self.with_node_mut(node, |d| d.listeners.remove_listener_ref(listener))
    }

    // -------------------------------------------------------------------------
    // Request scope
    // -------------------------------------------------------------------------

    /// Start a new request: request-scoped values and request-bound caches expire.
    pub fn begin_request(&self) {
        self.inner.request.lock().clear();
        let generation = self.inner.request_generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(target: targets::SESSION, generation, "request started");
    }

    /// End the current request.
    pub fn end_request(&self) {
        self.inner.request.lock().clear();
    }

    pub fn request_generation(&self) -> u64 {
        self.inner.request_generation.load(Ordering::Acquire)
    }

    pub fn request_value(&self, key: &str) -> Option<CachedValue> {
        self.inner.request.lock().get(key).cloned()
    }

    pub fn set_request_value(&self, key: impl Into<String>, value: CachedValue) {
        self.inner.request.lock().insert(key.into(), value);
    }

    pub fn remove_request_value(&self, key: &str) -> Option<CachedValue> {
        self.inner.request.lock().remove(key)
    }

    // -------------------------------------------------------------------------
    // Messages, resources, errors
    // -------------------------------------------------------------------------

    /// Resource text of `key` in the session locale.
    pub fn resource(&self, key: &str) -> Option<String> {
        self.inner.resources.lookup(key, &self.inner.config.locale)
    }

    /// Add a message. The text is the resource of `key` (or `key` itself)
    /// with `{n}` placeholders replaced by `args`.
    pub fn add_message(
        &self,
        node: Option<NodeId>,
        severity: Severity,
        key: impl Into<String>,
        args: Vec<String>,
    ) {
        let key = key.into();
        let template = self.resource(&key).unwrap_or_else(|| key.clone());
        let text = format_text(&template, &args);
        tracing::debug!(target: targets::SESSION, ?node, %severity, %key, "message added");
        self.inner.messages.lock().push(PmMessage {
            node,
            severity,
            key,
            args,
            text,
        });
    }

    pub fn messages(&self) -> Vec<PmMessage> {
        self.inner.messages.lock().all()
    }

    pub fn messages_for(&self, node: NodeId) -> Vec<PmMessage> {
        self.inner.messages.lock().for_node(node)
    }

    /// Clear the messages of one node, or all messages with `None`.
    pub fn clear_messages(&self, node: Option<NodeId>) {
        self.inner.messages.lock().clear(node);
    }

    /// Route an error to the exception handler and forward its redirect.
    pub fn handle_error(
        &self,
        node: Option<NodeId>,
        error: &PmError,
        navigation: Option<&str>,
    ) -> Option<Redirect> {
        let handler = self.inner.exception_handler.clone();
        let redirect = handler.on_error(self, node, error, navigation);
        if let Some(redirect) = &redirect {
            self.inner.connector.redirect(redirect);
        }
        redirect
    }
}

fn removed_ids(removed: &[NodeData], root: NodeId) -> Vec<NodeId> {
    // Children of removed nodes are removed too; their ids are recorded in
    // the parents' child lists.
    let mut ids = vec![root];
    for data in removed {
        ids.extend(data.children.iter().copied());
    }
    ids
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("nodes", &self.read_tree().len())
            .field("locale", &self.inner.config.locale)
            .field("request_generation", &self.request_generation())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NodeBehavior;
    use std::sync::atomic::AtomicUsize;

    fn session() -> Session {
        Session::builder().private_registry().build()
    }

    #[test]
    fn create_root_builds_fixed_subtree() {
        let session = session();
        let def = NodeDef::conversation("Order")
            .child(
                NodeDef::element("Address")
                    .name("billing")
                    .child(NodeDef::attribute("city").build())
                    .build(),
            )
            .build();
        let root = session.create_root(&def).unwrap();
        let city = session.find(root, "billing/city").unwrap().unwrap();

        assert_eq!(session.path(city).unwrap(), "Order/billing/city");
        assert_eq!(session.kind(city).unwrap(), NodeKind::Attribute);
        assert_eq!(session.find(city, "../..").unwrap(), Some(root));
    }

    #[test]
    fn duplicate_child_name_is_rejected() {
        let session = session();
        let root = session
            .create_root(&NodeDef::conversation("Shop").build())
            .unwrap();
        let def = NodeDef::attribute("name").build();
        session.add_child(root, &def).unwrap();
        assert!(session.add_child(root, &def).unwrap_err().is_config_error());
    }

    #[test]
    fn title_uses_resources_then_key() {
        let session = Session::builder()
            .private_registry()
            .resources(MapResources::new().with("Order.customer", "Customer"))
            .build();
        let def = NodeDef::conversation("Order")
            .child(NodeDef::attribute("customer").build())
            .child(NodeDef::attribute("note").build())
            .build();
        let root = session.create_root(&def).unwrap();
        let customer = session.find_child(root, "customer").unwrap().unwrap();
        let note = session.find_child(root, "note").unwrap().unwrap();

        assert_eq!(session.title(customer).unwrap(), "Customer");
        assert_eq!(session.title(note).unwrap(), "Order.note");
        assert_eq!(session.tooltip(note).unwrap(), None);
    }

    #[test]
    fn enablement_follows_parent() {
        struct Disabled;
        impl NodeBehavior for Disabled {
            fn is_enabled(&self, _session: &Session, _node: NodeId) -> bool {
                false
            }
        }

        let session = session();
        let def = NodeDef::conversation("Form")
            .child(
                NodeDef::element("Panel")
                    .behavior(Disabled)
                    .child(NodeDef::attribute("field").build())
                    .build(),
            )
            .build();
        let root = session.create_root(&def).unwrap();
        let field = session.find(root, "Panel/field").unwrap().unwrap();

        assert!(session.is_enabled(root).unwrap());
        assert!(!session.is_enabled(field).unwrap());
    }

    #[test]
    fn request_scope_is_cleared_between_requests() {
        let session = session();
        session.set_request_value("k", Arc::new(1u32));
        assert!(session.request_value("k").is_some());

        session.begin_request();
        assert!(session.request_value("k").is_none());
        assert_eq!(session.request_generation(), 1);
    }

    #[test]
    fn handle_error_forwards_redirect() {
        #[derive(Default)]
        struct Recorder(AtomicUsize);
        impl ViewConnector for Recorder {
            fn redirect(&self, _redirect: &Redirect) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let connector = Arc::new(Recorder::default());
        let session = Session::builder()
            .private_registry()
            .view_connector(connector.clone())
            .build();

        let redirect = session.handle_error(None, &PmError::InvalidNode, Some("error-page"));
        assert_eq!(redirect, Some(Redirect::new("error-page")));
        assert_eq!(connector.0.load(Ordering::SeqCst), 1);
        assert_eq!(session.messages().len(), 1);
    }

    #[test]
    fn messages_use_resource_text() {
        let session = Session::builder()
            .private_registry()
            .resources(MapResources::new().with("pm.validation.required", "{0} is required"))
            .build();
        session.add_message(None, Severity::Error, "pm.validation.required", vec!["Name".into()]);

        let messages = session.messages();
        assert_eq!(messages[0].text, "Name is required");
        session.clear_messages(None);
        assert!(session.messages().is_empty());
    }

    #[test]
    fn destroy_node_removes_subtree_and_updates_parent() {
        let session = session();
        let def = NodeDef::conversation("Order")
            .child(
                NodeDef::element("Lines")
                    .child(NodeDef::attribute("count").build())
                    .build(),
            )
            .build();
        let root = session.create_root(&def).unwrap();
        let lines = session.find_child(root, "Lines").unwrap().unwrap();
        let count = session.find_child(lines, "count").unwrap().unwrap();
        session.add_message(Some(count), Severity::Info, "note", Vec::new());

        assert_eq!(session.child_nodes(root).unwrap(), vec![lines]);
        session.destroy_node(lines).unwrap();
        assert!(!session.contains(count));
        assert!(session.child_nodes(root).unwrap().is_empty());
        assert!(session.messages_for(count).is_empty());
    }
}
