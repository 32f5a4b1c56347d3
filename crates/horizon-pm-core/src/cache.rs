//! Per-aspect cache strategies.
//!
//! Every derived aspect of a node (value, options, title, tooltip,
//! visibility, enablement, child nodes) is read through the
//! [`CacheStrategy`] its meta data selected for it:
//!
//! - [`NoCache`] recomputes on every read.
//! - [`LocalCache`] keeps the value in the node's own slot, optionally only
//!   for the duration of the current request.
//! - [`ScopedCache`] keeps the value in the session's request-scope store.
//!
//! A cached `None` (for example a missing tooltip) is a hit; only an empty
//! slot is a miss.
//!
//! # Cascade clears
//!
//! An aspect may observe other nodes. The observing node owns a
//! [`CacheObserver`] listener, stored as one of its properties, and registers
//! it weakly on each observed node. Value changes of an observed node clear
//! the observed aspects of the observer; once the observer is destroyed the
//! weak registration is dead and skipped.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::config::{CacheClear, CacheDecl, CacheMode};
use crate::error::{PmError, Result};
use crate::event::{ChangeMask, PmEvent};
use crate::listener::PmEventListener;
use crate::logging::targets;
use crate::node::NodeId;
use crate::session::Session;

/// A cached aspect value.
pub type CachedValue = Arc<dyn Any + Send + Sync>;

/// The aspects of a node that can be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheAspect {
    Value,
    Options,
    Title,
    Tooltip,
    Visibility,
    Enablement,
    ChildNodes,
}

impl CacheAspect {
    /// Number of aspects.
    pub const COUNT: usize = 7;

    /// Every aspect, in slot order.
    pub const ALL: [CacheAspect; Self::COUNT] = [
        Self::Value,
        Self::Options,
        Self::Title,
        Self::Tooltip,
        Self::Visibility,
        Self::Enablement,
        Self::ChildNodes,
    ];

    /// Slot index of the aspect.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Short tag used in request-scope keys and diagnostics.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Options => "options",
            Self::Title => "title",
            Self::Tooltip => "tooltip",
            Self::Visibility => "visibility",
            Self::Enablement => "enablement",
            Self::ChildNodes => "child_nodes",
        }
    }

    /// The event mask bit that invalidates this aspect.
    pub fn mask(self) -> ChangeMask {
        match self {
            Self::Value => ChangeMask::VALUE,
            Self::Options => ChangeMask::OPTIONS,
            Self::Title => ChangeMask::TITLE,
            Self::Tooltip => ChangeMask::TOOLTIP,
            Self::Visibility => ChangeMask::VISIBILITY,
            Self::Enablement => ChangeMask::ENABLEMENT,
            Self::ChildNodes => ChangeMask::CHILD_NODES,
        }
    }

    /// The aspects invalidated by an event mask.
    pub fn for_mask(mask: ChangeMask) -> impl Iterator<Item = CacheAspect> {
        Self::ALL
            .into_iter()
            .filter(move |aspect| mask.intersects(aspect.mask()))
    }
}

impl fmt::Display for CacheAspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

struct CacheEntry {
    value: CachedValue,
    generation: u64,
}

/// Local cache slots of one node.
#[derive(Default)]
pub(crate) struct CacheSlots {
    slots: [Option<CacheEntry>; CacheAspect::COUNT],
}

impl CacheSlots {
    /// Read a slot. With `generation` set, entries of older requests miss.
    pub(crate) fn get(&self, aspect: CacheAspect, generation: Option<u64>) -> Option<CachedValue> {
        let entry = self.slots[aspect.index()].as_ref()?;
        match generation {
            Some(current) if entry.generation != current => None,
            _ => Some(entry.value.clone()),
        }
    }

    pub(crate) fn set(&mut self, aspect: CacheAspect, value: CachedValue, generation: u64) {
        self.slots[aspect.index()] = Some(CacheEntry { value, generation });
    }

    pub(crate) fn clear(&mut self, aspect: CacheAspect) {
        self.slots[aspect.index()] = None;
    }

    pub(crate) fn is_set(&self, aspect: CacheAspect) -> bool {
        self.slots[aspect.index()].is_some()
    }
}

/// Storage policy of one aspect.
pub trait CacheStrategy: Send + Sync + fmt::Debug {
    /// Strategy name for diagnostics.
    fn name(&self) -> &'static str;

    /// The cached value, `None` on a miss.
    fn get_cached_value(&self, session: &Session, node: NodeId) -> Option<CachedValue>;

    /// Store `value` (if the strategy caches at all) and return it.
    fn set_and_return_cached_value(
        &self,
        session: &Session,
        node: NodeId,
        value: CachedValue,
    ) -> CachedValue;

    /// Drop the cached value.
    fn clear(&self, session: &Session, node: NodeId);
}

/// Never caches.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl CacheStrategy for NoCache {
    fn name(&self) -> &'static str {
        "none"
    }

    fn get_cached_value(&self, _session: &Session, _node: NodeId) -> Option<CachedValue> {
        None
    }

    fn set_and_return_cached_value(
        &self,
        _session: &Session,
        _node: NodeId,
        value: CachedValue,
    ) -> CachedValue {
        value
    }

    fn clear(&self, _session: &Session, _node: NodeId) {}
}

/// Caches in the node's own slot.
#[derive(Debug, Clone, Copy)]
pub struct LocalCache {
    aspect: CacheAspect,
    clear: CacheClear,
}

impl LocalCache {
    pub fn new(aspect: CacheAspect, clear: CacheClear) -> Self {
        Self { aspect, clear }
    }

    fn generation_filter(&self, session: &Session) -> Option<u64> {
        match self.clear {
            CacheClear::Never => None,
            CacheClear::OnRequest => Some(session.request_generation()),
        }
    }
}

impl CacheStrategy for LocalCache {
    fn name(&self) -> &'static str {
        match self.clear {
            CacheClear::Never => "local",
            CacheClear::OnRequest => "local-request",
        }
    }

    fn get_cached_value(&self, session: &Session, node: NodeId) -> Option<CachedValue> {
        let generation = self.generation_filter(session);
        session
            .with_node(node, |d| d.cache.get(self.aspect, generation))
            .ok()
            .flatten()
    }

    fn set_and_return_cached_value(
        &self,
        session: &Session,
        node: NodeId,
        value: CachedValue,
    ) -> CachedValue {
        let generation = session.request_generation();
        let stored = value.clone();
        if session
            .with_node_mut(node, |d| d.cache.set(self.aspect, stored, generation))
            .is_err()
        {
            tracing::trace!(
                target: targets::CACHE,
                ?node,
                aspect = %self.aspect,
                "cache write for destroyed node ignored"
            );
        }
        value
    }

    fn clear(&self, session: &Session, node: NodeId) {
        if session.with_node_mut(node, |d| d.cache.clear(self.aspect)).is_err() {
            tracing::trace!(
                target: targets::CACHE,
                ?node,
                aspect = %self.aspect,
                "clear for destroyed node ignored"
            );
        }
    }
}

/// Caches in the session's request-scope store.
#[derive(Debug, Clone, Copy)]
pub struct ScopedCache {
    aspect: CacheAspect,
}

impl ScopedCache {
    pub fn new(aspect: CacheAspect) -> Self {
        Self { aspect }
    }

    /// Request-scope key: `<tag>:<instance path>`.
    fn key(&self, session: &Session, node: NodeId) -> Option<String> {
        session
            .with_node(node, |d| format!("{}:{}", self.aspect.tag(), d.path))
            .ok()
    }
}

impl CacheStrategy for ScopedCache {
    fn name(&self) -> &'static str {
        "request"
    }

    fn get_cached_value(&self, session: &Session, node: NodeId) -> Option<CachedValue> {
        let key = self.key(session, node)?;
        session.request_value(&key)
    }

    fn set_and_return_cached_value(
        &self,
        session: &Session,
        node: NodeId,
        value: CachedValue,
    ) -> CachedValue {
        if let Some(key) = self.key(session, node) {
            session.set_request_value(key, value.clone());
        }
        value
    }

    fn clear(&self, session: &Session, node: NodeId) {
        if let Some(key) = self.key(session, node) {
            session.remove_request_value(&key);
        }
    }
}

/// Build the strategy declared for an aspect.
pub(crate) fn strategy_for(aspect: CacheAspect, decl: &CacheDecl) -> Arc<dyn CacheStrategy> {
    match decl.mode {
        CacheMode::Off => Arc::new(NoCache),
        CacheMode::On => Arc::new(LocalCache::new(aspect, decl.clear.unwrap_or_default())),
        CacheMode::Scoped => Arc::new(ScopedCache::new(aspect)),
    }
}

/// Clears aspects of an observing node when an observed node changes.
#[derive(Debug)]
pub(crate) struct CacheObserver {
    observer: NodeId,
    aspects: Vec<CacheAspect>,
}

/// Node property holding the observers a node owns.
pub(crate) const CACHE_OBSERVERS: &str = "pm.cache_observers";

impl CacheObserver {
    pub(crate) fn new(observer: NodeId, aspects: Vec<CacheAspect>) -> Self {
        Self { observer, aspects }
    }
}

impl PmEventListener for CacheObserver {
    fn handle(&self, session: &Session, event: &PmEvent) -> Result<()> {
        tracing::trace!(
            target: targets::CACHE,
            observer = ?self.observer,
            source = ?event.node(),
            "cascade cache clear"
        );
        match session.clear_cache(self.observer, &self.aspects) {
            Err(PmError::InvalidNode) => Ok(()),
            other => other,
        }
    }
}

impl Session {
    /// The strategy selected for one aspect of a node.
    pub fn cache_strategy(
        &self,
        node: NodeId,
        aspect: CacheAspect,
    ) -> Result<Arc<dyn CacheStrategy>> {
        self.with_node(node, |d| d.meta.strategy(aspect).clone())
    }

    /// Clear the given aspect caches of a node.
    pub fn clear_cache(&self, node: NodeId, aspects: &[CacheAspect]) -> Result<()> {
        let meta = self.meta(node)?;
        for &aspect in aspects {
            meta.strategy(aspect).clear(self, node);
        }
        Ok(())
    }

    /// Read an aspect through its cache strategy, computing it on a miss.
    pub(crate) fn cached_aspect<T, F>(
        &self,
        node: NodeId,
        aspect: CacheAspect,
        compute: F,
    ) -> Result<T>
    where
        T: Clone + Any + Send + Sync,
        F: FnOnce() -> Result<T>,
    {
        let strategy = self.cache_strategy(node, aspect)?;
        if let Some(cached) = strategy.get_cached_value(self, node) {
            if let Some(value) = cached.downcast_ref::<T>() {
                return Ok(value.clone());
            }
        }
        let value = compute()?;
        strategy.set_and_return_cached_value(self, node, Arc::new(value.clone()));
        Ok(value)
    }

    /// Register the cascade-clear observers declared by the node's meta data.
    pub(crate) fn register_cache_observers(&self, node: NodeId) -> Result<()> {
        let meta = self.meta(node)?;
        if meta.observed().is_empty() {
            return Ok(());
        }

        let mut owned: Vec<Arc<dyn PmEventListener>> = Vec::new();
        for (expr, aspects) in meta.observed() {
            let observed = self.with_tree(|tree| {
                let base = tree.parent(node)?.unwrap_or(node);
                tree.resolve_relative(base, expr)
            })?;
            let Some(observed) = observed else {
                return Err(PmError::ObservedNodeNotFound {
                    path: self.node_path(node),
                    expr: expr.clone(),
                });
            };
            let listener: Arc<dyn PmEventListener> =
                Arc::new(CacheObserver::new(node, aspects.clone()));
            self.register_listener(observed, ChangeMask::VALUE, listener.clone(), false)?;
            owned.push(listener);
        }

        tracing::trace!(
            target: targets::CACHE,
            ?node,
            count = owned.len(),
            "registered cache observers"
        );
        self.write_tree().set_property(node, CACHE_OBSERVERS, owned)
    }
}
