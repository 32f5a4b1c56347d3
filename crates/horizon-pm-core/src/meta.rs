//! Shared per-position meta data.
//!
//! All nodes at the same structural position share one immutable
//! [`MetaData`], derived once from the node's [`NodeDef`] and its
//! configuration sources. The [`MetaDataRegistry`] maps structural paths to
//! published meta data.
//!
//! # Thread Safety
//!
//! Lookups are lock-free loads of an [`ArcSwap`]ped map. First-time
//! resolution is serialized by a registry-wide re-entrant lock, so a parent
//! can resolve its fixed children on the same thread while concurrent
//! resolutions of the same path wait and then observe the published result.
//! Children are resolved before their parent is published; a published
//! `MetaData` is always complete and never mutated.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use parking_lot::ReentrantMutex;

use crate::cache::{strategy_for, CacheAspect, CacheStrategy};
use crate::command::CommandBehavior;
use crate::config::{NodeConfig, ValidationTiming};
use crate::definition::{ListenerFactory, NodeBehavior, NodeDef};
use crate::error::{PmError, Result};
use crate::event::ChangeMask;
use crate::logging::targets;
use crate::node::NodeKind;
use crate::value::{RequiredValidator, Validator, Value};

/// Immutable configuration of one structural node position.
pub struct MetaData {
    path: String,
    name: String,
    type_name: String,
    kind: NodeKind,
    title_key: String,
    strategies: Vec<Arc<dyn CacheStrategy>>,
    observed: Vec<(String, Vec<CacheAspect>)>,
    listener_factories: Vec<(ChangeMask, ListenerFactory)>,
    validators: Vec<Arc<dyn Validator>>,
    read_only: bool,
    validation: ValidationTiming,
    defer_events: bool,
    default_value: Option<Value>,
    request_default: Option<String>,
    behavior: Arc<dyn NodeBehavior>,
    command: Option<Arc<dyn CommandBehavior>>,
    children: Vec<Arc<MetaData>>,
    /// Names of the applied configuration sources, for diagnostics.
    sources: Vec<String>,
}

impl MetaData {
    /// Structural path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Name used in paths.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Resource key of the title. Defaults to the path with `/` replaced by `.`.
    pub fn title_key(&self) -> &str {
        &self.title_key
    }

    /// Cache strategy of an aspect.
    pub fn strategy(&self, aspect: CacheAspect) -> &Arc<dyn CacheStrategy> {
        &self.strategies[aspect.index()]
    }

    /// Cascade-clear declarations: observed path and the aspects it clears.
    pub fn observed(&self) -> &[(String, Vec<CacheAspect>)] {
        &self.observed
    }

    pub fn listener_factories(&self) -> &[(ChangeMask, ListenerFactory)] {
        &self.listener_factories
    }

    pub fn validators(&self) -> &[Arc<dyn Validator>] {
        &self.validators
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn validation(&self) -> ValidationTiming {
        self.validation
    }

    /// Whether broadcasts are parked until the node's bean is read.
    pub fn defers_events(&self) -> bool {
        self.defer_events
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default_value.as_ref()
    }

    /// Request parameter consulted while no value was written.
    pub fn request_default(&self) -> Option<&str> {
        self.request_default.as_deref()
    }

    pub fn behavior(&self) -> &Arc<dyn NodeBehavior> {
        &self.behavior
    }

    pub fn command(&self) -> Option<&Arc<dyn CommandBehavior>> {
        self.command.as_ref()
    }

    /// Meta data of the fixed children, in declaration order.
    pub fn children(&self) -> &[Arc<MetaData>] {
        &self.children
    }
}

impl fmt::Debug for MetaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaData")
            .field("path", &self.path)
            .field("type_name", &self.type_name)
            .field("kind", &self.kind)
            .field("read_only", &self.read_only)
            .field("validation", &self.validation)
            .field("defer_events", &self.defer_events)
            .field("sources", &self.sources)
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

/// Maps structural paths to shared [`MetaData`].
pub struct MetaDataRegistry {
    published: ArcSwap<HashMap<String, Arc<MetaData>>>,
    init_lock: ReentrantMutex<()>,
}

static GLOBAL_REGISTRY: OnceLock<Arc<MetaDataRegistry>> = OnceLock::new();

impl MetaDataRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            published: ArcSwap::from_pointee(HashMap::new()),
            init_lock: ReentrantMutex::new(()),
        }
    }

    /// The process-wide registry.
    pub fn global() -> Arc<MetaDataRegistry> {
        GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(MetaDataRegistry::new()))
            .clone()
    }

    /// Registry key of `def` below `parent_path`.
    pub fn key(parent_path: &str, def: &NodeDef) -> String {
        if parent_path.is_empty() {
            def.path_name().to_string()
        } else {
            format!("{parent_path}/{}", def.path_name())
        }
    }

    /// Resolve the meta data of `def` below `parent_path`.
    ///
    /// Repeated calls return the same `Arc`. A failed population publishes
    /// nothing; the next call starts over.
    #[tracing::instrument(skip(self, def), target = "horizon_pm_core::meta", level = "trace")]
    pub fn resolve(&self, parent_path: &str, def: &Arc<NodeDef>) -> Result<Arc<MetaData>> {
        let key = Self::key(parent_path, def);
        if let Some(meta) = self.lookup(&key, def)? {
            return Ok(meta);
        }

        let _guard = self.init_lock.lock();
        if let Some(meta) = self.lookup(&key, def)? {
            return Ok(meta);
        }

        let meta = self
            .populate(&key, def)
            .map(Arc::new)
            .map_err(|err| PmError::meta_data(key.clone(), err))?;
        self.published.rcu(|map| {
            let mut map = HashMap::clone(map);
            map.insert(key.clone(), meta.clone());
            map
        });
        tracing::debug!(
            target: targets::META,
            path = %key,
            kind = %meta.kind,
            "published meta data"
        );
        Ok(meta)
    }

    fn lookup(&self, key: &str, def: &NodeDef) -> Result<Option<Arc<MetaData>>> {
        match self.published.load().get(key) {
            Some(meta) if meta.type_name != def.type_name() => Err(PmError::PathTypeConflict {
                path: key.to_string(),
                existing: meta.type_name.clone(),
                requested: def.type_name().to_string(),
            }),
            Some(meta) => Ok(Some(meta.clone())),
            None => Ok(None),
        }
    }

    fn populate(&self, path: &str, def: &Arc<NodeDef>) -> Result<MetaData> {
        let name = def.path_name();
        if name.trim().is_empty() || name.contains('/') {
            return Err(PmError::config(format!("invalid node name '{name}'")));
        }

        let mut config = NodeConfig::new();
        for source in def.sources() {
            source.apply(&mut config)?;
        }
        config.validate(path)?;

        let strategies = CacheAspect::ALL
            .iter()
            .map(|&aspect| strategy_for(aspect, &config.cache_decl(aspect)))
            .collect();

        let mut observed: Vec<(String, Vec<CacheAspect>)> = Vec::new();
        for (&aspect, decl) in &config.cache {
            for expr in &decl.observe {
                match observed.iter_mut().find(|(e, _)| e == expr) {
                    Some((_, aspects)) => aspects.push(aspect),
                    None => observed.push((expr.clone(), vec![aspect])),
                }
            }
        }

        let mut validators = def.validators().to_vec();
        if config.required == Some(true) {
            validators.insert(0, Arc::new(RequiredValidator));
        }

        let mut children: Vec<Arc<MetaData>> = Vec::with_capacity(def.children().len());
        for child in def.children() {
            let meta = self.resolve(path, child)?;
            if children.iter().any(|c| c.name == meta.name) {
                return Err(PmError::config(format!(
                    "duplicate child name '{}' below '{path}'",
                    meta.name
                )));
            }
            children.push(meta);
        }

        Ok(MetaData {
            path: path.to_string(),
            name: name.to_string(),
            type_name: def.type_name().to_string(),
            kind: def.kind(),
            title_key: config
                .title_key
                .clone()
                .unwrap_or_else(|| path.replace('/', ".")),
            strategies,
            observed,
            listener_factories: def.listener_factories().to_vec(),
            validators,
            read_only: config.read_only.unwrap_or(false),
            validation: config.validation.unwrap_or_default(),
            defer_events: config.defer_events.unwrap_or(false),
            default_value: config.default_value.clone(),
            request_default: config.request_default.clone(),
            behavior: def.behavior().clone(),
            command: def.command_behavior().cloned(),
            children,
            sources: def.sources().iter().map(|s| s.name().to_string()).collect(),
        })
    }

    /// Published meta data of a path.
    pub fn get(&self, path: &str) -> Option<Arc<MetaData>> {
        self.published.load().get(path).cloned()
    }

    /// Number of published paths.
    pub fn len(&self) -> usize {
        self.published.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.published.load().is_empty()
    }

    /// Forget every published path. Existing `Arc`s stay valid.
    pub fn clear_all(&self) {
        let _guard = self.init_lock.lock();
        self.published.store(Arc::new(HashMap::new()));
    }
}

impl Default for MetaDataRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetaDataRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaDataRegistry")
            .field("published", &self.len())
            .finish()
    }
}
