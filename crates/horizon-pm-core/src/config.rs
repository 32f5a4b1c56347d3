//! Declarative per-node configuration.
//!
//! Configuration is read once per structural path while its meta data is
//! populated. A node definition carries an ordered list of
//! [`ConfigSource`]s; each source overlays the [`NodeConfig`] built so far,
//! so later sources win over earlier ones.
//!
//! # Example
//!
//! ```
//! use horizon_pm_core::{CacheAspect, CacheDecl, NodeConfig, ValidationTiming};
//!
//! let config = NodeConfig::new()
//!     .with_cache(CacheAspect::Title, CacheDecl::on())
//!     .with_cache(CacheAspect::Options, CacheDecl::on().observe("../country"))
//!     .with_validation(ValidationTiming::BeforeWrite);
//! assert!(config.validate("order/city").is_ok());
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::cache::CacheAspect;
use crate::error::{PmError, Result};
use crate::value::Value;

/// How an aspect is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheMode {
    /// Recompute on every read.
    #[default]
    Off,
    /// Keep the value in the node's own slot.
    On,
    /// Keep the value in the session's request-scope store.
    Scoped,
}

/// When a locally cached value becomes invalid on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheClear {
    /// Only explicit and event-driven clears.
    #[default]
    Never,
    /// At the start of every new request.
    OnRequest,
}

/// Cache declaration of one aspect.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheDecl {
    /// Cache mode.
    pub mode: CacheMode,
    /// Clear policy; only meaningful with [`CacheMode::On`].
    pub clear: Option<CacheClear>,
    /// Relative paths of nodes whose value changes clear this aspect.
    pub observe: Vec<String>,
}

impl CacheDecl {
    /// An uncached aspect.
    pub fn off() -> Self {
        Self::default()
    }

    /// A locally cached aspect.
    pub fn on() -> Self {
        Self {
            mode: CacheMode::On,
            ..Self::default()
        }
    }

    /// A request-scoped aspect.
    pub fn scoped() -> Self {
        Self {
            mode: CacheMode::Scoped,
            ..Self::default()
        }
    }

    /// Set the clear policy.
    pub fn clear(mut self, clear: CacheClear) -> Self {
        self.clear = Some(clear);
        self
    }

    /// Add an observed node path, relative to the node's parent.
    pub fn observe(mut self, path: impl Into<String>) -> Self {
        self.observe.push(path.into());
        self
    }

    fn validate(&self, aspect: CacheAspect) -> Result<()> {
        if self.clear.is_some() && self.mode != CacheMode::On {
            return Err(PmError::config(format!(
                "{aspect} cache: a clear policy requires cache mode 'on', found {:?}",
                self.mode
            )));
        }
        if !self.observe.is_empty() && self.mode == CacheMode::Off {
            return Err(PmError::config(format!(
                "{aspect} cache: observed nodes declared for an uncached aspect"
            )));
        }
        for expr in &self.observe {
            if expr.trim().is_empty() || expr.split('/').any(str::is_empty) {
                return Err(PmError::config(format!(
                    "{aspect} cache: invalid observe path '{expr}'"
                )));
            }
        }
        Ok(())
    }
}

/// When attribute validators run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ValidationTiming {
    /// Only through [`Session::validate`](crate::Session::validate).
    #[default]
    Explicit,
    /// Before a value is written; invalid values are not written.
    BeforeWrite,
    /// After a value was written; failures only produce messages.
    AfterWrite,
}

/// Configuration of one structural node position.
///
/// Every field is optional so sources can overlay each other; unset fields
/// fall back to the defaults of the resolved meta data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeConfig {
    /// Cache declarations per aspect.
    pub cache: BTreeMap<CacheAspect, CacheDecl>,
    /// Reject all writes.
    pub read_only: Option<bool>,
    /// Validation timing.
    pub validation: Option<ValidationTiming>,
    /// Park broadcasts until the bean is read.
    pub defer_events: Option<bool>,
    /// Resource key of the title.
    pub title_key: Option<String>,
    /// Value reported while nothing was written.
    pub default_value: Option<Value>,
    /// Request parameter consulted before the default value.
    pub request_default: Option<String>,
    /// Add a required-value validator.
    pub required: Option<bool>,
}

impl NodeConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the cache of one aspect.
    pub fn with_cache(mut self, aspect: CacheAspect, decl: CacheDecl) -> Self {
        self.cache.insert(aspect, decl);
        self
    }

    /// Set the read-only flag.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    /// Set the validation timing.
    pub fn with_validation(mut self, timing: ValidationTiming) -> Self {
        self.validation = Some(timing);
        self
    }

    /// Enable or disable deferred event handling.
    pub fn with_defer_events(mut self, defer: bool) -> Self {
        self.defer_events = Some(defer);
        self
    }

    /// Set the title resource key.
    pub fn with_title_key(mut self, key: impl Into<String>) -> Self {
        self.title_key = Some(key.into());
        self
    }

    /// Set the default value.
    pub fn with_default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    /// Set the request parameter used as default value.
    pub fn with_request_default(mut self, param: impl Into<String>) -> Self {
        self.request_default = Some(param.into());
        self
    }

    /// Mark the attribute as required.
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = Some(required);
        self
    }

    /// Overlay `other` onto this configuration; set fields of `other` win.
    pub fn merge(&mut self, other: &NodeConfig) {
        for (aspect, decl) in &other.cache {
            self.cache.insert(*aspect, decl.clone());
        }
        if other.read_only.is_some() {
            self.read_only = other.read_only;
        }
        if other.validation.is_some() {
            self.validation = other.validation;
        }
        if other.defer_events.is_some() {
            self.defer_events = other.defer_events;
        }
        if other.title_key.is_some() {
            self.title_key.clone_from(&other.title_key);
        }
        if other.default_value.is_some() {
            self.default_value.clone_from(&other.default_value);
        }
        if other.request_default.is_some() {
            self.request_default.clone_from(&other.request_default);
        }
        if other.required.is_some() {
            self.required = other.required;
        }
    }

    /// The cache declaration of an aspect, [`CacheDecl::off`] if undeclared.
    pub fn cache_decl(&self, aspect: CacheAspect) -> CacheDecl {
        self.cache.get(&aspect).cloned().unwrap_or_default()
    }

    /// Check the configuration for contradictory declarations.
    pub fn validate(&self, path: &str) -> Result<()> {
        for (aspect, decl) in &self.cache {
            decl.validate(*aspect)
                .map_err(|err| PmError::config(format!("{path}: {err}")))?;
        }
        if let Some(key) = &self.title_key {
            if key.trim().is_empty() {
                return Err(PmError::config(format!("{path}: empty title key")));
            }
        }
        if let Some(param) = &self.request_default {
            if param.trim().is_empty() {
                return Err(PmError::config(format!("{path}: empty request default parameter")));
            }
        }
        Ok(())
    }
}

/// A source of declarative node configuration.
pub trait ConfigSource: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Apply this source on top of `config`.
    fn apply(&self, config: &mut NodeConfig) -> Result<()>;
}

impl ConfigSource for NodeConfig {
    fn name(&self) -> &str {
        "inline"
    }

    fn apply(&self, config: &mut NodeConfig) -> Result<()> {
        config.merge(self);
        Ok(())
    }
}

impl fmt::Debug for dyn ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigSource({})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_source_overrides_earlier() {
        let mut config = NodeConfig::new()
            .with_read_only(true)
            .with_title_key("a.title");
        let overlay = NodeConfig::new().with_read_only(false);
        overlay.apply(&mut config).unwrap();

        assert_eq!(config.read_only, Some(false));
        assert_eq!(config.title_key.as_deref(), Some("a.title"));
    }

    #[test]
    fn clear_policy_requires_local_cache() {
        let config = NodeConfig::new().with_cache(
            CacheAspect::Title,
            CacheDecl::scoped().clear(CacheClear::OnRequest),
        );
        let err = config.validate("order/title").unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("order/title"));
    }

    #[test]
    fn observe_requires_cache() {
        let config = NodeConfig::new()
            .with_cache(CacheAspect::Options, CacheDecl::off().observe("../country"));
        assert!(config.validate("x").is_err());
    }

    #[test]
    fn empty_observe_segment_is_rejected() {
        let config = NodeConfig::new()
            .with_cache(CacheAspect::Options, CacheDecl::on().observe("..//country"));
        assert!(config.validate("x").is_err());
    }

    #[test]
    fn undeclared_aspect_is_off() {
        let config = NodeConfig::new();
        assert_eq!(config.cache_decl(CacheAspect::Value).mode, CacheMode::Off);
    }
}
