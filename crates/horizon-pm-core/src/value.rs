//! Attribute values and the value-change state machine.
//!
//! A write to an attribute moves through
//! `Unchanged → PendingValidation → (Rejected | Changed)`:
//!
//! 1. Old and new value are compared with [`Value::equals_with_empty_check`];
//!    equal values end the write as `Unchanged`.
//! 2. Read-only attributes reject the write with an error message.
//! 3. With [`ValidationTiming::BeforeWrite`] the validators run first; a
//!    failure keeps the input as an invalid shadow value.
//! 4. The before-change hook and all [`ValueChangeDecorator`]s may veto.
//! 5. The backing value is written, the cached value refreshed, the changed
//!    flag updated, after-change hooks run, a `VALUE` event is broadcast and
//!    the change is recorded in the command history.
//!
//! [`Session::set_value`] wraps this in a boolean result for UI callers;
//! [`Session::change_value`] exposes the final state and propagates errors.

use std::fmt;
use std::sync::Arc;

use crate::broadcast::DispatchMode;
use crate::cache::CacheAspect;
use crate::config::ValidationTiming;
use crate::error::Result;
use crate::event::{ChangeKind, ChangeMask};
use crate::history::ValueChange;
use crate::logging::targets;
use crate::message::{Severity, ValidationError};
use crate::meta::MetaData;
use crate::node::{InvalidValue, NodeId, NodeKind};
use crate::session::Session;

/// A dynamically typed attribute value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// No value.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A floating point number.
    Float(f64),
    /// A string.
    Text(String),
    /// A list of values.
    List(Vec<Value>),
}

impl Value {
    /// Whether the value counts as empty: null, an empty string or an empty list.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(text) => text.is_empty(),
            Self::List(items) => items.is_empty(),
            _ => false,
        }
    }

    /// Equality that treats all empty representations as equal.
    pub fn equals_with_empty_check(&self, other: &Value) -> bool {
        if self.is_empty() || other.is_empty() {
            return self.is_empty() && other.is_empty();
        }
        self == other
    }

    /// The text if this is a [`Value::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// The integer if this is a [`Value::Int`].
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// The boolean if this is a [`Value::Bool`].
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
            Self::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                Ok(())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Final state of one attribute write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueChangeState {
    /// The new value equals the current one; nothing happened.
    Unchanged,
    /// The write is being checked. Never returned.
    PendingValidation,
    /// Read-only, invalid or vetoed; nothing was mutated.
    Rejected,
    /// The value was written and the change broadcast.
    Changed,
}

/// A before/after hook around attribute writes with veto power.
pub trait ValueChangeDecorator: Send + Sync {
    /// Called before the write. Returning `false` vetoes it.
    fn before_do(&self, session: &Session, node: NodeId, old: &Value, new: &Value) -> Result<bool>;

    /// Called after the write.
    fn after_do(
        &self,
        _session: &Session,
        _node: NodeId,
        _old: &Value,
        _new: &Value,
    ) -> Result<()> {
        Ok(())
    }
}

/// Checks attribute values.
pub trait Validator: Send + Sync {
    /// Validate `value` for `node`.
    fn validate(
        &self,
        session: &Session,
        node: NodeId,
        value: &Value,
    ) -> std::result::Result<(), ValidationError>;
}

/// Rejects empty values.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredValidator;

impl Validator for RequiredValidator {
    fn validate(
        &self,
        _session: &Session,
        _node: NodeId,
        value: &Value,
    ) -> std::result::Result<(), ValidationError> {
        if value.is_empty() {
            Err(ValidationError::new("pm.validation.required"))
        } else {
            Ok(())
        }
    }
}

impl Session {
    /// Get the value of an attribute.
    ///
    /// Falls back to the request parameter configured as request default,
    /// then to the configured default value, while nothing was written.
    pub fn value(&self, node: NodeId) -> Result<Value> {
        self.ensure_kind(node, NodeKind::Attribute, "an attribute")?;
        self.cached_aspect(node, CacheAspect::Value, || self.compute_value(node))
    }

    fn compute_value(&self, node: NodeId) -> Result<Value> {
        let (backing, meta) =
            self.with_node(node, |d| (d.attribute.backing.clone(), d.meta.clone()))?;
        if let Some(value) = backing {
            return Ok(value);
        }
        if let Some(param) = meta.request_default() {
            if let Some(text) = self.view_connector().read_request_value(param) {
                return Ok(Value::Text(text));
            }
        }
        Ok(meta.default_value().cloned().unwrap_or_default())
    }

    /// String form of the attribute: the rejected input while an invalid
    /// value is pending, the current value otherwise.
    pub fn value_as_string(&self, node: NodeId) -> Result<String> {
        if let Some(invalid) = self.invalid_value(node)? {
            return Ok(invalid.text);
        }
        Ok(self.value(node)?.to_string())
    }

    /// The rejected input kept for display, if any.
    pub fn invalid_value(&self, node: NodeId) -> Result<Option<InvalidValue>> {
        self.with_node(node, |d| d.attribute.invalid.clone())
    }

    /// Write an attribute value.
    ///
    /// Returns `true` if the value was written or was already equal.
    /// Failures are routed to the session's exception handler and reported
    /// as `false`.
    pub fn set_value(&self, node: NodeId, value: impl Into<Value>) -> bool {
        match self.change_value(node, value.into()) {
            Ok(state) => state != ValueChangeState::Rejected,
            Err(err) => {
                tracing::debug!(target: targets::VALUE, ?node, error = %err, "value change failed");
                self.handle_error(Some(node), &err, None);
                false
            }
        }
    }

    /// Write an attribute value and return the final state of the write.
    #[tracing::instrument(skip(self, new), target = "horizon_pm_core::value", level = "trace")]
    pub fn change_value(&self, node: NodeId, new: Value) -> Result<ValueChangeState> {
        self.ensure_kind(node, NodeKind::Attribute, "an attribute")?;
        let meta = self.meta(node)?;
        let old = self.value(node)?;

        if old.equals_with_empty_check(&new) {
            self.with_node_mut(node, |d| d.attribute.invalid = None)?;
            return Ok(ValueChangeState::Unchanged);
        }

        // PendingValidation: messages of a previous attempt are stale now.
        self.clear_messages(Some(node));
        let behavior = meta.behavior().clone();

        if meta.is_read_only() || behavior.is_read_only(self, node) {
            self.add_message(
                Some(node),
                Severity::Error,
                "pm.validation.read_only",
                vec![meta.name().to_string()],
            );
            return Ok(ValueChangeState::Rejected);
        }

        if meta.validation() == ValidationTiming::BeforeWrite {
            if let Err(err) = self.validate_value(node, &meta, &new) {
                let text = new.to_string();
                self.with_node_mut(node, |d| {
                    d.attribute.invalid = Some(InvalidValue { value: new, text });
                })?;
                self.add_message(Some(node), Severity::Error, err.key, err.args);
                return Ok(ValueChangeState::Rejected);
            }
        }

        if !behavior.before_change(self, node, &old, &new)? {
            tracing::debug!(target: targets::VALUE, ?node, "value change vetoed by hook");
            return Ok(ValueChangeState::Rejected);
        }
        let decorators = self.with_node(node, |d| d.value_decorators.clone())?;
        for decorator in &decorators {
            if !decorator.before_do(self, node, &old, &new)? {
                tracing::debug!(target: targets::VALUE, ?node, "value change vetoed by decorator");
                return Ok(ValueChangeState::Rejected);
            }
        }

        self.write_value(node, &old, new.clone(), ChangeKind::Value)?;

        behavior.after_change(self, node, &old, &new)?;
        for decorator in &decorators {
            decorator.after_do(self, node, &old, &new)?;
        }

        self.broadcast(node, ChangeMask::VALUE, ChangeKind::Value, DispatchMode::Immediate)?;

        if meta.validation() == ValidationTiming::AfterWrite {
            if let Err(err) = self.validate_value(node, &meta, &new) {
                self.add_message(Some(node), Severity::Error, err.key, err.args);
            }
        }

        self.record_value_change(ValueChange { node, old, new });
        Ok(ValueChangeState::Changed)
    }

    /// Store `new` as backing value, refresh the cache and update the changed flag.
    ///
    /// Fires `CHANGED_STATE` when the flag flips.
    pub(crate) fn write_value(
        &self,
        node: NodeId,
        old: &Value,
        new: Value,
        kind: ChangeKind,
    ) -> Result<()> {
        let strategy = self.cache_strategy(node, CacheAspect::Value)?;
        let flipped = self.with_node_mut(node, |d| {
            let attribute = &mut d.attribute;
            if attribute.original.is_none() {
                attribute.original = Some(old.clone());
            }
            attribute.backing = Some(new.clone());
            attribute.invalid = None;
            let changed = attribute
                .original
                .as_ref()
                .is_some_and(|original| !original.equals_with_empty_check(&new));
            let flipped = changed != attribute.changed;
            attribute.changed = changed;
            flipped
        })?;
        strategy.set_and_return_cached_value(self, node, Arc::new(new));

        if flipped {
            self.broadcast(node, ChangeMask::CHANGED_STATE, kind, DispatchMode::Immediate)?;
        }
        Ok(())
    }

    fn validate_value(
        &self,
        node: NodeId,
        meta: &MetaData,
        value: &Value,
    ) -> std::result::Result<(), ValidationError> {
        meta.behavior().validate(self, node, value)?;
        for validator in meta.validators() {
            validator.validate(self, node, value)?;
        }
        Ok(())
    }

    /// Validate every attribute in the subtree of `node`.
    ///
    /// Adds one message per invalid attribute and returns `true` when all
    /// values are valid.
    pub fn validate(&self, node: NodeId) -> Result<bool> {
        let attributes: Vec<NodeId> = self.with_tree(|tree| {
            tree.depth_first_preorder(node).map(|ids| {
                ids.into_iter()
                    .filter(|&id| tree.kind(id).is_ok_and(|k| k == NodeKind::Attribute))
                    .collect()
            })
        })?;

        let mut valid = true;
        for attribute in attributes {
            self.clear_messages(Some(attribute));
            let meta = self.meta(attribute)?;
            let value = match self.invalid_value(attribute)? {
                Some(invalid) => invalid.value,
                None => self.value(attribute)?,
            };
            if let Err(err) = self.validate_value(attribute, &meta, &value) {
                self.add_message(Some(attribute), Severity::Error, err.key, err.args);
                valid = false;
            }
        }
        Ok(valid)
    }

    /// Whether the node, or any attribute below it, holds a changed value.
    pub fn is_changed(&self, node: NodeId) -> Result<bool> {
        self.with_tree(|tree| {
            let ids = tree.depth_first_preorder(node)?;
            for id in ids {
                let data = tree.node(id)?;
                if data.kind == NodeKind::Attribute && data.attribute.changed {
                    return Ok(true);
                }
            }
            Ok(false)
        })
    }

    /// Accept the current values of the subtree as the new originals.
    pub fn reset_changed_state(&self, node: NodeId) -> Result<()> {
        let flipped: Vec<NodeId> = {
            let mut tree = self.write_tree();
            let ids = tree.depth_first_preorder(node)?;
            let mut flipped = Vec::new();
            for id in ids {
                let data = tree.node_mut(id)?;
                data.attribute.original = None;
                if data.attribute.changed {
                    data.attribute.changed = false;
                    flipped.push(id);
                }
            }
            flipped
        };
        for id in flipped {
            self.broadcast(
                id,
                ChangeMask::CHANGED_STATE,
                ChangeKind::Other,
                DispatchMode::Immediate,
            )?;
        }
        Ok(())
    }

    /// Add a value-change decorator to an attribute.
    pub fn add_value_decorator(
        &self,
        node: NodeId,
        decorator: Arc<dyn ValueChangeDecorator>,
    ) -> Result<()> {
        self.ensure_kind(node, NodeKind::Attribute, "an attribute")?;
        self.with_node_mut(node, |d| d.value_decorators.push(decorator))
    }
}
