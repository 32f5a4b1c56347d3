//! Error types for Horizon PM.

use crate::message::ValidationError;

/// A specialized Result type for Horizon PM operations.
pub type Result<T> = std::result::Result<T, PmError>;

/// The main error type for Horizon PM operations.
#[derive(Debug, thiserror::Error)]
pub enum PmError {
    /// Missing or contradictory declarative configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Meta data population failed for a structural path.
    ///
    /// Nothing is published for the path; a later resolution starts over.
    #[error("Failed to initialize meta data for '{path}': {source}")]
    MetaData {
        path: String,
        #[source]
        source: Box<PmError>,
    },

    /// A structural path was resolved again with a different declared type.
    #[error("Path '{path}' is bound to type '{existing}', cannot bind '{requested}'")]
    PathTypeConflict {
        path: String,
        existing: String,
        requested: String,
    },

    /// The bean is already wrapped by a reachable presentation model.
    #[error("Bean is already registered with a live presentation model")]
    IdentityConflict,

    /// An equal but distinct bean is already wrapped by a reachable presentation model.
    #[error("An equal bean is already registered with a live presentation model")]
    DuplicateBean,

    /// The node ID is invalid or the node has been destroyed.
    #[error("Invalid or destroyed node")]
    InvalidNode,

    /// The operation requires a different kind of node.
    #[error("Node '{path}' is not {expected}")]
    WrongKind { path: String, expected: &'static str },

    /// A cache-observe expression did not lead to a node.
    #[error("Observed node '{expr}' not found relative to '{path}'")]
    ObservedNodeNotFound { path: String, expr: String },

    /// A listener failed while an event was dispatched to it.
    #[error("Listener on '{path}' failed: {source}")]
    Listener {
        path: String,
        #[source]
        source: Box<PmError>,
    },

    /// A node behavior, hook or decorator failed.
    #[error("Operation on '{path}' failed: {message}")]
    Behavior { path: String, message: String },

    /// A value was rejected by a validator.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl PmError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Wrap an error raised while populating meta data for `path`.
    pub fn meta_data(path: impl Into<String>, source: PmError) -> Self {
        Self::MetaData {
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// Wrap an error raised by a listener of the node at `path`.
    pub fn listener(path: impl Into<String>, source: PmError) -> Self {
        Self::Listener {
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// Create a behavior failure for the node at `path`.
    pub fn behavior(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Behavior {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for configuration errors, including wrapped ones.
    pub fn is_config_error(&self) -> bool {
        match self {
            Self::Config(_) | Self::PathTypeConflict { .. } => true,
            Self::MetaData { source, .. } => source.is_config_error(),
            _ => false,
        }
    }
}
