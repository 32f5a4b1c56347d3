//! Severity-tagged messages attached to nodes or to the session.
//!
//! Messages carry a resource key plus arguments; the display text is looked
//! up once through the session's [`Resources`](crate::Resources) when the
//! message is added.

use std::collections::VecDeque;
use std::fmt;

use crate::node::NodeId;

/// Message severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Informational message.
    Info,
    /// Something the user should look at.
    Warning,
    /// A failed validation or operation.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A message produced by validation or by an operation on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmMessage {
    /// The node the message belongs to, `None` for session-wide messages.
    pub node: Option<NodeId>,
    /// Message severity.
    pub severity: Severity,
    /// Resource key of the message text.
    pub key: String,
    /// Arguments substituted into the text.
    pub args: Vec<String>,
    /// Resolved display text.
    pub text: String,
}

/// A rejected value, described by a resource key and its arguments.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Validation failed: {key}")]
pub struct ValidationError {
    /// Resource key of the failure message.
    pub key: String,
    /// Message arguments.
    pub args: Vec<String>,
}

impl ValidationError {
    /// Create a validation error without arguments.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            args: Vec::new(),
        }
    }

    /// Add a message argument.
    pub fn with_arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }
}

/// Replace `{0}`, `{1}`, ... placeholders with the given arguments.
pub(crate) fn format_text(template: &str, args: &[String]) -> String {
    let mut text = template.to_string();
    for (i, arg) in args.iter().enumerate() {
        text = text.replace(&format!("{{{i}}}"), arg);
    }
    text
}

/// Bounded message store owned by a session.
#[derive(Debug)]
pub(crate) struct MessageLog {
    messages: VecDeque<PmMessage>,
    limit: usize,
}

impl MessageLog {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            limit,
        }
    }

    pub(crate) fn push(&mut self, message: PmMessage) {
        if self.limit > 0 && self.messages.len() >= self.limit {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub(crate) fn all(&self) -> Vec<PmMessage> {
        self.messages.iter().cloned().collect()
    }

    pub(crate) fn for_node(&self, node: NodeId) -> Vec<PmMessage> {
        self.messages
            .iter()
            .filter(|m| m.node == Some(node))
            .cloned()
            .collect()
    }

    pub(crate) fn clear(&mut self, node: Option<NodeId>) {
        match node {
            Some(id) => self.messages.retain(|m| m.node != Some(id)),
            None => self.messages.clear(),
        }
    }
}
