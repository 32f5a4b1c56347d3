//! Logging and debugging facilities for Horizon PM.
//!
//! This module provides:
//! - Target names for filtering the crate's `tracing` output by subsystem
//! - Debug visualization of a session's node tree
//!
//! # Tracing Integration
//!
//! Horizon PM uses the `tracing` crate for instrumentation and never
//! installs a subscriber itself. To see logs, install one in your
//! application:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("horizon_pm_core::broadcast=trace")
//!     .init();
//! ```
//!
//! # Debug Visualization
//!
//! Use [`NodeTreeDebug`] to dump the node hierarchy:
//!
//! ```
//! use horizon_pm_core::logging::NodeTreeDebug;
//! use horizon_pm_core::{NodeDef, Session};
//!
//! let session = Session::builder().private_registry().build();
//! let def = NodeDef::conversation("Order")
//!     .child(NodeDef::attribute("qty").build())
//!     .build();
//! let root = session.create_root(&def).unwrap();
//! let dump = NodeTreeDebug::new().format_subtree(&session, root).unwrap();
//! assert!(dump.contains("qty"));
//! ```

use std::fmt::{self, Write as FmtWrite};

use crate::broadcast::PENDING_BROADCAST;
use crate::error::{PmError, Result};
use crate::node::{NodeId, PmTree};
use crate::session::Session;

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Meta data resolution.
    pub const META: &str = "horizon_pm_core::meta";
    /// Cache strategies and cascade clears.
    pub const CACHE: &str = "horizon_pm_core::cache";
    /// Identity cache and bean factories.
    pub const IDENTITY: &str = "horizon_pm_core::identity";
    /// Listener registration.
    pub const LISTENER: &str = "horizon_pm_core::listener";
    /// Event broadcasting.
    pub const BROADCAST: &str = "horizon_pm_core::broadcast";
    /// Attribute value changes.
    pub const VALUE: &str = "horizon_pm_core::value";
    /// Session lifecycle, messages and commands.
    pub const SESSION: &str = "horizon_pm_core::session";
    /// Node tree structure.
    pub const NODE: &str = "horizon_pm_core::node";
}

/// Style options for node tree visualization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeStyle {
    /// ASCII characters for tree branches.
    Ascii,
    /// Unicode box-drawing characters.
    #[default]
    Unicode,
    /// Compact single-line representation.
    Compact,
}

/// Configuration for node tree debug output.
#[derive(Debug, Clone)]
pub struct TreeFormatOptions {
    pub style: TreeStyle,
    /// Show node ids.
    pub show_ids: bool,
    /// Show node kinds.
    pub show_kinds: bool,
    /// Show instance paths instead of names.
    pub show_paths: bool,
    /// Show written attribute values and the changed flag.
    pub show_values: bool,
    /// Mark nodes with a parked broadcast.
    pub show_pending: bool,
    /// Maximum depth to traverse (None for unlimited).
    pub max_depth: Option<usize>,
    /// Indent size for each level.
    pub indent_size: usize,
}

impl Default for TreeFormatOptions {
    fn default() -> Self {
        Self {
            style: TreeStyle::default(),
            show_ids: false,
            show_kinds: true,
            show_paths: false,
            show_values: true,
            show_pending: true,
            max_depth: None,
            indent_size: 2,
        }
    }
}

impl TreeFormatOptions {
    /// Create options for detailed debugging output.
    pub fn detailed() -> Self {
        Self {
            show_ids: true,
            show_paths: true,
            ..Default::default()
        }
    }

    /// Create options for minimal output.
    pub fn minimal() -> Self {
        Self {
            show_kinds: false,
            show_values: false,
            show_pending: false,
            ..Default::default()
        }
    }
}

/// Debug utility for visualizing a session's node tree.
#[derive(Debug, Clone, Default)]
pub struct NodeTreeDebug {
    options: TreeFormatOptions,
}

impl NodeTreeDebug {
    /// Create a new debug visualizer with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a debug visualizer with custom options.
    pub fn with_options(options: TreeFormatOptions) -> Self {
        Self { options }
    }

    /// Format every root of the session.
    pub fn format_all(&self, session: &Session) -> String {
        session.with_tree(|tree| {
            let mut output = String::new();
            if self.write_all(tree, &mut output).is_err() {
                output.push_str("(tree dump incomplete)\n");
            }
            output
        })
    }

    fn write_all(&self, tree: &PmTree, output: &mut String) -> fmt::Result {
        writeln!(output, "Node Tree ({} total nodes):", tree.len())?;
        let roots: Vec<NodeId> = tree.root_nodes().collect();
        if roots.is_empty() {
            writeln!(output, "  (empty)")?;
        }
        for root in roots {
            self.write_subtree(tree, root, 0, true, output)?;
        }
        Ok(())
    }

    /// Format the subtree below `root`.
    pub fn format_subtree(&self, session: &Session, root: NodeId) -> Result<String> {
        session.with_tree(|tree| {
            if !tree.contains(root) {
                return Err(PmError::InvalidNode);
            }
            let mut output = String::new();
            self.write_subtree(tree, root, 0, true, &mut output)
                .map_err(|err| PmError::config(format!("tree dump failed: {err}")))?;
            Ok(output)
        })
    }

    fn write_subtree(
        &self,
        tree: &PmTree,
        id: NodeId,
        depth: usize,
        is_last: bool,
        output: &mut String,
    ) -> fmt::Result {
        if self.options.max_depth.is_some_and(|max| depth > max) {
            return Ok(());
        }
        let data = tree.node(id).map_err(|_| fmt::Error)?;

        output.push_str(&self.build_prefix(depth, is_last));
        output.push_str(if self.options.show_paths { &data.path } else { &data.name });
        if self.options.show_ids {
            write!(output, " [{id:?}]")?;
        }
        if self.options.show_kinds {
            write!(output, " ({})", data.kind)?;
        }
        if self.options.show_values {
            if let Some(value) = &data.attribute.backing {
                write!(output, " = {value:?}")?;
            }
            if data.attribute.changed {
                output.push_str(" *changed*");
            }
        }
        if self.options.show_pending && data.properties.contains_key(PENDING_BROADCAST) {
            output.push_str(" *deferred*");
        }
        output.push('\n');

        let child_count = data.children.len();
        for (i, &child) in data.children.iter().enumerate() {
            self.write_subtree(tree, child, depth + 1, i + 1 == child_count, output)?;
        }
        Ok(())
    }

    /// Build the prefix string for a tree node.
    fn build_prefix(&self, depth: usize, is_last: bool) -> String {
        if depth == 0 {
            return String::new();
        }

        let (branch, corner, last) = match self.options.style {
            TreeStyle::Ascii => ("|", "+--", "`--"),
            TreeStyle::Unicode => (
                "\u{2502}",
                "\u{251c}\u{2500}\u{2500}",
                "\u{2514}\u{2500}\u{2500}",
            ),
            TreeStyle::Compact => ("", "-", "-"),
        };

        let mut prefix = String::new();
        for _ in 0..(depth - 1) {
            prefix.push_str(branch);
            prefix.extend(std::iter::repeat_n(' ', self.options.indent_size));
        }
        prefix.push_str(if is_last { last } else { corner });
        prefix.push(' ');
        prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NodeDef;
    use std::sync::Arc;

    fn sample() -> (Session, NodeId) {
        let session = Session::builder().private_registry().build();
        let def = NodeDef::conversation("Order")
            .child(NodeDef::attribute("qty").build())
            .child(NodeDef::bean("Customer").defer_events().build())
            .build();
        let root = session.create_root(&def).unwrap();
        (session, root)
    }

    #[test]
    fn test_targets_follow_module_paths() {
        let crate_name = module_path!().split("::").next().unwrap();
        for (target, module) in [
            (targets::META, "meta"),
            (targets::CACHE, "cache"),
            (targets::IDENTITY, "identity"),
            (targets::LISTENER, "listener"),
            (targets::BROADCAST, "broadcast"),
            (targets::VALUE, "value"),
            (targets::SESSION, "session"),
            (targets::NODE, "node"),
        ] {
            assert_eq!(target, format!("{crate_name}::{module}"));
        }
    }

    #[test]
    fn test_tree_format_empty() {
        let session = Session::builder().private_registry().build();
        let output = NodeTreeDebug::new().format_all(&session);
        assert!(output.contains("Node Tree (0 total nodes)"));
        assert!(output.contains("(empty)"));
    }

    #[test]
    fn test_tree_format_hierarchy() {
        let (session, root) = sample();
        let output = NodeTreeDebug::new().format_subtree(&session, root).unwrap();

        assert!(output.starts_with("Order (conversation)"));
        assert!(output.contains("\u{251c}\u{2500}\u{2500} qty (attribute)"));
        assert!(output.contains("\u{2514}\u{2500}\u{2500} Customer (bean)"));
    }

    #[test]
    fn test_tree_format_values_and_pending() {
        let (session, root) = sample();
        let qty = session.find_child(root, "qty").unwrap().unwrap();
        assert!(session.set_value(qty, 3));
        session.set_bean(root, Arc::new(1u8)).unwrap();

        let output = NodeTreeDebug::new().format_subtree(&session, root).unwrap();
        assert!(output.contains("qty (attribute) = Int(3) *changed*"));
        assert!(output.contains("Customer (bean) *deferred*"));
    }

    #[test]
    fn test_tree_format_minimal_with_paths() {
        let (session, root) = sample();
        let options = TreeFormatOptions {
            show_paths: true,
            style: TreeStyle::Ascii,
            ..TreeFormatOptions::minimal()
        };
        let output = NodeTreeDebug::with_options(options)
            .format_subtree(&session, root)
            .unwrap();

        assert!(output.contains("+-- Order/qty\n"));
        assert!(output.contains("`-- Order/Customer\n"));
        assert!(!output.contains("(bean)"));
    }

    #[test]
    fn test_tree_format_max_depth() {
        let (session, root) = sample();
        let options = TreeFormatOptions {
            max_depth: Some(0),
            ..TreeFormatOptions::default()
        };
        let output = NodeTreeDebug::with_options(options)
            .format_subtree(&session, root)
            .unwrap();
        assert_eq!(output.lines().count(), 1);
    }
}
