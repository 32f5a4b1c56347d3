//! Command nodes.
//!
//! A command node carries a [`CommandBehavior`] in its meta data.
//! [`Session::execute_command`] checks enablement, lets the node's
//! [`CommandDecorator`]s veto, runs the behavior and broadcasts
//! `EXEC_COMMAND`. Failures go to the session's exception handler.

use std::sync::Arc;

use crate::broadcast::DispatchMode;
use crate::error::{PmError, Result};
use crate::event::{ChangeKind, ChangeMask};
use crate::logging::targets;
use crate::node::{NodeId, NodeKind};
use crate::session::{Redirect, Session};

/// What a command does.
pub trait CommandBehavior: Send + Sync {
    /// Run the command. A returned redirect is forwarded to the view connector.
    fn execute(&self, session: &Session, node: NodeId) -> Result<Option<Redirect>>;

    /// Navigation target handed to the exception handler on failure.
    fn error_navigation(&self) -> Option<&str> {
        None
    }
}

impl<F> CommandBehavior for F
where
    F: Fn(&Session, NodeId) -> Result<Option<Redirect>> + Send + Sync,
{
    fn execute(&self, session: &Session, node: NodeId) -> Result<Option<Redirect>> {
        self(session, node)
    }
}

/// A before/after hook around command execution with veto power.
pub trait CommandDecorator: Send + Sync {
    /// Called before the command runs. Returning `false` vetoes it.
    fn before_do(&self, session: &Session, node: NodeId) -> Result<bool>;

    fn after_do(&self, _session: &Session, _node: NodeId) -> Result<()> {
        Ok(())
    }
}

/// Result of [`Session::execute_command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The command ran.
    Executed { redirect: Option<Redirect> },
    /// A decorator vetoed.
    Vetoed,
    /// The command node is disabled.
    Disabled,
    /// The command failed; the error went to the exception handler.
    Failed { redirect: Option<Redirect> },
}

impl Session {
    /// Execute a command node.
    #[tracing::instrument(skip(self), target = "horizon_pm_core::session", level = "debug")]
    pub fn execute_command(&self, node: NodeId) -> Result<CommandOutcome> {
        self.ensure_kind(node, NodeKind::Command, "a command")?;
        let meta = self.meta(node)?;
        let Some(behavior) = meta.command().cloned() else {
            return Err(PmError::config(format!("command '{}' has no behavior", meta.path())));
        };

        if !self.is_enabled(node)? {
            return Ok(CommandOutcome::Disabled);
        }

        let decorators = self.with_node(node, |d| d.command_decorators.clone())?;
        for decorator in &decorators {
            if !decorator.before_do(self, node)? {
                tracing::debug!(target: targets::SESSION, ?node, "command vetoed");
                return Ok(CommandOutcome::Vetoed);
            }
        }

        let redirect = match behavior
            .execute(self, node)
            .and_then(|redirect| self.finish_command(node, &decorators).map(|()| redirect))
        {
            Ok(redirect) => redirect,
            Err(err) => {
                let redirect = self.handle_error(Some(node), &err, behavior.error_navigation());
                return Ok(CommandOutcome::Failed { redirect });
            }
        };

        if let Some(redirect) = &redirect {
            self.view_connector().redirect(redirect);
        }
        Ok(CommandOutcome::Executed { redirect })
    }

    fn finish_command(&self, node: NodeId, decorators: &[Arc<dyn CommandDecorator>]) -> Result<()> {
        for decorator in decorators {
            decorator.after_do(self, node)?;
        }
        self.broadcast(node, ChangeMask::EXEC_COMMAND, ChangeKind::Other, DispatchMode::Immediate)?;
        Ok(())
    }

    /// Add a decorator to a command node.
    pub fn add_command_decorator(
        &self,
        node: NodeId,
        decorator: Arc<dyn CommandDecorator>,
    ) -> Result<()> {
        self.ensure_kind(node, NodeKind::Command, "a command")?;
        self.with_node_mut(node, |d| d.command_decorators.push(decorator))
    }
}
