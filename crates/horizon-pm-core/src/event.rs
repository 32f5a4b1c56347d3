//! Presentation-model events.
//!
//! A [`PmEvent`] describes one state change of one node. Events are created
//! by the broadcast engine (see [`crate::Session::broadcast`]) and handed to
//! the listeners registered on each affected node.
//!
//! # Post-processing
//!
//! Listeners may attach post-processing requests to an event. Each request
//! pairs a [`PmEventPostProcessor`] with a type-erased payload. The engine
//! reuses one event instance for the pre-process and handle phases of a
//! node, so a listener can register a request in the pre-process phase and
//! add to its payload in the handle phase. All requests run after the whole
//! subtree was handled.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::node::NodeId;
use crate::session::Session;

bitflags::bitflags! {
    /// Kinds of state change carried by an event.
    ///
    /// Listeners register with a mask and only receive events whose mask
    /// intersects it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChangeMask: u32 {
        /// The value of an attribute changed.
        const VALUE = 1 << 0;
        /// The option set of an attribute changed.
        const OPTIONS = 1 << 1;
        /// The title changed.
        const TITLE = 1 << 2;
        /// The tooltip changed.
        const TOOLTIP = 1 << 3;
        /// The visibility changed.
        const VISIBILITY = 1 << 4;
        /// The enablement changed.
        const ENABLEMENT = 1 << 5;
        /// The set of child nodes changed.
        const CHILD_NODES = 1 << 6;
        /// The changed-state flag flipped.
        const CHANGED_STATE = 1 << 7;
        /// The validation state changed.
        const VALIDATION_STATE = 1 << 8;
        /// A command was executed.
        const EXEC_COMMAND = 1 << 9;
        /// The bean behind a node was replaced.
        const BEAN = 1 << 10;

        /// Every aspect-related change.
        const ALL_ASPECTS = Self::VALUE.bits()
            | Self::OPTIONS.bits()
            | Self::TITLE.bits()
            | Self::TOOLTIP.bits()
            | Self::VISIBILITY.bits()
            | Self::ENABLEMENT.bits()
            | Self::CHILD_NODES.bits();
    }
}

/// Why a change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChangeKind {
    /// A value was written.
    #[default]
    Value,
    /// The data behind a subtree was replaced; every cached aspect is stale.
    Reload,
    /// A previous value change was undone.
    Undo,
    /// An undone value change was applied again.
    Redo,
    /// Anything else (command execution, state flips).
    Other,
}

/// Receives post-processing requests after a broadcast handled its subtree.
pub trait PmEventPostProcessor: Send + Sync {
    /// Process one request. `payload` is the value registered with the request,
    /// including anything listeners added to it later.
    fn post_process(
        &self,
        session: &Session,
        event: &PmEvent,
        payload: &mut (dyn Any + Send + Sync),
    ) -> Result<()>;
}

struct PostProcessRequest {
    processor: Arc<dyn PmEventPostProcessor>,
    payload: Box<dyn Any + Send + Sync>,
}

/// A state change notification for one node.
pub struct PmEvent {
    source: NodeId,
    node: NodeId,
    mask: ChangeMask,
    kind: ChangeKind,
    propagation: bool,
    post_processing: Mutex<Vec<PostProcessRequest>>,
}

impl PmEvent {
    /// Create an event for `node`, triggered by a change of `source`.
    pub fn new(source: NodeId, node: NodeId, mask: ChangeMask, kind: ChangeKind) -> Self {
        Self {
            source,
            node,
            mask,
            kind,
            propagation: false,
            post_processing: Mutex::new(Vec::new()),
        }
    }

    /// Create a propagation event, delivered to the ancestors of `node`.
    pub fn propagation(source: NodeId, node: NodeId, mask: ChangeMask, kind: ChangeKind) -> Self {
        Self {
            propagation: true,
            ..Self::new(source, node, mask, kind)
        }
    }

    /// The node whose change triggered the broadcast.
    pub fn source(&self) -> NodeId {
        self.source
    }

    /// The node this event is about.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The change mask.
    pub fn mask(&self) -> ChangeMask {
        self.mask
    }

    /// The change kind.
    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    /// Whether this event travels up the ancestor chain.
    pub fn is_propagation(&self) -> bool {
        self.propagation
    }

    /// Whether the event is about a reload of the data behind the node.
    pub fn is_reload(&self) -> bool {
        self.kind == ChangeKind::Reload
    }

    /// Register a post-processing request.
    ///
    /// A processor is registered at most once per event; registering it again
    /// keeps the first payload and returns `false`.
    pub fn add_post_processing<P>(
        &self,
        processor: Arc<dyn PmEventPostProcessor>,
        payload: P,
    ) -> bool
    where
        P: Any + Send + Sync,
    {
        let mut requests = self.post_processing.lock();
        if requests
            .iter()
            .any(|r| std::ptr::addr_eq(Arc::as_ptr(&r.processor), Arc::as_ptr(&processor)))
        {
            return false;
        }
        requests.push(PostProcessRequest {
            processor,
            payload: Box::new(payload),
        });
        true
    }

    /// Access the payload registered for `processor`, if any and of type `P`.
    pub fn with_post_processing_payload<P, R, F>(
        &self,
        processor: &Arc<dyn PmEventPostProcessor>,
        f: F,
    ) -> Option<R>
    where
        P: Any,
        F: FnOnce(&mut P) -> R,
    {
        let mut requests = self.post_processing.lock();
        requests
            .iter_mut()
            .find(|r| std::ptr::addr_eq(Arc::as_ptr(&r.processor), Arc::as_ptr(processor)))
            .and_then(|r| r.payload.downcast_mut::<P>())
            .map(f)
    }

    /// Whether any post-processing request was registered.
    pub fn has_post_processing(&self) -> bool {
        !self.post_processing.lock().is_empty()
    }

    /// Run and drain every post-processing request in registration order.
    pub(crate) fn run_post_processing(&self, session: &Session) -> Result<()> {
        // Taken out of the lock so processors may inspect the event.
        let requests = std::mem::take(&mut *self.post_processing.lock());
        for mut request in requests {
            request
                .processor
                .post_process(session, self, request.payload.as_mut())?;
        }
        Ok(())
    }
}

impl fmt::Debug for PmEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmEvent")
            .field("source", &self.source)
            .field("node", &self.node)
            .field("mask", &self.mask)
            .field("kind", &self.kind)
            .field("propagation", &self.propagation)
            .field("post_processing", &self.post_processing.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl PmEventPostProcessor for Noop {
        fn post_process(
            &self,
            _session: &Session,
            _event: &PmEvent,
            _payload: &mut (dyn Any + Send + Sync),
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn all_aspects_covers_aspect_bits_only() {
        assert!(ChangeMask::ALL_ASPECTS.contains(ChangeMask::VALUE | ChangeMask::CHILD_NODES));
        assert!(!ChangeMask::ALL_ASPECTS.contains(ChangeMask::EXEC_COMMAND));
    }

    #[test]
    fn payload_accumulates_for_same_processor() {
        let event = PmEvent::new(
            NodeId::default(),
            NodeId::default(),
            ChangeMask::VALUE,
            ChangeKind::Value,
        );
        let processor: Arc<dyn PmEventPostProcessor> = Arc::new(Noop);

        assert!(event.add_post_processing(processor.clone(), vec![1]));
        assert!(!event.add_post_processing(processor.clone(), vec![99]));

        event.with_post_processing_payload(&processor, |ids: &mut Vec<i32>| ids.push(2));
        let ids = event.with_post_processing_payload(&processor, |ids: &mut Vec<i32>| ids.clone());
        assert_eq!(ids, Some(vec![1, 2]));
        assert!(event.has_post_processing());
    }

    #[test]
    fn propagation_event_is_flagged() {
        let event = PmEvent::propagation(
            NodeId::default(),
            NodeId::default(),
            ChangeMask::VALUE,
            ChangeKind::Reload,
        );
        assert!(event.is_propagation());
        assert!(event.is_reload());
    }
}
