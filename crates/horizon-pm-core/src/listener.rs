//! Event listeners and the per-node listener registry.
//!
//! Each node owns a [`ListenerRegistry`]: a dense list of slots holding
//! listeners either strongly (the registry keeps them alive) or weakly (the
//! registration disappears with the listener). Removed and dead slots turn
//! into [`ListenerSlot::Empty`] and are compacted lazily on the next append.
//!
//! Dispatch always works on a snapshot: the live listeners matching an event
//! are collected first and called afterwards, so a listener may register or
//! remove listeners (or destroy nodes) while an event is delivered.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::Result;
use crate::event::{ChangeMask, PmEvent};
use crate::session::Session;

/// Receives [`PmEvent`]s.
pub trait PmEventListener: Send + Sync {
    /// Handle an event.
    fn handle(&self, session: &Session, event: &PmEvent) -> Result<()>;

    /// Called in the pre-process phase if [`wants_pre_process`](Self::wants_pre_process)
    /// returns `true`. The same event instance is later passed to `handle`.
    fn pre_process(&self, _session: &Session, _event: &PmEvent) -> Result<()> {
        Ok(())
    }

    fn wants_pre_process(&self) -> bool {
        false
    }

    /// Whether this listener receives propagation events instead of regular ones.
    fn receives_propagation(&self) -> bool {
        false
    }
}

/// A listener backed by a closure.
pub struct FnListener<F> {
    f: F,
    propagation: bool,
}

impl<F> PmEventListener for FnListener<F>
where
    F: Fn(&Session, &PmEvent) -> Result<()> + Send + Sync,
{
    fn handle(&self, session: &Session, event: &PmEvent) -> Result<()> {
        (self.f)(session, event)
    }

    fn receives_propagation(&self) -> bool {
        self.propagation
    }
}

/// Wrap a closure as a regular listener.
pub fn listener_fn<F>(f: F) -> Arc<dyn PmEventListener>
where
    F: Fn(&Session, &PmEvent) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnListener { f, propagation: false })
}

/// Wrap a closure as a propagation listener.
pub fn propagation_listener_fn<F>(f: F) -> Arc<dyn PmEventListener>
where
    F: Fn(&Session, &PmEvent) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnListener { f, propagation: true })
}

/// Dispatch phase of a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    /// Only listeners that asked for pre-processing are called.
    PreProcess,
    /// Every matching listener is called.
    Handle,
}

/// One registration.
pub enum ListenerSlot {
    /// A removed or reclaimed registration.
    Empty,
    /// Kept alive by the registry.
    Hard {
        mask: ChangeMask,
        listener: Arc<dyn PmEventListener>,
    },
    /// Kept alive by its owner only.
    Weak {
        mask: ChangeMask,
        listener: Weak<dyn PmEventListener>,
    },
}

impl ListenerSlot {
    fn is_vacant(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Hard { .. } => false,
            Self::Weak { listener, .. } => listener.strong_count() == 0,
        }
    }

    fn holds(&self, target: &Arc<dyn PmEventListener>) -> bool {
        let target = Arc::as_ptr(target);
        match self {
            Self::Empty => false,
            Self::Hard { listener, .. } => std::ptr::addr_eq(Arc::as_ptr(listener), target),
            Self::Weak { listener, .. } => std::ptr::addr_eq(listener.as_ptr(), target),
        }
    }

    fn live(&self) -> Option<(ChangeMask, Arc<dyn PmEventListener>)> {
        match self {
            Self::Empty => None,
            Self::Hard { mask, listener } => Some((*mask, listener.clone())),
            Self::Weak { mask, listener } => listener.upgrade().map(|l| (*mask, l)),
        }
    }
}

impl fmt::Debug for ListenerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Hard { mask, .. } => f.debug_struct("Hard").field("mask", mask).finish(),
            Self::Weak { mask, listener } => f
                .debug_struct("Weak")
                .field("mask", mask)
                .field("alive", &(listener.strong_count() > 0))
                .finish(),
        }
    }
}

/// Listener registrations of one node.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    slots: Vec<ListenerSlot>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener and keep it alive.
    pub fn add_listener_ref(&mut self, mask: ChangeMask, listener: Arc<dyn PmEventListener>) {
        self.append(ListenerSlot::Hard { mask, listener });
    }

    /// Register a listener without keeping it alive.
    pub fn add_weak_listener_ref(&mut self, mask: ChangeMask, listener: &Arc<dyn PmEventListener>) {
        self.append(ListenerSlot::Weak {
            mask,
            listener: Arc::downgrade(listener),
        });
    }

    fn append(&mut self, slot: ListenerSlot) {
        if let Some(last) = self.slots.last_mut() {
            if matches!(last, ListenerSlot::Empty) {
                *last = slot;
                return;
            }
        }
        if self.slots.iter().any(ListenerSlot::is_vacant) {
            self.compact();
        }
        self.slots.push(slot);
    }

    /// Remove every registration of `listener`.
    ///
    /// Returns the number of active registrations left.
    pub fn remove_listener_ref(&mut self, listener: &Arc<dyn PmEventListener>) -> usize {
        for slot in &mut self.slots {
            if slot.holds(listener) {
                *slot = ListenerSlot::Empty;
            }
        }
        self.active_count()
    }

    /// Number of registrations whose listener is alive.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| !slot.is_vacant()).count()
    }

    /// Number of slots, including empty and dead ones.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop empty and dead slots.
    pub fn compact(&mut self) {
        self.slots.retain(|slot| !slot.is_vacant());
    }

    /// The live listeners that should receive `event` in `phase`.
    pub fn snapshot(&self, event: &PmEvent, phase: DispatchPhase) -> ListenerSnapshot {
        let listeners = self
            .slots
            .iter()
            .filter_map(ListenerSlot::live)
            .filter(|(mask, listener)| {
                mask.intersects(event.mask())
                    && listener.receives_propagation() == event.is_propagation()
                    && (phase == DispatchPhase::Handle || listener.wants_pre_process())
            })
            .map(|(_, listener)| listener)
            .collect();
        ListenerSnapshot { listeners, phase }
    }

    /// Deliver `event` to the matching listeners of this registry.
    pub fn fire_event(
        &self,
        session: &Session,
        event: &PmEvent,
        phase: DispatchPhase,
    ) -> Result<()> {
        self.snapshot(event, phase).fire_event(session, event)
    }
}

/// Listeners collected for one event and phase.
///
/// Holding a snapshot keeps its listeners alive, including weakly
/// registered ones, until delivery is done.
pub struct ListenerSnapshot {
    listeners: Vec<Arc<dyn PmEventListener>>,
    phase: DispatchPhase,
}

impl ListenerSnapshot {
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Call every listener for the snapshot's phase; stops at the first error.
    pub fn fire_event(&self, session: &Session, event: &PmEvent) -> Result<()> {
        for listener in &self.listeners {
            match self.phase {
                DispatchPhase::PreProcess => listener.pre_process(session, event)?,
                DispatchPhase::Handle => listener.handle(session, event)?,
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ListenerSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSnapshot")
            .field("listeners", &self.listeners.len())
            .field("phase", &self.phase)
            .finish()
    }
}
