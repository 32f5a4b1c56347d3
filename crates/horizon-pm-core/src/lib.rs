//! Core systems for Horizon PM.
//!
//! This crate provides the runtime of a presentation-model framework: a tree
//! of nodes that sits between domain objects (beans) and a view, and
//! exposes titles, values, options, visibility and enablement for them.
//!
//! - **Meta Data**: Per-structural-position configuration, resolved once and shared
//! - **Node Tree**: Parent-child ownership, instance paths, dynamic properties
//! - **Caching**: Pluggable per-aspect cache strategies with cascade clears
//! - **Listeners**: Mask-filtered listeners with owning and weak registrations
//! - **Broadcasting**: Three-phase change broadcast with deferred delivery
//! - **Values**: Validated, decorated attribute writes with changed-state tracking
//! - **Identity**: One presentation model per bean, per bean factory
//! - **Commands**: Executable nodes with veto decorators and undo/redo history
//!
//! # Example
//!
//! ```
//! use horizon_pm_core::{CacheAspect, CacheDecl, ChangeMask, NodeDef, Session, Value};
//! use horizon_pm_core::listener_fn;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let session = Session::builder().private_registry().build();
//! let order = NodeDef::conversation("Order")
//!     .child(NodeDef::attribute("qty").cache(CacheAspect::Value, CacheDecl::on()).build())
//!     .build();
//! let root = session.create_root(&order).unwrap();
//! let qty = session.find_child(root, "qty").unwrap().unwrap();
//!
//! let changes = Arc::new(AtomicUsize::new(0));
//! let counter = changes.clone();
//! session
//!     .register_listener(
//!         qty,
//!         ChangeMask::VALUE,
//!         listener_fn(move |_, _| {
//!             counter.fetch_add(1, Ordering::SeqCst);
//!             Ok(())
//!         }),
//!         true,
//!     )
//!     .unwrap();
//!
//! assert!(session.set_value(qty, 5));
//! assert_eq!(session.value(qty).unwrap(), Value::Int(5));
//! assert!(session.is_changed(qty).unwrap());
//! assert_eq!(changes.load(Ordering::SeqCst), 1);
//! ```

pub mod broadcast;
pub mod cache;
pub mod command;
pub mod config;
pub mod definition;
mod error;
pub mod event;
pub mod history;
pub mod identity;
pub mod listener;
pub mod logging;
pub mod message;
pub mod meta;
pub mod node;
pub mod session;
pub mod value;

pub use broadcast::{BroadcastState, DispatchMode, PendingBroadcast};
pub use cache::{CacheAspect, CacheStrategy, CachedValue, LocalCache, NoCache, ScopedCache};
pub use command::{CommandBehavior, CommandDecorator, CommandOutcome};
pub use config::{CacheClear, CacheDecl, CacheMode, ConfigSource, NodeConfig, ValidationTiming};
pub use definition::{DefaultBehavior, ListenerFactory, NodeBehavior, NodeDef, NodeDefBuilder};
pub use error::{PmError, Result};
pub use event::{ChangeKind, ChangeMask, PmEvent, PmEventPostProcessor};
pub use history::ValueChange;
pub use identity::{BeanPmFactory, BeanPmHandle, IdentityCache};
pub use listener::{
    listener_fn, propagation_listener_fn, DispatchPhase, ListenerRegistry, ListenerSlot,
    ListenerSnapshot, PmEventListener,
};
pub use logging::{NodeTreeDebug, TreeFormatOptions, TreeStyle};
pub use message::{PmMessage, Severity, ValidationError};
pub use meta::{MetaData, MetaDataRegistry};
pub use node::{InvalidValue, NodeId, NodeKind, PmTree};
pub use session::{
    DefaultExceptionHandler, DetachedConnector, ExceptionHandler, MapResources, Redirect,
    Resources, Session, SessionBuilder, SessionConfig, ViewConnector, WeakSession,
};
pub use value::{
    RequiredValidator, Validator, Value, ValueChangeDecorator, ValueChangeState,
};
