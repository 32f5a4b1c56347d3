//! Integration tests for the presentation-model tree.

use horizon_pm_core::{
    listener_fn, propagation_listener_fn, CacheAspect, CacheClear, CacheDecl, ChangeKind,
    ChangeMask, DispatchMode, MetaDataRegistry, NodeBehavior, NodeDef, NodeId, PmError, Result,
    Session, ValidationError, ValidationTiming, Validator, Value, ValueChangeDecorator,
    ValueChangeState,
};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn session() -> Session {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Session::builder().private_registry().build()
}

fn counter(session: &Session, node: NodeId, mask: ChangeMask) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    session
        .register_listener(
            node,
            mask,
            listener_fn(move |_, _| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
            true,
        )
        .unwrap();
    count
}

/// Title behavior that counts computations.
struct CountingTitle(Arc<AtomicUsize>);

impl NodeBehavior for CountingTitle {
    fn title(&self, _session: &Session, _node: NodeId) -> Option<String> {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        Some(format!("title #{n}"))
    }
}

struct NonNegative;

impl Validator for NonNegative {
    fn validate(
        &self,
        _session: &Session,
        _node: NodeId,
        value: &Value,
    ) -> std::result::Result<(), ValidationError> {
        match value.as_int() {
            Some(n) if n < 0 => Err(ValidationError::new("qty.negative").with_arg(n)),
            _ => Ok(()),
        }
    }
}

// =========================================================================
// Meta data
// =========================================================================

#[test]
fn test_concurrent_resolution_is_idempotent() {
    let registry = MetaDataRegistry::new();
    let def = NodeDef::conversation("Order")
        .child(NodeDef::attribute("qty").build())
        .child(NodeDef::attribute("price").build())
        .build();

    let resolved: Vec<_> = (0..64)
        .into_par_iter()
        .map(|_| registry.resolve("", &def).unwrap())
        .collect();

    let first = &resolved[0];
    assert!(resolved.iter().all(|meta| Arc::ptr_eq(meta, first)));
    assert_eq!(registry.len(), 3);
    let qty = registry.get("Order/qty").unwrap();
    assert!(Arc::ptr_eq(&qty, &first.children()[0]));
}

#[test]
fn test_nodes_at_same_position_share_meta_data() {
    let registry = Arc::new(MetaDataRegistry::new());
    let first = Session::builder().registry(registry.clone()).build();
    let second = Session::builder().registry(registry.clone()).build();
    let def = NodeDef::conversation("Order")
        .child(NodeDef::attribute("qty").build())
        .build();
    let a = first.create_root(&def).unwrap();
    let b = second.create_root(&def).unwrap();

    let qty_a = first.find_child(a, "qty").unwrap().unwrap();
    let qty_b = second.find_child(b, "qty").unwrap().unwrap();
    assert!(Arc::ptr_eq(
        &first.meta(qty_a).unwrap(),
        &second.meta(qty_b).unwrap()
    ));
}

#[test]
fn test_second_root_at_same_path_is_rejected() {
    let session = session();
    let calls = Arc::new(AtomicUsize::new(0));
    let def = NodeDef::conversation("Order")
        .child(
            NodeDef::attribute("qty")
                .cache(CacheAspect::Title, CacheDecl::scoped())
                .behavior(CountingTitle(calls.clone()))
                .build(),
        )
        .build();
    let root = session.create_root(&def).unwrap();
    let count = session.with_tree(|tree| tree.len());

    let err = session.create_root(&def).unwrap_err();
    assert!(err.is_config_error());
    assert_eq!(session.with_tree(|tree| tree.len()), count);

    // The scoped title of the existing root is not shadowed.
    let qty = session.find_child(root, "qty").unwrap().unwrap();
    session.begin_request();
    session.title(qty).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    session.end_request();
}

// =========================================================================
// Caching
// =========================================================================

#[test]
fn test_local_cache_recomputes_once_after_clear() {
    let session = session();
    let calls = Arc::new(AtomicUsize::new(0));
    let def = NodeDef::conversation("Order")
        .child(
            NodeDef::attribute("qty")
                .cache(CacheAspect::Title, CacheDecl::on())
                .behavior(CountingTitle(calls.clone()))
                .build(),
        )
        .build();
    let root = session.create_root(&def).unwrap();
    let qty = session.find_child(root, "qty").unwrap().unwrap();

    assert_eq!(session.title(qty).unwrap(), "title #1");
    assert_eq!(session.title(qty).unwrap(), "title #1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    session.clear_cache(qty, &[CacheAspect::Title]).unwrap();
    assert_eq!(session.title(qty).unwrap(), "title #2");
    assert_eq!(session.title(qty).unwrap(), "title #2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // A broadcast touching the aspect clears it as well.
    session
        .broadcast(root, ChangeMask::TITLE, ChangeKind::Other, DispatchMode::Immediate)
        .unwrap();
    assert_eq!(session.title(qty).unwrap(), "title #3");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_uncached_aspect_recomputes_every_read() {
    let session = session();
    let calls = Arc::new(AtomicUsize::new(0));
    let root = session
        .create_root(
            &NodeDef::conversation("Order")
                .behavior(CountingTitle(calls.clone()))
                .build(),
        )
        .unwrap();

    session.title(root).unwrap();
    session.title(root).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(session.cache_strategy(root, CacheAspect::Title).unwrap().name(), "none");
}

#[test]
fn test_request_bound_caches_expire_with_request() {
    let session = session();
    let scoped_calls = Arc::new(AtomicUsize::new(0));
    let local_calls = Arc::new(AtomicUsize::new(0));
    let def = NodeDef::conversation("Order")
        .child(
            NodeDef::attribute("scoped")
                .cache(CacheAspect::Title, CacheDecl::scoped())
                .behavior(CountingTitle(scoped_calls.clone()))
                .build(),
        )
        .child(
            NodeDef::attribute("local")
                .cache(CacheAspect::Title, CacheDecl::on().clear(CacheClear::OnRequest))
                .behavior(CountingTitle(local_calls.clone()))
                .build(),
        )
        .build();
    let root = session.create_root(&def).unwrap();
    let scoped = session.find_child(root, "scoped").unwrap().unwrap();
    let local = session.find_child(root, "local").unwrap().unwrap();

    session.begin_request();
    for _ in 0..3 {
        session.title(scoped).unwrap();
        session.title(local).unwrap();
    }
    assert_eq!(scoped_calls.load(Ordering::SeqCst), 1);
    assert_eq!(local_calls.load(Ordering::SeqCst), 1);
    assert!(session.request_value("title:Order/scoped").is_some());

    session.end_request();
    session.begin_request();
    session.title(scoped).unwrap();
    session.title(local).unwrap();
    assert_eq!(scoped_calls.load(Ordering::SeqCst), 2);
    assert_eq!(local_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_observed_value_change_clears_dependent_cache() {
    let session = session();
    let calls = Arc::new(AtomicUsize::new(0));
    let def = NodeDef::conversation("Order")
        .child(NodeDef::attribute("qty").build())
        .child(
            NodeDef::attribute("total")
                .cache(CacheAspect::Title, CacheDecl::on().observe("qty"))
                .behavior(CountingTitle(calls.clone()))
                .build(),
        )
        .build();
    let root = session.create_root(&def).unwrap();
    let qty = session.find_child(root, "qty").unwrap().unwrap();
    let total = session.find_child(root, "total").unwrap().unwrap();

    session.title(total).unwrap();
    session.title(total).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(session.set_value(qty, 4));
    session.title(total).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_missing_observed_node_fails_creation_without_leftovers() {
    let session = session();
    let def = NodeDef::conversation("Order")
        .child(
            NodeDef::attribute("total")
                .cache(CacheAspect::Title, CacheDecl::on().observe("nowhere"))
                .build(),
        )
        .build();

    let err = session.create_root(&def).unwrap_err();
    assert!(matches!(err, PmError::ObservedNodeNotFound { ref expr, .. } if expr == "nowhere"));
    assert_eq!(session.with_tree(|tree| tree.len()), 0);
}

// =========================================================================
// Identity
// =========================================================================

#[derive(Debug, PartialEq, Eq, Hash)]
struct Line {
    sku: u32,
}

#[test]
fn test_bean_factory_returns_one_node_per_bean() {
    let session = Session::builder()
        .private_registry()
        .debug_identity_checks(true)
        .build();
    let def = NodeDef::conversation("Order")
        .child(NodeDef::collection("lines").build())
        .build();
    let root = session.create_root(&def).unwrap();
    let lines = session.find_child(root, "lines").unwrap().unwrap();
    let structure_changes = counter(&session, lines, ChangeMask::CHILD_NODES);

    let factory = session.bean_factory::<Line>(
        NodeDef::bean("Line")
            .child(NodeDef::attribute("qty").build())
            .build(),
    );
    let bean = Arc::new(Line { sku: 7 });
    let first = factory.get_or_create(&session, lines, bean.clone()).unwrap();
    let again = factory.get_or_create(&session, lines, bean.clone()).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(session.bean::<Line>(first.node()).unwrap(), Some(bean.clone()));

    // An equal bean finds the existing node.
    let equal = factory
        .get_or_create(&session, lines, Arc::new(Line { sku: 7 }))
        .unwrap();
    assert_eq!(equal.node(), first.node());

    let other = factory
        .get_or_create(&session, lines, Arc::new(Line { sku: 8 }))
        .unwrap();
    assert_ne!(other.node(), first.node());
    assert_eq!(session.children(lines).unwrap().len(), 2);
    assert_eq!(structure_changes.load(Ordering::SeqCst), 2);

    let path = session.path(first.node()).unwrap();
    assert!(path.starts_with("Order/lines/Line["), "unexpected path {path}");
    assert!(session.find(first.node(), "qty").unwrap().is_some());
}

#[test]
fn test_dropping_handle_destroys_node_and_allows_recreation() {
    let session = session();
    let root = session
        .create_root(
            &NodeDef::conversation("Order")
                .child(NodeDef::collection("lines").build())
                .build(),
        )
        .unwrap();
    let lines = session.find_child(root, "lines").unwrap().unwrap();
    let factory = session.bean_factory::<Line>(NodeDef::bean("Line").build());
    let bean = Arc::new(Line { sku: 1 });

    let handle = factory.get_or_create(&session, lines, bean.clone()).unwrap();
    let node = handle.node();
    drop(handle);

    assert!(!session.contains(node));
    assert!(factory.find(&bean).is_none());
    assert!(matches!(session.title(node), Err(PmError::InvalidNode)));

    let recreated = factory.get_or_create(&session, lines, bean.clone()).unwrap();
    assert_ne!(recreated.node(), node);
    assert!(session.contains(recreated.node()));

    assert!(factory.cache().remove_bean(&bean));
    assert!(factory.find(&bean).is_none());
}

// =========================================================================
// Listeners and broadcasting
// =========================================================================

#[test]
fn test_listener_mask_filters_events() {
    let session = session();
    let root = session
        .create_root(
            &NodeDef::conversation("Order").child(NodeDef::attribute("qty").build()).build(),
        )
        .unwrap();
    let qty = session.find_child(root, "qty").unwrap().unwrap();

    let titles = counter(&session, qty, ChangeMask::TITLE);
    let values = counter(&session, qty, ChangeMask::VALUE);

    assert!(session.set_value(qty, 3));
    assert_eq!(values.load(Ordering::SeqCst), 1);
    assert_eq!(titles.load(Ordering::SeqCst), 0);

    session
        .broadcast(qty, ChangeMask::TITLE, ChangeKind::Other, DispatchMode::Immediate)
        .unwrap();
    assert_eq!(titles.load(Ordering::SeqCst), 1);
    assert_eq!(values.load(Ordering::SeqCst), 1);
}

#[test]
fn test_propagation_only_reaches_opted_in_listeners() {
    let session = session();
    let root = session
        .create_root(
            &NodeDef::conversation("Order").child(NodeDef::attribute("qty").build()).build(),
        )
        .unwrap();
    let qty = session.find_child(root, "qty").unwrap().unwrap();

    let plain = counter(&session, root, ChangeMask::VALUE);
    let sources = Arc::new(Mutex::new(Vec::new()));
    let sink = sources.clone();
    session
        .register_listener(
            root,
            ChangeMask::VALUE,
            propagation_listener_fn(move |_, event| {
                if event.is_propagation() {
                    sink.lock().push(event.source());
                }
                Ok(())
            }),
            true,
        )
        .unwrap();

    assert!(session.set_value(qty, 1));
    assert_eq!(plain.load(Ordering::SeqCst), 0);
    assert_eq!(*sources.lock(), vec![qty]);
}

#[test]
fn test_weak_listener_is_reclaimed_before_dispatch() {
    let session = session();
    let root = session
        .create_root(&NodeDef::conversation("Order").build())
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let listener = listener_fn(move |_, _| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    session
        .register_listener(root, ChangeMask::TITLE, listener.clone(), false)
        .unwrap();

    session
        .broadcast(root, ChangeMask::TITLE, ChangeKind::Other, DispatchMode::Immediate)
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(listener);
    session
        .broadcast(root, ChangeMask::TITLE, ChangeKind::Other, DispatchMode::Immediate)
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_deferred_broadcast_flushes_exactly_once() {
    let session = session();
    let def = NodeDef::conversation("Order")
        .child(
            NodeDef::bean("Customer")
                .defer_events()
                .child(NodeDef::attribute("name").build())
                .build(),
        )
        .build();
    let root = session.create_root(&def).unwrap();
    let customer = session.find_child(root, "Customer").unwrap().unwrap();
    let name = session.find_child(customer, "name").unwrap().unwrap();
    let reloads = counter(&session, name, ChangeMask::BEAN);

    session.set_bean(root, Arc::new(1u32)).unwrap();
    assert_eq!(reloads.load(Ordering::SeqCst), 0);
    let pending = session.pending_broadcast(customer).unwrap().unwrap();
    assert_eq!(pending.source, root);
    assert_eq!(pending.kind, ChangeKind::Reload);

    assert_eq!(session.flush_deferred_events(root).unwrap(), 1);
    assert_eq!(reloads.load(Ordering::SeqCst), 1);

    assert_eq!(session.flush_deferred_events(root).unwrap(), 0);
    session.bean_any(customer).unwrap();
    assert_eq!(reloads.load(Ordering::SeqCst), 1);
}

#[test]
fn test_destroy_notifies_parent_and_invalidates_ids() {
    let session = session();
    let root = session
        .create_root(&NodeDef::conversation("Order").build())
        .unwrap();
    let structure = counter(&session, root, ChangeMask::CHILD_NODES);

    let extra = session
        .add_child(root, &NodeDef::attribute("note").build())
        .unwrap();
    assert_eq!(structure.load(Ordering::SeqCst), 1);
    assert_eq!(session.child_nodes(root).unwrap(), vec![extra]);

    assert!(session
        .add_child(root, &NodeDef::attribute("note").build())
        .unwrap_err()
        .is_config_error());

    session.destroy_node(extra).unwrap();
    assert_eq!(structure.load(Ordering::SeqCst), 2);
    assert!(session.child_nodes(root).unwrap().is_empty());
    assert!(matches!(session.value(extra), Err(PmError::InvalidNode)));
}

// =========================================================================
// Value changes
// =========================================================================

fn order_with_qty(session: &Session, timing: ValidationTiming) -> (NodeId, NodeId) {
    let def = NodeDef::conversation("Order")
        .child(
            NodeDef::attribute("qty")
                .default_value(0)
                .validation(timing)
                .validator(NonNegative)
                .build(),
        )
        .build();
    let root = session.create_root(&def).unwrap();
    let qty = session.find_child(root, "qty").unwrap().unwrap();
    (root, qty)
}

#[test]
fn test_rejected_write_leaves_state_untouched() {
    let session = session();
    let (_, qty) = order_with_qty(&session, ValidationTiming::BeforeWrite);
    assert!(session.set_value(qty, 3));
    session.reset_changed_state(qty).unwrap();
    let values = counter(&session, qty, ChangeMask::VALUE);

    let state = session.change_value(qty, Value::Int(-2)).unwrap();
    assert_eq!(state, ValueChangeState::Rejected);
    assert_eq!(session.value(qty).unwrap(), Value::Int(3));
    assert!(!session.is_changed(qty).unwrap());
    assert_eq!(values.load(Ordering::SeqCst), 0);

    let messages = session.messages_for(qty);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, "qty.negative");
    assert_eq!(messages[0].args, vec!["-2".to_string()]);

    // The rejected input stays visible until a valid write.
    assert_eq!(session.value_as_string(qty).unwrap(), "-2");
    assert!(session.set_value(qty, 5));
    assert!(session.invalid_value(qty).unwrap().is_none());
    assert!(session.messages_for(qty).is_empty());
}

#[test]
fn test_after_write_validation_keeps_value_and_reports() {
    let session = session();
    let (_, qty) = order_with_qty(&session, ValidationTiming::AfterWrite);

    let state = session.change_value(qty, Value::Int(-1)).unwrap();
    assert_eq!(state, ValueChangeState::Changed);
    assert_eq!(session.value(qty).unwrap(), Value::Int(-1));
    assert_eq!(session.messages_for(qty).len(), 1);
}

#[test]
fn test_explicit_validation_covers_subtree() {
    let session = session();
    let (root, qty) = order_with_qty(&session, ValidationTiming::Explicit);
    assert!(session.set_value(qty, -4));
    assert!(session.messages_for(qty).is_empty());

    assert!(!session.validate(root).unwrap());
    assert_eq!(session.messages_for(qty).len(), 1);
}

#[test]
fn test_unchanged_write_is_a_noop() {
    let session = session();
    let (_, qty) = order_with_qty(&session, ValidationTiming::Explicit);
    let values = counter(&session, qty, ChangeMask::VALUE);

    assert_eq!(
        session.change_value(qty, Value::Int(0)).unwrap(),
        ValueChangeState::Unchanged
    );
    assert!(session.set_value(qty, 0));
    assert_eq!(values.load(Ordering::SeqCst), 0);
}

#[test]
fn test_decorator_veto_rejects_write() {
    struct Freeze;
    impl ValueChangeDecorator for Freeze {
        fn before_do(
            &self,
            _session: &Session,
            _node: NodeId,
            _old: &Value,
            new: &Value,
        ) -> Result<bool> {
            Ok(new.as_int() != Some(13))
        }
    }

    let session = session();
    let (_, qty) = order_with_qty(&session, ValidationTiming::Explicit);
    session.add_value_decorator(qty, Arc::new(Freeze)).unwrap();

    assert!(!session.set_value(qty, 13));
    assert_eq!(session.value(qty).unwrap(), Value::Int(0));
    assert!(session.set_value(qty, 12));
    assert_eq!(session.value(qty).unwrap(), Value::Int(12));
}

#[test]
fn test_read_only_attribute_rejects_write() {
    let session = session();
    let root = session
        .create_root(
            &NodeDef::conversation("Order")
                .child(NodeDef::attribute("id").read_only().build())
                .build(),
        )
        .unwrap();
    let id = session.find_child(root, "id").unwrap().unwrap();

    assert!(!session.set_value(id, "A-1"));
    let messages = session.messages_for(id);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, "pm.validation.read_only");
    assert_eq!(messages[0].args, vec!["id".to_string()]);
}

#[test]
fn test_changed_flag_follows_original_value() {
    let session = session();
    let (root, qty) = order_with_qty(&session, ValidationTiming::Explicit);
    let flips = counter(&session, qty, ChangeMask::CHANGED_STATE);

    assert!(session.set_value(qty, 2));
    assert!(session.is_changed(qty).unwrap());
    assert!(session.is_changed(root).unwrap());

    assert!(session.set_value(qty, 5));
    assert_eq!(flips.load(Ordering::SeqCst), 1);

    assert!(session.set_value(qty, 0));
    assert!(!session.is_changed(root).unwrap());
    assert_eq!(flips.load(Ordering::SeqCst), 2);
}

#[test]
fn test_undo_redo_restore_values() {
    let session = session();
    let (_, qty) = order_with_qty(&session, ValidationTiming::Explicit);
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = kinds.clone();
    session
        .register_listener(
            qty,
            ChangeMask::VALUE,
            listener_fn(move |_, event| {
                sink.lock().push(event.kind());
                Ok(())
            }),
            true,
        )
        .unwrap();

    assert!(session.set_value(qty, 1));
    assert!(session.set_value(qty, 2));
    assert!(session.undo().unwrap());
    assert_eq!(session.value(qty).unwrap(), Value::Int(1));
    assert!(session.undo().unwrap());
    assert_eq!(session.value(qty).unwrap(), Value::Int(0));
    assert!(!session.is_changed(qty).unwrap());
    assert!(!session.undo().unwrap());

    assert!(session.redo().unwrap());
    assert_eq!(session.value(qty).unwrap(), Value::Int(1));
    assert!(session.can_redo());

    assert_eq!(
        *kinds.lock(),
        vec![
            ChangeKind::Value,
            ChangeKind::Value,
            ChangeKind::Undo,
            ChangeKind::Undo,
            ChangeKind::Redo
        ]
    );
}
