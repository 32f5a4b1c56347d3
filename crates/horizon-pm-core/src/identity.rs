//! Bean to presentation-model identity mapping.
//!
//! An [`IdentityCache`] guarantees at most one live wrapper per bean. Beans
//! are matched by reference identity first and by value equality second.
//! Both sides are held weakly: the cache never keeps a bean or a wrapper
//! alive, and entries whose bean or wrapper is gone read as misses until
//! they are compacted away.
//!
//! [`BeanPmFactory`] builds on the cache to hand out one node per bean below
//! a collection node.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::definition::NodeDef;
use crate::error::{PmError, Result};
use crate::logging::targets;
use crate::node::NodeId;
use crate::session::{Session, WeakSession};

fn addr<T>(ptr: *const T) -> usize {
    ptr as *const () as usize
}

struct Entry<B, P> {
    bean: Weak<B>,
    wrapper: Weak<P>,
}

impl<B, P> Entry<B, P> {
    fn live_wrapper(&self) -> Option<Arc<P>> {
        if self.bean.strong_count() == 0 {
            return None;
        }
        self.wrapper.upgrade()
    }

    fn is_dead(&self) -> bool {
        self.bean.strong_count() == 0 || self.wrapper.strong_count() == 0
    }
}

struct IdentityMaps<B, P> {
    by_identity: HashMap<usize, Entry<B, P>>,
    by_equality: HashMap<u64, Vec<Entry<B, P>>>,
    /// Wrapper address to bean address.
    reverse: HashMap<usize, usize>,
    /// Entry count at which `add` compacts.
    compact_at: usize,
}

/// Smallest entry count that triggers compaction on `add`.
const MIN_COMPACT_AT: usize = 64;

impl<B: Eq, P> IdentityMaps<B, P> {
    fn find_equal(&self, hash: u64, bean: &B) -> Option<(usize, Arc<P>)> {
        self.by_equality.get(&hash)?.iter().find_map(|entry| {
            let candidate = entry.bean.upgrade()?;
            if *candidate != *bean {
                return None;
            }
            let wrapper = entry.wrapper.upgrade()?;
            Some((addr(Arc::as_ptr(&candidate)), wrapper))
        })
    }

    fn remove_identity(&mut self, bean_addr: usize) -> bool {
        let Some(entry) = self.by_identity.remove(&bean_addr) else {
            return false;
        };
        self.reverse.remove(&addr(entry.wrapper.as_ptr()));
        for bucket in self.by_equality.values_mut() {
            bucket.retain(|e| addr(e.bean.as_ptr()) != bean_addr);
        }
        self.by_equality.retain(|_, bucket| !bucket.is_empty());
        true
    }

    /// Drop dead entries and return how many were removed.
    fn compact(&mut self) -> usize {
        let dead: Vec<usize> = self
            .by_identity
            .iter()
            .filter(|(_, e)| e.is_dead())
            .map(|(&k, _)| k)
            .collect();
        for &bean_addr in &dead {
            self.remove_identity(bean_addr);
        }
        for bucket in self.by_equality.values_mut() {
            bucket.retain(|e| !e.is_dead());
        }
        self.by_equality.retain(|_, bucket| !bucket.is_empty());
        self.compact_at = (self.by_identity.len() * 2).max(MIN_COMPACT_AT);
        dead.len()
    }
}

/// Maps beans to their presentation-model wrappers.
pub struct IdentityCache<B, P> {
    maps: Mutex<IdentityMaps<B, P>>,
    hasher: RandomState,
    debug_checks: bool,
}

impl<B: Eq + Hash, P> IdentityCache<B, P> {
    /// Create a cache. Equal-bean checks are on in debug builds.
    pub fn new() -> Self {
        Self::with_debug_checks(cfg!(debug_assertions))
    }

    /// Create a cache with explicit equal-bean checking.
    pub fn with_debug_checks(debug_checks: bool) -> Self {
        Self {
            maps: Mutex::new(IdentityMaps {
                by_identity: HashMap::new(),
                by_equality: HashMap::new(),
                reverse: HashMap::new(),
                compact_at: MIN_COMPACT_AT,
            }),
            hasher: RandomState::new(),
            debug_checks,
        }
    }

    /// Whether adding an equal but distinct bean is rejected.
    pub fn debug_checks(&self) -> bool {
        self.debug_checks
    }

    /// Register `wrapper` for `bean`.
    ///
    /// Fails with [`PmError::IdentityConflict`] if the bean already has a
    /// live wrapper, and with [`PmError::DuplicateBean`] if debug checks are
    /// on and an equal but distinct bean has one.
    pub fn add(&self, wrapper: &Arc<P>, bean: &Arc<B>) -> Result<()> {
        let bean_addr = addr(Arc::as_ptr(bean));
        let hash = self.hasher.hash_one(&**bean);
        let mut maps = self.maps.lock();

        if let Some(entry) = maps.by_identity.get(&bean_addr) {
            if entry.live_wrapper().is_some() {
                return Err(PmError::IdentityConflict);
            }
        }
        if self.debug_checks {
            if let Some((other, _)) = maps.find_equal(hash, bean) {
                if other != bean_addr {
                    return Err(PmError::DuplicateBean);
                }
            }
        }

        maps.remove_identity(bean_addr);
        let entry = || Entry {
            bean: Arc::downgrade(bean),
            wrapper: Arc::downgrade(wrapper),
        };
        maps.by_identity.insert(bean_addr, entry());
        let bucket = maps.by_equality.entry(hash).or_default();
        bucket.retain(|e| !e.is_dead());
        bucket.push(entry());
        maps.reverse.insert(addr(Arc::as_ptr(wrapper)), bean_addr);
        tracing::trace!(target: targets::IDENTITY, bean = bean_addr, "registered wrapper");

        if maps.by_identity.len() >= maps.compact_at {
            let removed = maps.compact();
            tracing::trace!(target: targets::IDENTITY, removed, "compacted identity cache on add");
        }
        Ok(())
    }

    /// The live wrapper of `bean`, by identity first and by equality second.
    pub fn find_by_bean(&self, bean: &Arc<B>) -> Option<Arc<P>> {
        if let Some(wrapper) = self.find_by_identity(bean) {
            return Some(wrapper);
        }
        let hash = self.hasher.hash_one(&**bean);
        self.maps
            .lock()
            .find_equal(hash, bean)
            .map(|(_, wrapper)| wrapper)
    }

    /// The live wrapper registered for exactly this bean instance.
    pub fn find_by_identity(&self, bean: &Arc<B>) -> Option<Arc<P>> {
        self.maps
            .lock()
            .by_identity
            .get(&addr(Arc::as_ptr(bean)))
            .and_then(Entry::live_wrapper)
    }

    /// Forget the registration of `wrapper`.
    pub fn remove_pm(&self, wrapper: &Arc<P>) -> bool {
        let mut maps = self.maps.lock();
        match maps.reverse.remove(&addr(Arc::as_ptr(wrapper))) {
            Some(bean_addr) => maps.remove_identity(bean_addr),
            None => false,
        }
    }

    /// Forget the registration of `bean`, or of an equal bean if this
    /// instance was never registered.
    pub fn remove_bean(&self, bean: &Arc<B>) -> bool {
        let mut maps = self.maps.lock();
        if maps.remove_identity(addr(Arc::as_ptr(bean))) {
            return true;
        }
        let hash = self.hasher.hash_one(&**bean);
        match maps.find_equal(hash, bean) {
            Some((other, _)) => maps.remove_identity(other),
            None => false,
        }
    }

    /// Forget every registration.
    pub fn clear(&self) {
        let mut maps = self.maps.lock();
        maps.by_identity.clear();
        maps.by_equality.clear();
        maps.reverse.clear();
    }

    /// Snapshot of the live wrappers.
    pub fn items(&self) -> Vec<Arc<P>> {
        self.maps
            .lock()
            .by_identity
            .values()
            .filter_map(Entry::live_wrapper)
            .collect()
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.maps
            .lock()
            .by_identity
            .values()
            .filter(|e| !e.is_dead())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored entries, including dead ones not yet compacted.
    pub fn entry_count(&self) -> usize {
        self.maps.lock().by_identity.len()
    }

    /// Drop dead entries.
    ///
    /// `add` also compacts once the entry count doubles past the live count.
    pub fn compact(&self) {
        let removed = self.maps.lock().compact();
        tracing::trace!(target: targets::IDENTITY, removed, "compacted identity cache");
    }
}

impl<B: Eq + Hash, P> Default for IdentityCache<B, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B, P> fmt::Debug for IdentityCache<B, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityCache")
            .field("entries", &self.maps.lock().by_identity.len())
            .field("debug_checks", &self.debug_checks)
            .finish()
    }
}

/// Handle of a factory-created bean node.
///
/// Dropping the last handle destroys the node.
pub struct BeanPmHandle {
    session: WeakSession,
    node: NodeId,
}

impl BeanPmHandle {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The owning session, if it is still alive.
    pub fn session(&self) -> Option<Session> {
        self.session.upgrade()
    }
}

impl Drop for BeanPmHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            if let Err(err) = session.destroy_node(self.node) {
                tracing::trace!(
                    target: targets::IDENTITY,
                    node = ?self.node,
                    error = %err,
                    "bean node already gone"
                );
            }
        }
    }
}

impl fmt::Debug for BeanPmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeanPmHandle").field("node", &self.node).finish()
    }
}

/// Creates one dynamic node per bean below a collection node.
pub struct BeanPmFactory<B> {
    def: Arc<NodeDef>,
    cache: IdentityCache<B, BeanPmHandle>,
}

impl<B> BeanPmFactory<B>
where
    B: Eq + Hash + Send + Sync + 'static,
{
    /// Create a factory for nodes of `def`.
    pub fn new(def: Arc<NodeDef>) -> Self {
        Self {
            def,
            cache: IdentityCache::new(),
        }
    }

    /// Create a factory with explicit equal-bean checking.
    pub fn with_debug_checks(def: Arc<NodeDef>, debug_checks: bool) -> Self {
        Self {
            def,
            cache: IdentityCache::with_debug_checks(debug_checks),
        }
    }

    /// The wrapper of `bean` below `parent`, created on first use.
    pub fn get_or_create(
        &self,
        session: &Session,
        parent: NodeId,
        bean: Arc<B>,
    ) -> Result<Arc<BeanPmHandle>> {
        if let Some(handle) = self.cache.find_by_bean(&bean) {
            if session.contains(handle.node) {
                return Ok(handle);
            }
            self.cache.remove_pm(&handle);
        }

        let node = session.add_dynamic_child(parent, &self.def)?;
        let handle = Arc::new(BeanPmHandle {
            session: session.downgrade(),
            node,
        });
        session.attach_bean(node, bean.clone())?;
        self.cache.add(&handle, &bean)?;
        tracing::debug!(target: targets::IDENTITY, ?node, "created bean node");
        Ok(handle)
    }

    /// The wrapper of `bean`, if one is alive.
    pub fn find(&self, bean: &Arc<B>) -> Option<Arc<BeanPmHandle>> {
        self.cache.find_by_bean(bean)
    }

    /// The identity cache backing this factory.
    pub fn cache(&self) -> &IdentityCache<B, BeanPmHandle> {
        &self.cache
    }
}

impl Session {
    /// A bean factory honoring the session's identity-check setting.
    pub fn bean_factory<B>(&self, def: Arc<NodeDef>) -> BeanPmFactory<B>
    where
        B: Eq + Hash + Send + Sync + 'static,
    {
        BeanPmFactory::with_debug_checks(def, self.config().debug_identity_checks)
    }
}

impl<B> fmt::Debug for BeanPmFactory<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeanPmFactory")
            .field("def", &self.def.type_name())
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, Hash)]
    struct Customer {
        id: u32,
    }

    #[derive(Debug)]
    struct Wrapper(u32);

    fn customer(id: u32) -> Arc<Customer> {
        Arc::new(Customer { id })
    }

    #[test]
    fn find_by_identity_and_equality() {
        let cache = IdentityCache::with_debug_checks(false);
        let bean = customer(1);
        let wrapper = Arc::new(Wrapper(1));
        cache.add(&wrapper, &bean).unwrap();

        assert!(Arc::ptr_eq(&cache.find_by_identity(&bean).unwrap(), &wrapper));
        let twin = customer(1);
        assert!(cache.find_by_identity(&twin).is_none());
        assert!(Arc::ptr_eq(&cache.find_by_bean(&twin).unwrap(), &wrapper));
    }

    #[test]
    fn second_wrapper_for_same_bean_conflicts() {
        let cache = IdentityCache::with_debug_checks(false);
        let bean = customer(1);
        let first = Arc::new(Wrapper(1));
        cache.add(&first, &bean).unwrap();

        let err = cache.add(&Arc::new(Wrapper(2)), &bean).unwrap_err();
        assert!(matches!(err, PmError::IdentityConflict));
    }

    #[test]
    fn re_add_after_remove_bean() {
        let cache = IdentityCache::with_debug_checks(false);
        let bean = customer(1);
        let first = Arc::new(Wrapper(1));
        cache.add(&first, &bean).unwrap();

        assert!(cache.remove_bean(&bean));
        let second = Arc::new(Wrapper(2));
        cache.add(&second, &bean).unwrap();
        assert_eq!(cache.find_by_bean(&bean).unwrap().0, 2);
    }

    #[test]
    fn dead_wrapper_reads_as_miss() {
        let cache = IdentityCache::with_debug_checks(true);
        let bean = customer(1);
        let wrapper = Arc::new(Wrapper(1));
        cache.add(&wrapper, &bean).unwrap();
        drop(wrapper);

        assert!(cache.find_by_bean(&bean).is_none());
        assert_eq!(cache.len(), 0);

        let replacement = Arc::new(Wrapper(2));
        cache.add(&replacement, &bean).unwrap();
        assert_eq!(cache.items().len(), 1);
    }

    #[test]
    fn equal_distinct_bean_rejected_with_debug_checks() {
        let cache = IdentityCache::with_debug_checks(true);
        let bean = customer(1);
        let wrapper = Arc::new(Wrapper(1));
        cache.add(&wrapper, &bean).unwrap();
        let err = cache.add(&Arc::new(Wrapper(2)), &customer(1)).unwrap_err();
        assert!(matches!(err, PmError::DuplicateBean));
    }

    #[test]
    fn equal_distinct_bean_allowed_without_debug_checks() {
        let cache = IdentityCache::with_debug_checks(false);
        let a = customer(1);
        let b = customer(1);
        let wa = Arc::new(Wrapper(1));
        let wb = Arc::new(Wrapper(2));
        cache.add(&wa, &a).unwrap();
        cache.add(&wb, &b).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn remove_pm_and_compact() {
        let cache = IdentityCache::with_debug_checks(false);
        let a = customer(1);
        let b = customer(2);
        let wa = Arc::new(Wrapper(1));
        let wb = Arc::new(Wrapper(2));
        cache.add(&wa, &a).unwrap();
        cache.add(&wb, &b).unwrap();

        assert!(cache.remove_pm(&wa));
        assert!(cache.find_by_bean(&a).is_none());

        drop(b);
        cache.compact();
        assert_eq!(cache.len(), 0);
        cache.clear();
        assert!(cache.items().is_empty());
    }

    #[test]
    fn churned_beans_do_not_accumulate_entries() {
        let cache = IdentityCache::with_debug_checks(true);
        let keep = customer(0);
        let kept_wrapper = Arc::new(Wrapper(0));
        cache.add(&kept_wrapper, &keep).unwrap();

        for id in 1..1_000 {
            let bean = customer(id);
            let wrapper = Arc::new(Wrapper(id));
            cache.add(&wrapper, &bean).unwrap();
        }

        assert!(cache.entry_count() <= MIN_COMPACT_AT, "{} entries", cache.entry_count());
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&cache.find_by_bean(&keep).unwrap(), &kept_wrapper));
    }
}
