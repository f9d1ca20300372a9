//! Per-connection, per-base-type object cache.
//!
//! The map enforces the one-object-per-row rule: at most one live object
//! per primary key per connection. It is the authoritative owner of
//! object memory (`by_cache_key` holds every cached object; `by_id` only
//! those whose id is known) and bounds that memory by evicting
//! unreferenced, unchanged objects through a FIFO orphan cache.
//!
//! [`MapCore`] is deliberately non-generic: slots hold type-erased
//! entities, so one bookkeeping implementation serves every hierarchy.
//! The public, typed view is [`IdentityMap`]. Crate-internal callers
//! (handles, the object state machine, the transaction coordinator's
//! rollback entries) each use only the narrow subset of `MapCore`
//! operations they need.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use loam_error::{Error, Result};

use crate::connection::ConnectionCore;
use crate::object::{ObjectSlot, ObjectState, Persistent};
use crate::types::{CacheKey, Id};

/// Default bound on the orphan cache.
pub(crate) const DEFAULT_ORPHAN_CAPACITY: usize = 100;

pub(crate) struct MapCore {
    conn: Weak<ConnectionCore>,
    by_id: RefCell<HashMap<Id, Rc<ObjectSlot>>>,
    by_key: RefCell<HashMap<CacheKey, Rc<ObjectSlot>>>,
    next_key_probe: Cell<CacheKey>,
    /// Cache keys of objects with no handles and no unsaved changes, kept
    /// alive speculatively in arrival order.
    orphans: RefCell<VecDeque<CacheKey>>,
    orphan_capacity: Cell<usize>,
    caching_enabled: Cell<bool>,
}

impl MapCore {
    pub(crate) fn new(conn: Weak<ConnectionCore>) -> Self {
        Self {
            conn,
            by_id: RefCell::new(HashMap::new()),
            by_key: RefCell::new(HashMap::new()),
            next_key_probe: Cell::new(1),
            orphans: RefCell::new(VecDeque::new()),
            orphan_capacity: Cell::new(DEFAULT_ORPHAN_CAPACITY),
            caching_enabled: Cell::new(true),
        }
    }

    pub(crate) fn connection(&self) -> Option<Rc<ConnectionCore>> {
        self.conn.upgrade()
    }

    fn allocate_cache_key(&self) -> Result<CacheKey> {
        let by_key = self.by_key.borrow();
        let mut probe = self.next_key_probe.get();
        while by_key.contains_key(&probe) {
            probe = probe
                .checked_add(1)
                .ok_or(Error::Overflow { what: "cache key" })?;
        }
        let next = probe
            .checked_add(1)
            .ok_or(Error::Overflow { what: "cache key" })?;
        self.next_key_probe.set(next);
        Ok(probe)
    }

    /// Fresh never-saved object: Dirty, cached by cache key only.
    pub(crate) fn provide_new<D: Persistent>(self: &Rc<Self>) -> Result<Rc<ObjectSlot>> {
        let key = self.allocate_cache_key()?;
        let slot = ObjectSlot::new(
            Rc::downgrade(self),
            Box::new(D::default()),
            ObjectState::Dirty,
            None,
            key,
        );
        self.by_key.borrow_mut().insert(key, Rc::clone(&slot));
        Ok(slot)
    }

    /// Object for a known id: the cached instance if present, else a fresh
    /// ghost of concrete type `D`, cached in both tables.
    pub(crate) fn provide<D: Persistent>(self: &Rc<Self>, id: Id) -> Result<Rc<ObjectSlot>> {
        if let Some(slot) = self.by_id.borrow().get(&id) {
            return Ok(Rc::clone(slot));
        }
        let key = self.allocate_cache_key()?;
        let slot = ObjectSlot::new(
            Rc::downgrade(self),
            Box::new(D::default()),
            ObjectState::Ghost,
            Some(id),
            key,
        );
        self.by_key.borrow_mut().insert(key, Rc::clone(&slot));
        self.by_id.borrow_mut().insert(id, Rc::clone(&slot));
        Ok(slot)
    }

    /// Establish the id mapping for `slot`, called exactly once per id at
    /// the first (possibly provisional) save. Refuses an id already bound
    /// to a different object.
    pub(crate) fn register_id(
        &self,
        slot: &Rc<ObjectSlot>,
        id: Id,
        table: &'static str,
    ) -> Result<()> {
        let mut by_id = self.by_id.borrow_mut();
        if let Some(existing) = by_id.get(&id) {
            if Rc::ptr_eq(existing, slot) {
                return Ok(());
            }
            return Err(Error::BadIdentifier { table, id });
        }
        by_id.insert(id, Rc::clone(slot));
        Ok(())
    }

    /// Withdraw an id mapping, but only if it points at `slot`.
    pub(crate) fn unregister_id(&self, id: Id, slot: &Rc<ObjectSlot>) {
        let mut by_id = self.by_id.borrow_mut();
        if by_id.get(&id).is_some_and(|s| Rc::ptr_eq(s, slot)) {
            by_id.remove(&id);
        }
    }

    /// A handle now references `slot`. Overflow of the counter is a hard
    /// failure. A 0→1 transition revives the object out of the orphan
    /// cache.
    pub(crate) fn notify_handle_constructed(&self, slot: &Rc<ObjectSlot>) -> Result<()> {
        let count = slot.meta.handle_count.get();
        let next = count.checked_add(1).ok_or(Error::Overflow {
            what: "handle counter",
        })?;
        slot.meta.handle_count.set(next);
        if count == 0 {
            if let Some(key) = slot.meta.cache_key.get() {
                self.orphans.borrow_mut().retain(|&k| k != key);
            }
        }
        Ok(())
    }

    /// A handle referencing `slot` was destroyed.
    pub(crate) fn notify_handle_destroyed(&self, slot: &Rc<ObjectSlot>) {
        let count = slot.meta.handle_count.get();
        debug_assert!(count > 0, "handle counter underflow");
        slot.meta.handle_count.set(count.saturating_sub(1));
        if count <= 1 {
            self.reconsider_eviction(slot);
        }
    }

    /// Evict or orphan-cache an object whose last reference may be gone.
    ///
    /// Dirty and Saving objects, and objects held by a transaction's
    /// rollback registry, are never evicted. Loaded objects go through
    /// the orphan cache while caching is enabled; ghosts and bypassed
    /// objects are evicted immediately.
    pub(crate) fn reconsider_eviction(&self, slot: &Rc<ObjectSlot>) {
        if slot.meta.handle_count.get() != 0 || slot.meta.rollback_refs.get() != 0 {
            return;
        }
        match slot.meta.state.get() {
            ObjectState::Dirty | ObjectState::Saving => {}
            ObjectState::Loaded if self.caching_enabled.get() => {
                if let Some(key) = slot.meta.cache_key.get() {
                    {
                        let mut orphans = self.orphans.borrow_mut();
                        if !orphans.contains(&key) {
                            orphans.push_back(key);
                        }
                    }
                    self.enforce_orphan_capacity();
                }
            }
            ObjectState::Loaded | ObjectState::Ghost => self.evict(slot),
        }
    }

    fn enforce_orphan_capacity(&self) {
        loop {
            let key = {
                let mut orphans = self.orphans.borrow_mut();
                if orphans.len() <= self.orphan_capacity.get() {
                    return;
                }
                match orphans.pop_front() {
                    Some(key) => key,
                    None => return,
                }
            };
            self.evict_orphan(key);
        }
    }

    /// Evict the object behind an orphan entry if it is still evictable.
    fn evict_orphan(&self, key: CacheKey) {
        let slot = self.by_key.borrow().get(&key).cloned();
        if let Some(slot) = slot {
            if slot.meta.handle_count.get() == 0
                && slot.meta.rollback_refs.get() == 0
                && slot.meta.state.get() == ObjectState::Loaded
            {
                self.evict(&slot);
            }
        }
    }

    fn evict(&self, slot: &Rc<ObjectSlot>) {
        if let Some(key) = slot.meta.cache_key.take() {
            self.by_key.borrow_mut().remove(&key);
            self.orphans.borrow_mut().retain(|&k| k != key);
        }
        if let Some(id) = slot.meta.id.get() {
            let mut by_id = self.by_id.borrow_mut();
            if by_id.get(&id).is_some_and(|s| Rc::ptr_eq(s, slot)) {
                by_id.remove(&id);
            }
        }
        tracing::trace!(id = ?slot.meta.id.get(), "object evicted from identity map");
    }

    /// Forced eviction. Refused while handles still reference the object;
    /// an id that is not cached is a no-op.
    pub(crate) fn uncache(&self, id: Id) -> Result<()> {
        let slot = self.by_id.borrow().get(&id).cloned();
        match slot {
            Some(slot) => {
                let handles = slot.meta.handle_count.get();
                if handles > 0 {
                    return Err(Error::ObjectInUse { handles });
                }
                self.evict(&slot);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub(crate) fn set_caching_enabled(&self, enabled: bool) {
        self.caching_enabled.set(enabled);
        if !enabled {
            self.flush_orphans();
        }
    }

    pub(crate) fn is_caching_enabled(&self) -> bool {
        self.caching_enabled.get()
    }

    fn flush_orphans(&self) {
        loop {
            let key = match self.orphans.borrow_mut().pop_front() {
                Some(key) => key,
                None => break,
            };
            self.evict_orphan(key);
        }
    }

    pub(crate) fn set_orphan_capacity(&self, capacity: usize) {
        self.orphan_capacity.set(capacity);
        self.enforce_orphan_capacity();
    }

    pub(crate) fn contains_id(&self, id: Id) -> bool {
        self.by_id.borrow().contains_key(&id)
    }

    pub(crate) fn cached_object_count(&self) -> usize {
        self.by_key.borrow().len()
    }
}

/// Typed view of a connection's identity map for base type `B`.
///
/// Obtained from
/// [`DatabaseConnection::identity_map`](crate::DatabaseConnection::identity_map).
/// The caching toggle exists for bulk operations: with caching disabled,
/// unreferenced clean objects are evicted the moment their last handle
/// drops instead of lingering in the orphan cache.
pub struct IdentityMap<B: Persistent> {
    core: Rc<MapCore>,
    _marker: PhantomData<B>,
}

impl<B: Persistent> IdentityMap<B> {
    pub(crate) fn from_core(core: Rc<MapCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    /// Re-enable the orphan cache.
    pub fn enable_caching(&self) {
        self.core.set_caching_enabled(true);
    }

    /// Bypass the orphan cache; unreferenced clean objects are evicted
    /// immediately, and currently cached orphans are flushed.
    pub fn disable_caching(&self) {
        self.core.set_caching_enabled(false);
    }

    /// Whether the orphan cache is active.
    #[must_use]
    pub fn is_caching_enabled(&self) -> bool {
        self.core.is_caching_enabled()
    }

    /// Bound the orphan cache; the oldest entries beyond `capacity` are
    /// evicted.
    pub fn set_orphan_capacity(&self, capacity: usize) {
        self.core.set_orphan_capacity(capacity);
    }

    /// Whether an object with the given id is currently cached.
    #[must_use]
    pub fn is_cached(&self, id: Id) -> bool {
        self.core.contains_id(id)
    }

    /// Number of objects currently held by the map (with or without ids).
    #[must_use]
    pub fn cached_object_count(&self) -> usize {
        self.core.cached_object_count()
    }

    /// Forcibly evict the object with the given id. Fails with
    /// [`Error::ObjectInUse`] while live handles reference it.
    pub fn uncache(&self, id: Id) -> Result<()> {
        self.core.uncache(id)
    }
}
