//! Persistent object state machine.
//!
//! Every row-backed object lives in exactly one identity-map slot and
//! moves through Ghost → Loaded → Dirty → Saving. The save protocol is
//! crash-safe on both sides: the database write is wrapped in its own
//! transaction level, and a rollback callback registered with the
//! coordinator restores the in-memory fields from a snapshot if that
//! level (or any enclosing one) is cancelled.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use loam_error::{Error, Result};

use crate::connection::{ConnectionCore, DatabaseConnection};
use crate::identity_map::MapCore;
use crate::transaction::RollbackDisposition;
use crate::types::{CacheKey, Id};

/// Lifecycle state of a row-backed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    /// Identity established (id known) but fields not yet loaded.
    Ghost,
    /// Fields match the stored row.
    Loaded,
    /// Fields differ from the stored row, or no row exists yet.
    Dirty,
    /// A save is in flight.
    Saving,
}

/// A business-entity type persisted one row per instance.
///
/// Implementors supply the table geometry and the SQL hooks; the state
/// machine, identity management, and rollback handling are shared. Fields
/// must default to their unloaded (ghost) representation, and `Clone` is
/// used to snapshot them for rollback.
pub trait Persistent: Any + Default + Clone {
    /// Anchor of this type's hierarchy: the type whose exclusive table
    /// owns the autoincrement primary-key sequence. `Self` for standalone
    /// types.
    type Base: Persistent;

    /// Table selected when traversing the whole hierarchy.
    fn primary_table_name() -> &'static str;

    /// Table storing rows belonging only to this concrete type. Differs
    /// from the primary table only for sub-types in a hierarchy.
    fn exclusive_table_name() -> &'static str {
        Self::primary_table_name()
    }

    /// Name of the single-column integer primary key as it appears in
    /// every table of the hierarchy.
    fn primary_key_name() -> &'static str;

    /// Populate fields from the row with primary key `id`.
    fn do_load(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()>;

    /// Insert new row(s) with primary key `id`; for hierarchies, the base
    /// exclusive table first.
    fn do_save_new(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()>;

    /// Update the existing row(s) with primary key `id`.
    fn do_save_existing(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()>;

    /// Reset all fields to their unloaded state.
    fn do_ghostify(&mut self) {
        *self = Self::default();
    }

    /// Delete the row(s) with primary key `id`: the exclusive table
    /// first, then the base table for hierarchy sub-types. Override for
    /// hierarchies deeper than two levels.
    fn do_remove(&self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        let mut stmt = conn.statement(&format!(
            "delete from {} where {} = :p",
            Self::exclusive_table_name(),
            Self::primary_key_name()
        ))?;
        stmt.bind(":p", id)?;
        stmt.step_final()?;
        if Self::exclusive_table_name() != <Self::Base as Persistent>::exclusive_table_name() {
            let mut stmt = conn.statement(&format!(
                "delete from {} where {} = :p",
                <Self::Base as Persistent>::exclusive_table_name(),
                Self::primary_key_name()
            ))?;
            stmt.bind(":p", id)?;
            stmt.step_final()?;
        }
        Ok(())
    }
}

/// Object-safe view of a [`Persistent`] entity, so identity-map slots can
/// hold any concrete type of a hierarchy while saves still dispatch to
/// the most-derived hooks.
pub(crate) trait ErasedPersistent: Any {
    fn load(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()>;
    fn save_new(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()>;
    fn save_existing(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()>;
    fn ghostify(&mut self);
    fn remove(&self, conn: &DatabaseConnection, id: Id) -> Result<()>;
    fn snapshot(&self) -> Box<dyn Any>;
    fn restore(&mut self, snapshot: Box<dyn Any>);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Persistent> ErasedPersistent for T {
    fn load(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        self.do_load(conn, id)
    }

    fn save_new(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        self.do_save_new(conn, id)
    }

    fn save_existing(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        self.do_save_existing(conn, id)
    }

    fn ghostify(&mut self) {
        self.do_ghostify();
    }

    fn remove(&self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        self.do_remove(conn, id)
    }

    fn snapshot(&self) -> Box<dyn Any> {
        Box::new(self.clone())
    }

    fn restore(&mut self, snapshot: Box<dyn Any>) {
        match snapshot.downcast::<T>() {
            Ok(fields) => *self = *fields,
            Err(_) => debug_assert!(false, "snapshot restored into a different concrete type"),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Bookkeeping shared by the identity map, handles, and the transaction
/// coordinator.
pub(crate) struct ObjectMeta {
    pub(crate) id: Cell<Option<Id>>,
    pub(crate) cache_key: Cell<Option<CacheKey>>,
    pub(crate) handle_count: Cell<u32>,
    pub(crate) state: Cell<ObjectState>,
    /// Count of rollback callbacks currently registered against this
    /// object; non-zero blocks eviction.
    pub(crate) rollback_refs: Cell<u32>,
    pub(crate) map: Weak<MapCore>,
}

/// One cached object: metadata plus the type-erased entity. Owned by the
/// identity map; handles hold non-owning refcounts.
pub(crate) struct ObjectSlot {
    pub(crate) meta: ObjectMeta,
    pub(crate) entity: RefCell<Box<dyn ErasedPersistent>>,
}

impl ObjectSlot {
    pub(crate) fn new(
        map: Weak<MapCore>,
        entity: Box<dyn ErasedPersistent>,
        state: ObjectState,
        id: Option<Id>,
        cache_key: CacheKey,
    ) -> Rc<Self> {
        Rc::new(Self {
            meta: ObjectMeta {
                id: Cell::new(id),
                cache_key: Cell::new(Some(cache_key)),
                handle_count: Cell::new(0),
                state: Cell::new(state),
                rollback_refs: Cell::new(0),
                map,
            },
            entity: RefCell::new(entity),
        })
    }

    pub(crate) fn connection(&self) -> Result<Rc<ConnectionCore>> {
        self.meta
            .map
            .upgrade()
            .and_then(|map| map.connection())
            .ok_or(Error::InvalidConnection)
    }
}

/// Load a ghost's fields from the database. A load failure leaves the
/// object a ghost; it is never partially loaded.
pub(crate) fn ensure_loaded(slot: &Rc<ObjectSlot>) -> Result<()> {
    if slot.meta.state.get() != ObjectState::Ghost {
        return Ok(());
    }
    let Some(id) = slot.meta.id.get() else {
        // Ghosts always know their id through public construction; an
        // id-less object behaves as unsaved.
        slot.meta.state.set(ObjectState::Dirty);
        return Ok(());
    };
    let core = slot.connection()?;
    let conn = DatabaseConnection::from_core(core);
    let result = slot.entity.borrow_mut().load(&conn, id);
    match result {
        Ok(()) => {
            slot.meta.state.set(ObjectState::Loaded);
            Ok(())
        }
        Err(err) => {
            slot.entity.borrow_mut().ghostify();
            tracing::warn!(id, error = %err, "object load failed; object remains a ghost");
            Err(err)
        }
    }
}

/// Save the object, allocating a primary key on the first save.
///
/// The write always runs in its own transaction level. On success the
/// level commits and its rollback registration merges into any enclosing
/// frame; on failure the level cancels, which restores the snapshot,
/// reverts the state to Dirty, and drops any provisionally assigned id.
pub(crate) fn save(slot: &Rc<ObjectSlot>, base_table: &'static str) -> Result<Id> {
    let core = slot.connection()?;
    if slot.meta.state.get() == ObjectState::Ghost {
        if let Some(id) = slot.meta.id.get() {
            // Unloaded fields are by definition identical to the row.
            return Ok(id);
        }
    }
    let was_new = slot.meta.id.get().is_none();
    core.tx_begin()?;
    let snapshot = slot.entity.borrow().snapshot();
    slot.meta.state.set(ObjectState::Saving);
    let conn = DatabaseConnection::from_core(Rc::clone(&core));
    let attempt = save_attempt(slot, &core, &conn, was_new, base_table, snapshot);
    let err = match attempt {
        Ok(id) => match core.tx_commit() {
            Ok(()) => {
                slot.meta.state.set(ObjectState::Loaded);
                return Ok(id);
            }
            Err(err) => {
                let _ = core.tx_cancel();
                err
            }
        },
        Err(err) => {
            let _ = core.tx_cancel();
            err
        }
    };
    // If the failure happened before the rollback callback was in place,
    // the cancel above could not revert the state for us.
    if slot.meta.state.get() == ObjectState::Saving {
        slot.meta.state.set(ObjectState::Dirty);
    }
    tracing::warn!(error = %err, "object save failed");
    Err(err)
}

fn save_attempt(
    slot: &Rc<ObjectSlot>,
    core: &Rc<ConnectionCore>,
    conn: &DatabaseConnection,
    was_new: bool,
    base_table: &'static str,
    snapshot: Box<dyn Any>,
) -> Result<Id> {
    if was_new {
        let id = core.next_auto_key(base_table)?;
        let map = slot.meta.map.upgrade().ok_or(Error::InvalidConnection)?;
        // Pre-emptive id registration so concurrent fetches collapse onto
        // this object before the insert commits.
        map.register_id(slot, id, base_table)?;
        slot.meta.id.set(Some(id));
        register_rollback(slot, core, snapshot, Some(id))?;
        slot.entity.borrow_mut().save_new(conn, id)?;
        Ok(id)
    } else {
        let id = slot.meta.id.get().ok_or(Error::UnboundHandle)?;
        register_rollback(slot, core, snapshot, None)?;
        slot.entity.borrow_mut().save_existing(conn, id)?;
        Ok(id)
    }
}

/// Register the in-memory rollback callback with the innermost frame.
///
/// On cancel: fields ← snapshot, state ← Dirty, and a provisionally
/// assigned id is withdrawn from the identity map. On release (outermost
/// commit): only the registration count drops, which may make the object
/// evictable.
fn register_rollback(
    slot: &Rc<ObjectSlot>,
    core: &Rc<ConnectionCore>,
    snapshot: Box<dyn Any>,
    provisional_id: Option<Id>,
) -> Result<()> {
    let refs = &slot.meta.rollback_refs;
    refs.set(refs.get().checked_add(1).ok_or(Error::Overflow {
        what: "rollback registration counter",
    })?);
    let slot = Rc::clone(slot);
    core.tx_register_rollback(Box::new(move |disposition| {
        if let RollbackDisposition::Cancel = disposition {
            slot.entity.borrow_mut().restore(snapshot);
            slot.meta.state.set(ObjectState::Dirty);
            if let Some(id) = provisional_id {
                slot.meta.id.set(None);
                if let Some(map) = slot.meta.map.upgrade() {
                    map.unregister_id(id, &slot);
                }
            }
        }
        let refs = &slot.meta.rollback_refs;
        refs.set(refs.get().saturating_sub(1));
        if let Some(map) = slot.meta.map.upgrade() {
            map.reconsider_eviction(&slot);
        }
    }));
    Ok(())
}

/// Delete the object's row(s). The object stays cached under its cache
/// key and reverts to an unsaved Dirty object (id withdrawn), so saving
/// it again re-inserts it under a fresh id.
pub(crate) fn remove(slot: &Rc<ObjectSlot>) -> Result<()> {
    let core = slot.connection()?;
    let Some(id) = slot.meta.id.get() else {
        // Never saved: nothing on disk to delete.
        return Ok(());
    };
    core.tx_begin()?;
    let conn = DatabaseConnection::from_core(Rc::clone(&core));
    let result = slot.entity.borrow().remove(&conn, id);
    let result = match result {
        Ok(()) => match core.tx_commit() {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = core.tx_cancel();
                Err(err)
            }
        },
        Err(err) => {
            let _ = core.tx_cancel();
            Err(err)
        }
    };
    result.map(|()| {
        slot.meta.id.set(None);
        if let Some(map) = slot.meta.map.upgrade() {
            map.unregister_id(id, slot);
        }
        slot.meta.state.set(ObjectState::Dirty);
    })
}

/// Explicitly forget loaded field data. Objects with an id become ghosts;
/// unsaved objects keep their Dirty standing with defaulted fields.
pub(crate) fn ghostify(slot: &Rc<ObjectSlot>) {
    slot.entity.borrow_mut().ghostify();
    if slot.meta.id.get().is_some() {
        slot.meta.state.set(ObjectState::Ghost);
    } else {
        slot.meta.state.set(ObjectState::Dirty);
    }
}
