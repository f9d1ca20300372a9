//! Refcounted smart references to cached persistent objects.
//!
//! A [`Handle`] is the only way user code touches a persistent object.
//! Construction, cloning, and dropping keep the object's handle counter
//! in step with the identity map, which uses it to decide eviction.
//! Two handles compare equal exactly when they reference the same cached
//! object.

use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use loam_error::{Error, Result};

use crate::connection::DatabaseConnection;
use crate::object::{self, ObjectSlot, ObjectState, Persistent};
use crate::types::Id;

pub struct Handle<T: Persistent> {
    slot: Rc<ObjectSlot>,
    _marker: PhantomData<T>,
}

impl<T: Persistent> Handle<T> {
    /// Handle to a new instance of `T`, not yet persisted. The object is
    /// cached (Dirty, no id) and written to the database if and when it
    /// is saved.
    pub fn new(conn: &DatabaseConnection) -> Result<Self> {
        let map = conn.core().map_core_for(TypeId::of::<T::Base>());
        let slot = map.provide_new::<T>()?;
        Self::adopt(slot)
    }

    /// Handle to the object with primary key `id`.
    ///
    /// Verifies the id exists (a probe of the exclusive table, no field
    /// load) unless the object is already cached; fails with
    /// [`Error::BadIdentifier`] otherwise. Does not trigger a load.
    pub fn get(conn: &DatabaseConnection, id: Id) -> Result<Self> {
        let map = conn.core().map_core_for(TypeId::of::<T::Base>());
        if !map.contains_id(id) {
            let mut stmt = conn.statement(&format!(
                "select {pk} from {table} where {pk} = :p",
                pk = T::primary_key_name(),
                table = T::exclusive_table_name(),
            ))?;
            stmt.bind(":p", id)?;
            if !stmt.step()? {
                return Err(Error::BadIdentifier {
                    table: T::exclusive_table_name(),
                    id,
                });
            }
        }
        let slot = map.provide::<T>(id)?;
        Self::adopt(slot)
    }

    /// Like [`Handle::get`] without the existence probe.
    ///
    /// The caller promises a row with primary key `id` exists; cursors use
    /// this for ids read straight from a result set. Lying here does not
    /// corrupt memory, but the first load of the phantom object will fail.
    pub fn get_unchecked(conn: &DatabaseConnection, id: Id) -> Result<Self> {
        let map = conn.core().map_core_for(TypeId::of::<T::Base>());
        let slot = map.provide::<T>(id)?;
        Self::adopt(slot)
    }

    fn adopt(slot: Rc<ObjectSlot>) -> Result<Self> {
        match slot.meta.map.upgrade() {
            Some(map) => map.notify_handle_constructed(&slot)?,
            None => return Err(Error::InvalidConnection),
        }
        Ok(Self {
            slot,
            _marker: PhantomData,
        })
    }

    /// The object's primary key; `None` until the first successful save.
    #[must_use]
    pub fn id(&self) -> Option<Id> {
        self.slot.meta.id.get()
    }

    /// Number of live handles referencing the object, this one included.
    #[must_use]
    pub fn handle_count(&self) -> u32 {
        self.slot.meta.handle_count.get()
    }

    #[must_use]
    pub fn is_ghost(&self) -> bool {
        self.slot.meta.state.get() == ObjectState::Ghost
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.slot.meta.state.get() == ObjectState::Dirty
    }

    /// Read access to the object's fields. Ghosts are loaded from the
    /// database first; a load failure propagates and leaves the object a
    /// ghost.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        object::ensure_loaded(&self.slot)?;
        let entity = self.slot.entity.borrow();
        let concrete = entity
            .as_any()
            .downcast_ref::<T>()
            .ok_or(Error::WrongObjectType)?;
        Ok(f(concrete))
    }

    /// Mutating access to the object's fields; marks the object Dirty.
    /// Ghosts are loaded first, as for [`read`](Handle::read).
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        object::ensure_loaded(&self.slot)?;
        let mut entity = self.slot.entity.borrow_mut();
        let concrete = entity
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or(Error::WrongObjectType)?;
        let out = f(concrete);
        drop(entity);
        self.slot.meta.state.set(ObjectState::Dirty);
        Ok(out)
    }

    /// Save the object: INSERT on the first save (allocating its id),
    /// UPDATE afterwards. Returns the object's id.
    ///
    /// The write runs in its own transaction level; on failure the fields
    /// revert to their pre-save snapshot and the object is Dirty again.
    pub fn save(&self) -> Result<Id> {
        object::save(&self.slot, <T::Base as Persistent>::exclusive_table_name())
    }

    /// Delete the object's row(s) from the database. The object reverts
    /// to an unsaved Dirty object; saving it again re-inserts it.
    pub fn remove(&self) -> Result<()> {
        object::remove(&self.slot)
    }

    /// Discard loaded field data; the next read reloads from the
    /// database.
    pub fn ghostify(&self) {
        object::ghostify(&self.slot);
    }

    /// Whether the referenced object's runtime type is `D`. Supports
    /// hierarchy persistence, where a base-typed handle may reference a
    /// more derived object.
    #[must_use]
    pub fn has_dynamic_type<D: Persistent>(&self) -> bool {
        self.slot.entity.borrow().as_any().is::<D>()
    }

    /// A base-typed handle to the same object.
    pub fn to_base(&self) -> Result<Handle<T::Base>> {
        Handle::adopt(Rc::clone(&self.slot))
    }

    /// A `D`-typed handle to the same object; fails with
    /// [`Error::WrongObjectType`] unless the object's runtime type is `D`.
    pub fn downcast<D: Persistent<Base = T::Base>>(&self) -> Result<Handle<D>> {
        if self.has_dynamic_type::<D>() {
            Handle::adopt(Rc::clone(&self.slot))
        } else {
            Err(Error::WrongObjectType)
        }
    }
}

impl<T: Persistent> Clone for Handle<T> {
    fn clone(&self) -> Self {
        match Self::adopt(Rc::clone(&self.slot)) {
            Ok(handle) => handle,
            // Reaching u32::MAX live handles is not survivable; counter
            // overflow here is a hard failure.
            Err(err) => panic!("handle counter overflow: {err}"),
        }
    }
}

impl<T: Persistent> Drop for Handle<T> {
    fn drop(&mut self) {
        if let Some(map) = self.slot.meta.map.upgrade() {
            map.notify_handle_destroyed(&self.slot);
        } else {
            let count = self.slot.meta.handle_count.get();
            self.slot.meta.handle_count.set(count.saturating_sub(1));
        }
    }
}

impl<T: Persistent> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<T: Persistent> Eq for Handle<T> {}

impl<T: Persistent> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.slot.meta.id.get())
            .field("state", &self.slot.meta.state.get())
            .field("handle_count", &self.slot.meta.handle_count.get())
            .finish_non_exhaustive()
    }
}
