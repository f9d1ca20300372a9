//! Per-connection cache of prepared statements.
//!
//! Statement text is an opaque key. A lease either reuses an unlocked
//! cached handle or prepares a fresh one; two concurrent leases of the
//! same text therefore always get two distinct handles, which keeps
//! identical SQL reentrant-safe.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use libsqlite3_sys as ffi;
use loam_error::Result;

use crate::statement::StatementHandle;

pub(crate) struct StatementCache {
    entries: HashMap<String, Vec<Rc<RefCell<StatementHandle>>>>,
    cached: usize,
    capacity: usize,
}

impl StatementCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            cached: 0,
            capacity,
        }
    }

    /// Lease a locked handle for `sql`.
    ///
    /// Newly prepared handles are retained for reuse until the cache is
    /// full; past capacity the lease is served uncached and the handle is
    /// finalized when the lease drops.
    pub(crate) fn lease(
        &mut self,
        db: *mut ffi::sqlite3,
        sql: &str,
    ) -> Result<Rc<RefCell<StatementHandle>>> {
        if let Some(slots) = self.entries.get(sql) {
            for slot in slots {
                let mut handle = slot.borrow_mut();
                if !handle.is_locked() {
                    handle.lock();
                    drop(handle);
                    return Ok(Rc::clone(slot));
                }
            }
        }
        tracing::trace!(sql, "statement cache miss");
        let mut handle = StatementHandle::prepare(db, sql)?;
        handle.lock();
        let slot = Rc::new(RefCell::new(handle));
        if self.cached < self.capacity {
            self.entries
                .entry(sql.to_owned())
                .or_default()
                .push(Rc::clone(&slot));
            self.cached += 1;
        }
        Ok(slot)
    }

    /// Number of handles currently retained.
    #[cfg(test)]
    pub(crate) fn cached_len(&self) -> usize {
        self.cached
    }
}
