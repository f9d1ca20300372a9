//! Database connection core.
//!
//! A [`DatabaseConnection`] owns the open engine handle, the prepared
//! statement cache, the transaction coordinator, and one identity map per
//! persisted base type. The connection and everything reachable from it is
//! deliberately `!Send`/`!Sync`; one connection belongs to one thread.

#![allow(unsafe_code)]

use std::any::TypeId;
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::ptr;
use std::rc::Rc;

use libsqlite3_sys as ffi;
use loam_error::{Error, Result};

use crate::cache::StatementCache;
use crate::identity_map::{IdentityMap, MapCore};
use crate::object::Persistent;
use crate::statement::{Statement, engine_error};
use crate::transaction::TransactionStack;
use crate::types::Id;

/// Retained prepared statements per connection. Leases beyond this run
/// uncached.
const STATEMENT_CACHE_CAPACITY: usize = 300;

struct RawDb {
    ptr: *mut ffi::sqlite3,
    path: PathBuf,
}

impl Drop for RawDb {
    fn drop(&mut self) {
        // All statements are finalized by the time this runs; see the
        // field ordering on ConnectionCore.
        let rc = unsafe { ffi::sqlite3_close(self.ptr) };
        if rc != ffi::SQLITE_OK {
            tracing::warn!(code = rc, path = %self.path.display(), "database close reported an error");
        }
    }
}

pub(crate) struct ConnectionCore {
    // Field order doubles as drop order: cached statements must be
    // finalized, and identity maps torn down, before the engine handle
    // closes.
    stmts: RefCell<StatementCache>,
    pub(crate) tx: RefCell<TransactionStack>,
    maps: RefCell<Vec<(TypeId, Rc<MapCore>)>>,
    db: RefCell<Option<RawDb>>,
}

impl ConnectionCore {
    fn new() -> Self {
        Self {
            stmts: RefCell::new(StatementCache::new(STATEMENT_CACHE_CAPACITY)),
            tx: RefCell::new(TransactionStack::new()),
            maps: RefCell::new(Vec::new()),
            db: RefCell::new(None),
        }
    }

    pub(crate) fn db_ptr(&self) -> Result<*mut ffi::sqlite3> {
        self.db
            .borrow()
            .as_ref()
            .map(|db| db.ptr)
            .ok_or(Error::InvalidConnection)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.db.borrow().is_some()
    }

    /// Lease a cached prepared statement for `sql`.
    pub(crate) fn statement(self: &Rc<Self>, sql: &str) -> Result<Statement> {
        let db = self.db_ptr()?;
        let handle = self.stmts.borrow_mut().lease(db, sql)?;
        Ok(Statement::new(handle, Rc::clone(self)))
    }

    /// Prepare-step-finalize convenience for DDL and one-shot DML.
    /// Compound statement text is allowed here; nothing is cached.
    pub(crate) fn execute_sql(&self, sql: &str) -> Result<()> {
        let db = self.db_ptr()?;
        let csql = CString::new(sql)
            .map_err(|_| Error::from_engine(1, "SQL text contains an interior NUL byte"))?;
        let mut errmsg: *mut c_char = ptr::null_mut();
        let rc = unsafe { ffi::sqlite3_exec(db, csql.as_ptr(), None, ptr::null_mut(), &mut errmsg) };
        if rc == ffi::SQLITE_OK {
            return Ok(());
        }
        let err = if errmsg.is_null() {
            engine_error(db)
        } else {
            let message = unsafe { CStr::from_ptr(errmsg).to_string_lossy().into_owned() };
            unsafe { ffi::sqlite3_free(errmsg.cast()) };
            let extended = unsafe { ffi::sqlite3_extended_errcode(db) };
            Error::from_engine(extended, message)
        };
        Err(err)
    }

    pub(crate) fn last_insert_rowid(&self) -> Result<i64> {
        Ok(unsafe { ffi::sqlite3_last_insert_rowid(self.db_ptr()?) })
    }

    /// The identity map core for the base type identified by `key`,
    /// constructed on first use. Maps are kept in registration order.
    pub(crate) fn map_core_for(self: &Rc<Self>, key: TypeId) -> Rc<MapCore> {
        let mut maps = self.maps.borrow_mut();
        if let Some((_, core)) = maps.iter().find(|(k, _)| *k == key) {
            return Rc::clone(core);
        }
        let core = Rc::new(MapCore::new(Rc::downgrade(self)));
        maps.push((key, Rc::clone(&core)));
        core
    }

    /// The primary key the autoincrement sequence of `table` would assign
    /// next.
    pub(crate) fn next_auto_key(self: &Rc<Self>, table: &str) -> Result<Id> {
        // sqlite_sequence only exists once some AUTOINCREMENT table has
        // taken its first insert.
        let mut probe =
            self.statement("select name from sqlite_master where name = 'sqlite_sequence'")?;
        if !probe.step()? {
            return Ok(1);
        }
        drop(probe);
        let mut stmt = self.statement("select seq from sqlite_sequence where name = :p")?;
        stmt.bind(":p", table)?;
        if stmt.step()? {
            let seq: i64 = stmt.extract(0)?;
            seq.checked_add(1).ok_or(Error::Overflow {
                what: "primary key",
            })
        } else {
            Ok(1)
        }
    }
}

/// A connection to a single-file database.
///
/// Constructed closed; [`open`](DatabaseConnection::open) attaches it to a
/// file. Every operation on a closed connection fails with
/// [`Error::InvalidConnection`].
pub struct DatabaseConnection {
    core: Rc<ConnectionCore>,
}

impl Default for DatabaseConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseConnection {
    /// Create a connection not yet associated with any database file.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Rc::new(ConnectionCore::new()),
        }
    }

    pub(crate) fn from_core(core: Rc<ConnectionCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Rc<ConnectionCore> {
        &self.core
    }

    /// Open the database file at `path`, creating it if absent.
    ///
    /// Fails if the connection is already open, if `path` is empty, or if
    /// the engine refuses the file. Foreign key enforcement is switched on
    /// for the lifetime of the connection.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(db) = self.core.db.borrow().as_ref() {
            return Err(Error::AlreadyOpen {
                path: db.path.clone(),
            });
        }
        if path.as_os_str().is_empty() {
            return Err(Error::CannotOpen {
                path: path.to_path_buf(),
                message: "empty path".to_owned(),
            });
        }
        let cpath = path
            .to_str()
            .and_then(|s| CString::new(s).ok())
            .ok_or_else(|| Error::CannotOpen {
                path: path.to_path_buf(),
                message: "path is not valid UTF-8".to_owned(),
            })?;
        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        let rc = unsafe { ffi::sqlite3_open_v2(cpath.as_ptr(), &mut db, flags, ptr::null()) };
        if rc != ffi::SQLITE_OK {
            let message = if db.is_null() {
                "out of memory".to_owned()
            } else {
                let err = engine_error(db);
                // A failed open still hands back a handle that must be
                // closed.
                unsafe { ffi::sqlite3_close(db) };
                err.to_string()
            };
            return Err(Error::CannotOpen {
                path: path.to_path_buf(),
                message,
            });
        }
        unsafe { ffi::sqlite3_extended_result_codes(db, 1) };
        *self.core.db.borrow_mut() = Some(RawDb {
            ptr: db,
            path: path.to_path_buf(),
        });
        self.core.execute_sql("pragma foreign_keys = on")?;
        tracing::debug!(path = %path.display(), "database connection opened");
        Ok(())
    }

    /// Whether this connection is open.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.core.is_open()
    }

    /// Execute raw SQL without caching. Compound statements are allowed;
    /// use this for DDL and one-shot DML.
    pub fn execute_sql(&self, sql: &str) -> Result<()> {
        self.core.execute_sql(sql)
    }

    /// Lease a prepared statement for `sql` from the connection's cache.
    ///
    /// `sql` must contain exactly one statement. The lease is scoped:
    /// dropping it resets the statement and returns it to the cache.
    pub fn statement(&self, sql: &str) -> Result<Statement> {
        self.core.statement(sql)
    }

    /// The identity map for base type `B`, constructed on first use.
    pub fn identity_map<B>(&self) -> IdentityMap<B>
    where
        B: Persistent<Base = B>,
    {
        IdentityMap::from_core(self.core.map_core_for(TypeId::of::<B>()))
    }

    /// Rowid assigned by the most recent successful insert on this
    /// connection.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        self.core.last_insert_rowid()
    }

    /// Current transaction nesting depth (0 when outside any transaction).
    #[must_use]
    pub fn transaction_nesting_level(&self) -> usize {
        self.core.tx.borrow().depth()
    }

    /// Open a transaction level directly. Prefer the scope-bound
    /// [`DatabaseTransaction`](crate::DatabaseTransaction) guard, which
    /// cancels on early exits for you.
    pub fn begin_transaction(&self) -> Result<()> {
        self.core.tx_begin()
    }

    /// Commit the innermost transaction level.
    pub fn commit_transaction(&self) -> Result<()> {
        self.core.tx_commit()
    }

    /// Cancel the innermost transaction level.
    pub fn cancel_transaction(&self) -> Result<()> {
        self.core.tx_cancel()
    }

    #[cfg(test)]
    pub(crate) fn cached_statement_count(&self) -> usize {
        self.core.stmts.borrow().cached_len()
    }
}
