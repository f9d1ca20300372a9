//! Prepared-statement wrapper over the engine's C API.
//!
//! [`StatementHandle`] owns exactly one `sqlite3_stmt` and keeps it reusable
//! across errors: any engine failure during step or bind puts the handle
//! back into a clean state (reset, bindings cleared) before the error
//! propagates, so the statement cache can hand it out again. The public
//! lease type is [`Statement`], which returns the handle to the cache on
//! drop.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::rc::Rc;

use libsqlite3_sys as ffi;
use loam_error::{Error, Result};

use crate::connection::ConnectionCore;

/// Read the extended result code and message for the most recent failure
/// on `db`.
pub(crate) fn engine_error(db: *mut ffi::sqlite3) -> Error {
    let (extended, message) = unsafe {
        let extended = ffi::sqlite3_extended_errcode(db);
        let msg = ffi::sqlite3_errmsg(db);
        let message = if msg.is_null() {
            String::from("unknown engine error")
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        };
        (extended, message)
    };
    Error::from_engine(extended, message)
}

fn storage_class_name(class: c_int) -> &'static str {
    match class {
        ffi::SQLITE_INTEGER => "integer",
        ffi::SQLITE_FLOAT => "float",
        ffi::SQLITE_TEXT => "text",
        ffi::SQLITE_BLOB => "blob",
        ffi::SQLITE_NULL => "null",
        _ => "unknown",
    }
}

/// Wrapper for a single prepared statement.
///
/// Instances are owned by the per-connection statement cache and leased to
/// user code through [`Statement`]. The `locked` flag is the advisory
/// single-owner marker the cache consults so one statement is never
/// executed re-entrantly.
pub(crate) struct StatementHandle {
    stmt: *mut ffi::sqlite3_stmt,
    db: *mut ffi::sqlite3,
    locked: bool,
}

impl StatementHandle {
    /// Prepare `sql` against `db`.
    ///
    /// `sql` must contain exactly one SQL statement, optionally terminated
    /// by any mixture of semicolons and spaces. Anything else in the
    /// parser's trailing unparsed region fails with
    /// [`Error::TooManyStatements`].
    pub(crate) fn prepare(db: *mut ffi::sqlite3, sql: &str) -> Result<Self> {
        let len = c_int::try_from(sql.len())
            .map_err(|_| Error::from_engine(18, "SQL statement too long"))?;
        let mut stmt: *mut ffi::sqlite3_stmt = std::ptr::null_mut();
        let mut tail: *const c_char = std::ptr::null();
        let head = sql.as_ptr().cast::<c_char>();
        let rc = unsafe { ffi::sqlite3_prepare_v2(db, head, len, &mut stmt, &mut tail) };
        if rc != ffi::SQLITE_OK {
            return Err(engine_error(db));
        }
        let consumed = if tail.is_null() {
            sql.len()
        } else {
            // Both pointers are into `sql`; the difference is the byte
            // offset where the first statement ended.
            usize::try_from(unsafe { tail.offset_from(head) }).unwrap_or(sql.len())
        };
        if sql.as_bytes()[consumed..]
            .iter()
            .any(|&b| b != b';' && b != b' ')
        {
            unsafe { ffi::sqlite3_finalize(stmt) };
            return Err(Error::TooManyStatements);
        }
        Ok(Self {
            stmt,
            db,
            locked: false,
        })
    }

    /// Execute one step. Returns `true` while result rows remain.
    ///
    /// Stepping past the last row returns `false` and resets the statement,
    /// so the next call re-executes from the first row. On any engine
    /// error the statement is reset, its bindings are cleared, and the
    /// error is re-raised.
    pub(crate) fn step(&mut self) -> Result<bool> {
        if self.stmt.is_null() {
            // Whitespace-only statement text compiles to no statement.
            return Ok(false);
        }
        let rc = unsafe { ffi::sqlite3_step(self.stmt) };
        match rc {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => {
                unsafe { ffi::sqlite3_reset(self.stmt) };
                Ok(false)
            }
            _ => {
                let err = engine_error(self.db);
                self.reset();
                self.clear_bindings();
                Err(err)
            }
        }
    }

    /// Step a statement that must not produce a result row.
    pub(crate) fn step_final(&mut self) -> Result<()> {
        if self.step()? {
            self.reset();
            return Err(Error::UnexpectedResultRow);
        }
        Ok(())
    }

    /// Bind `value` to the named parameter.
    pub(crate) fn bind<V: BindValue>(&mut self, name: &str, value: V) -> Result<()> {
        match self.try_bind(name, value) {
            Ok(()) => Ok(()),
            Err(err) => {
                // Clean state first so the handle stays reusable.
                self.reset();
                self.clear_bindings();
                Err(err)
            }
        }
    }

    fn try_bind<V: BindValue>(&mut self, name: &str, value: V) -> Result<()> {
        let index = self.parameter_index(name)?;
        let rc = value.bind_raw(self.stmt, index);
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(engine_error(self.db))
        }
    }

    fn parameter_index(&self, name: &str) -> Result<c_int> {
        let missing = || Error::NoSuchParameter {
            name: name.to_owned(),
        };
        if self.stmt.is_null() {
            return Err(missing());
        }
        let cname = CString::new(name).map_err(|_| missing())?;
        let index = unsafe { ffi::sqlite3_bind_parameter_index(self.stmt, cname.as_ptr()) };
        if index == 0 {
            return Err(missing());
        }
        Ok(index)
    }

    /// Extract the value at `index` from the current result row.
    ///
    /// Fails if no row is available, if `index` is out of range, or if the
    /// column's dynamic type is incompatible with `V`. A failed extract
    /// leaves the statement untouched; the current row stays extractable.
    pub(crate) fn extract<V: ColumnValue>(&self, index: usize) -> Result<V> {
        self.check_column(index, V::STORAGE_CLASS, V::NAME)?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        Ok(V::read(self.stmt, index as c_int))
    }

    fn check_column(&self, index: usize, class: c_int, requested: &'static str) -> Result<()> {
        if self.stmt.is_null() {
            return Err(Error::NoResultRow);
        }
        // data_count is zero unless the last step produced a row.
        let available = unsafe { ffi::sqlite3_data_count(self.stmt) };
        if available == 0 {
            return Err(Error::NoResultRow);
        }
        let count = usize::try_from(available).unwrap_or(0);
        if index >= count {
            return Err(Error::ResultIndexOutOfRange { index, count });
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let actual = unsafe { ffi::sqlite3_column_type(self.stmt, index as c_int) };
        if actual != class {
            return Err(Error::ValueType {
                index,
                requested,
                actual: storage_class_name(actual),
            });
        }
        Ok(())
    }

    /// Reset the statement ready for re-execution. Never fails.
    pub(crate) fn reset(&mut self) {
        if !self.stmt.is_null() {
            unsafe { ffi::sqlite3_reset(self.stmt) };
        }
    }

    /// Clear all parameter bindings to NULL. Never fails.
    pub(crate) fn clear_bindings(&mut self) {
        if !self.stmt.is_null() {
            unsafe { ffi::sqlite3_clear_bindings(self.stmt) };
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.locked
    }

    pub(crate) fn lock(&mut self) {
        self.locked = true;
    }

    pub(crate) fn unlock(&mut self) {
        self.locked = false;
    }
}

impl Drop for StatementHandle {
    fn drop(&mut self) {
        if !self.stmt.is_null() {
            unsafe { ffi::sqlite3_finalize(self.stmt) };
            self.stmt = std::ptr::null_mut();
        }
    }
}

/// A scoped lease of a prepared statement from the connection's cache.
///
/// Dropping the lease resets the statement, clears its bindings, and
/// returns it to the cache, on every exit path. The lease also keeps the
/// connection alive, so the underlying `sqlite3_stmt` can never outlive
/// its database handle.
pub struct Statement {
    handle: Rc<RefCell<StatementHandle>>,
    // Keeps the database open for as long as the lease exists.
    _core: Rc<ConnectionCore>,
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement").finish_non_exhaustive()
    }
}

impl Statement {
    pub(crate) fn new(handle: Rc<RefCell<StatementHandle>>, core: Rc<ConnectionCore>) -> Self {
        Self {
            handle,
            _core: core,
        }
    }

    /// Bind `value` to the parameter named `name` (`:name` syntax).
    ///
    /// Supported value types: `i32`, `i64`, `f64`, `&str`, `String`.
    pub fn bind<V: BindValue>(&mut self, name: &str, value: V) -> Result<()> {
        self.handle.borrow_mut().bind(name, value)
    }

    /// Execute one step; `true` while result rows remain. See
    /// [`StatementHandle::step`] for reset-on-completion semantics.
    pub fn step(&mut self) -> Result<bool> {
        self.handle.borrow_mut().step()
    }

    /// Step a statement that must not produce a result row.
    pub fn step_final(&mut self) -> Result<()> {
        self.handle.borrow_mut().step_final()
    }

    /// Extract the value at column `index` (starting at 0) of the current
    /// result row.
    pub fn extract<V: ColumnValue>(&self, index: usize) -> Result<V> {
        self.handle.borrow().extract(index)
    }

    /// Reset the statement ready for re-binding and re-execution.
    pub fn reset(&mut self) {
        self.handle.borrow_mut().reset();
    }

    /// Clear all parameter bindings, setting them to NULL.
    pub fn clear_bindings(&mut self) {
        self.handle.borrow_mut().clear_bindings();
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        let mut handle = self.handle.borrow_mut();
        handle.reset();
        handle.clear_bindings();
        handle.unlock();
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for f64 {}
    impl Sealed for &str {}
    impl Sealed for String {}
}

/// Value types that can be bound to a statement parameter.
pub trait BindValue: sealed::Sealed {
    #[doc(hidden)]
    fn bind_raw(self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> c_int;
}

impl BindValue for i32 {
    fn bind_raw(self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> c_int {
        unsafe { ffi::sqlite3_bind_int(stmt, index, self) }
    }
}

impl BindValue for i64 {
    fn bind_raw(self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> c_int {
        unsafe { ffi::sqlite3_bind_int64(stmt, index, self) }
    }
}

impl BindValue for f64 {
    fn bind_raw(self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> c_int {
        unsafe { ffi::sqlite3_bind_double(stmt, index, self) }
    }
}

impl BindValue for &str {
    fn bind_raw(self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> c_int {
        let len = match c_int::try_from(self.len()) {
            Ok(len) => len,
            Err(_) => return ffi::SQLITE_TOOBIG,
        };
        // SQLITE_TRANSIENT makes the engine copy the text immediately.
        unsafe {
            ffi::sqlite3_bind_text(
                stmt,
                index,
                self.as_ptr().cast::<c_char>(),
                len,
                ffi::SQLITE_TRANSIENT(),
            )
        }
    }
}

impl BindValue for String {
    fn bind_raw(self, stmt: *mut ffi::sqlite3_stmt, index: c_int) -> c_int {
        self.as_str().bind_raw(stmt, index)
    }
}

/// Value types that can be extracted from a result column.
///
/// Extraction is strict: the column's dynamic storage class must match the
/// requested type exactly (integer columns for the integer types, float
/// columns for `f64`, text columns for `String`).
pub trait ColumnValue: Sized + sealed::Sealed {
    #[doc(hidden)]
    const STORAGE_CLASS: c_int;
    #[doc(hidden)]
    const NAME: &'static str;
    #[doc(hidden)]
    fn read(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Self;
}

impl ColumnValue for i32 {
    const STORAGE_CLASS: c_int = ffi::SQLITE_INTEGER;
    const NAME: &'static str = "integer";
    fn read(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Self {
        unsafe { ffi::sqlite3_column_int(stmt, index) }
    }
}

impl ColumnValue for i64 {
    const STORAGE_CLASS: c_int = ffi::SQLITE_INTEGER;
    const NAME: &'static str = "integer";
    fn read(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Self {
        unsafe { ffi::sqlite3_column_int64(stmt, index) }
    }
}

impl ColumnValue for f64 {
    const STORAGE_CLASS: c_int = ffi::SQLITE_FLOAT;
    const NAME: &'static str = "float";
    fn read(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Self {
        unsafe { ffi::sqlite3_column_double(stmt, index) }
    }
}

impl ColumnValue for String {
    const STORAGE_CLASS: c_int = ffi::SQLITE_TEXT;
    const NAME: &'static str = "text";
    fn read(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Self {
        let bytes = unsafe {
            let ptr = ffi::sqlite3_column_text(stmt, index);
            if ptr.is_null() {
                return String::new();
            }
            let len = usize::try_from(ffi::sqlite3_column_bytes(stmt, index)).unwrap_or(0);
            std::slice::from_raw_parts(ptr, len)
        };
        String::from_utf8_lossy(bytes).into_owned()
    }
}
