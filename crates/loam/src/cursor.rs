//! Forward cursors over primary-key result sets.
//!
//! A [`TableCursor`] steps through a `SELECT <pk> FROM <table>` result
//! set and materializes each row into a [`Handle`] through the identity
//! map. Clones share the underlying statement: advancing any clone
//! advances the one shared stream, exactly like an input-stream iterator.

use std::cell::RefCell;
use std::rc::Rc;

use loam_error::{Error, Result};

use crate::connection::DatabaseConnection;
use crate::handle::Handle;
use crate::object::Persistent;
use crate::statement::Statement;
use crate::types::Id;

struct CursorStream {
    conn: DatabaseConnection,
    stmt: Statement,
}

pub struct TableCursor<T: Persistent> {
    stream: Option<Rc<RefCell<CursorStream>>>,
    current: Option<Handle<T>>,
    pending_error: Option<Error>,
}

impl<T: Persistent> TableCursor<T> {
    /// Cursor over every row of the type's exclusive table.
    pub fn new(conn: &DatabaseConnection) -> Result<Self> {
        Self::with_statement(
            conn,
            &format!(
                "select {pk} from {table}",
                pk = T::primary_key_name(),
                table = T::exclusive_table_name(),
            ),
        )
    }

    /// Cursor over a caller-supplied SELECT whose first column is the
    /// primary key of `T`. The cursor is positioned on the first row
    /// immediately (or exhausted, for an empty result set).
    pub fn with_statement(conn: &DatabaseConnection, sql: &str) -> Result<Self> {
        let stmt = conn.statement(sql)?;
        let stream = CursorStream {
            conn: DatabaseConnection::from_core(Rc::clone(conn.core())),
            stmt,
        };
        let mut cursor = Self {
            stream: Some(Rc::new(RefCell::new(stream))),
            current: None,
            pending_error: None,
        };
        cursor.advance()?;
        Ok(cursor)
    }

    /// A cursor holding no element. Compares equal to any cursor that has
    /// run off the end of its result set, so it serves as the `end`
    /// marker in comparisons.
    #[must_use]
    pub fn sentinel() -> Self {
        Self {
            stream: None,
            current: None,
            pending_error: None,
        }
    }

    /// The handle currently pointed to, or [`Error::UnboundHandle`] for a
    /// sentinel or exhausted cursor.
    pub fn current(&self) -> Result<&Handle<T>> {
        self.current.as_ref().ok_or(Error::UnboundHandle)
    }

    /// Whether the cursor holds no element.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.current.is_none()
    }

    /// Step the shared stream one row forward. Every clone sharing the
    /// stream observes the advance; only this cursor's element changes.
    ///
    /// Advancing an exhausted cursor re-executes the statement from the
    /// first row, mirroring the engine's step-after-done behavior.
    pub fn advance(&mut self) -> Result<()> {
        let Some(stream) = &self.stream else {
            self.current = None;
            return Ok(());
        };
        let mut stream = stream.borrow_mut();
        if stream.stmt.step()? {
            let id: Id = stream.stmt.extract(0)?;
            let handle = Handle::get_unchecked(&stream.conn, id)?;
            drop(stream);
            self.current = Some(handle);
        } else {
            drop(stream);
            self.current = None;
        }
        Ok(())
    }
}

impl<T: Persistent> Default for TableCursor<T> {
    fn default() -> Self {
        Self::sentinel()
    }
}

impl<T: Persistent> Clone for TableCursor<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            current: self.current.clone(),
            pending_error: None,
        }
    }
}

/// Cursors compare equal exactly when neither side currently holds a
/// materialized element.
impl<T: Persistent> PartialEq for TableCursor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.current.is_none() && other.current.is_none()
    }
}

impl<T: Persistent> Iterator for TableCursor<T> {
    type Item = Result<Handle<T>>;

    /// Yields the element the cursor is positioned on and advances the
    /// shared stream, so the previous element is returned while every
    /// clone already sees the new position.
    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.pending_error.take() {
            return Some(Err(err));
        }
        let current = self.current.take()?;
        if let Err(err) = self.advance() {
            self.pending_error = Some(err);
        }
        Some(Ok(current))
    }
}
