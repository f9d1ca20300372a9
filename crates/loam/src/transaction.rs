//! Nested savepoint-structured transactions with strict rollback.
//!
//! Depth 0→1 issues `BEGIN`; deeper levels issue `SAVEPOINT sp_<depth>`.
//! Each level carries a rollback frame of callbacks registered by object
//! saves. Committing an inner level merges its frame into the enclosing
//! one, so an outer cancel still rolls inner changes back in memory.
//! A coordinator-level SQL failure poisons the stack: commit is refused
//! at every level until the outermost cancel clears it.

use std::rc::Rc;

use loam_error::{Error, Result};

use crate::connection::{ConnectionCore, DatabaseConnection};

/// Why a rollback frame entry is being consumed.
pub(crate) enum RollbackDisposition {
    /// The transaction level was cancelled: undo in-memory effects.
    Cancel,
    /// The outermost commit succeeded: discard, releasing registrations.
    Release,
}

pub(crate) type RollbackEntry = Box<dyn FnOnce(RollbackDisposition)>;

pub(crate) struct TransactionStack {
    frames: Vec<Vec<RollbackEntry>>,
    poisoned: bool,
}

impl TransactionStack {
    pub(crate) fn new() -> Self {
        Self {
            frames: Vec::new(),
            poisoned: false,
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn poison(&mut self) {
        self.poisoned = true;
    }

    fn push_frame(&mut self) {
        self.frames.push(Vec::new());
    }

    fn pop_frame(&mut self) -> Vec<RollbackEntry> {
        self.frames.pop().unwrap_or_default()
    }

    /// Merge the innermost frame into its parent (inner commit).
    fn merge_top_frame(&mut self) {
        let merged = self.pop_frame();
        if let Some(parent) = self.frames.last_mut() {
            parent.extend(merged);
        }
    }

    /// Register a rollback callback with the innermost open frame.
    pub(crate) fn register(&mut self, entry: RollbackEntry) {
        debug_assert!(!self.frames.is_empty(), "no open transaction frame");
        if let Some(frame) = self.frames.last_mut() {
            frame.push(entry);
        }
    }
}

impl ConnectionCore {
    /// Open a transaction level: `BEGIN` at depth 0, a savepoint below.
    pub(crate) fn tx_begin(self: &Rc<Self>) -> Result<()> {
        let depth = {
            let tx = self.tx.borrow();
            if tx.is_poisoned() {
                return Err(Error::TransactionNesting {
                    detail: "transaction is poisoned; cancel it first",
                });
            }
            tx.depth()
        };
        if depth == 0 {
            self.statement("begin transaction")?.step_final()?;
        } else {
            self.statement(&format!("savepoint sp_{depth}"))?
                .step_final()?;
        }
        self.tx.borrow_mut().push_frame();
        tracing::debug!(depth = depth + 1, "transaction level opened");
        Ok(())
    }

    /// Commit the innermost level. At depth 1 this is the real `COMMIT`
    /// and every retained rollback registration is released; deeper levels
    /// release their savepoint and merge their frame into the parent.
    pub(crate) fn tx_commit(self: &Rc<Self>) -> Result<()> {
        let depth = {
            let tx = self.tx.borrow();
            if tx.depth() == 0 {
                return Err(Error::TransactionNesting {
                    detail: "commit without matching begin",
                });
            }
            if tx.is_poisoned() {
                return Err(Error::TransactionNesting {
                    detail: "commit refused: transaction is poisoned",
                });
            }
            tx.depth()
        };
        if depth == 1 {
            if let Err(err) = self
                .statement("commit")
                .and_then(|mut stmt| stmt.step_final())
            {
                self.tx.borrow_mut().poison();
                tracing::warn!(error = %err, "commit failed; transaction poisoned");
                return Err(err);
            }
            let entries = self.tx.borrow_mut().pop_frame();
            for entry in entries.into_iter().rev() {
                entry(RollbackDisposition::Release);
            }
            tracing::debug!("transaction committed");
        } else {
            let name = depth - 1;
            if let Err(err) = self
                .statement(&format!("release savepoint sp_{name}"))
                .and_then(|mut stmt| stmt.step_final())
            {
                self.tx.borrow_mut().poison();
                tracing::warn!(error = %err, "savepoint release failed; transaction poisoned");
                return Err(err);
            }
            self.tx.borrow_mut().merge_top_frame();
            tracing::debug!(depth, "savepoint released");
        }
        Ok(())
    }

    /// Cancel the innermost level and run its rollback frame in reverse
    /// registration order.
    pub(crate) fn tx_cancel(self: &Rc<Self>) -> Result<()> {
        let depth = {
            let tx = self.tx.borrow();
            if tx.depth() == 0 {
                return Err(Error::TransactionNesting {
                    detail: "cancel without matching begin",
                });
            }
            tx.depth()
        };
        let sql_result = if depth == 1 {
            self.statement("rollback")
                .and_then(|mut stmt| stmt.step_final())
        } else {
            let name = depth - 1;
            self.statement(&format!("rollback to savepoint sp_{name}"))
                .and_then(|mut stmt| stmt.step_final())
                .and_then(|()| {
                    self.statement(&format!("release savepoint sp_{name}"))
                        .and_then(|mut stmt| stmt.step_final())
                })
        };
        // In-memory rollback happens even when the SQL side failed; the
        // registered callbacks are the only route back to a coherent
        // object state.
        let entries = self.tx.borrow_mut().pop_frame();
        for entry in entries.into_iter().rev() {
            entry(RollbackDisposition::Cancel);
        }
        if depth == 1 {
            // The outermost cancel always clears poisoning: the stack is
            // empty again and new transactions must be possible.
            self.tx.borrow_mut().poisoned = false;
        }
        match sql_result {
            Ok(()) => {
                tracing::debug!(depth, "transaction level cancelled");
                Ok(())
            }
            Err(err) => {
                if depth > 1 {
                    self.tx.borrow_mut().poison();
                }
                tracing::warn!(error = %err, depth, "rollback failed");
                Err(err)
            }
        }
    }

    pub(crate) fn tx_register_rollback(&self, entry: RollbackEntry) {
        self.tx.borrow_mut().register(entry);
    }
}

/// Scope-bound database transaction.
///
/// Begins on construction. If the guard is dropped without an explicit
/// [`commit`](DatabaseTransaction::commit) or
/// [`cancel`](DatabaseTransaction::cancel), the level is cancelled.
pub struct DatabaseTransaction<'c> {
    conn: &'c DatabaseConnection,
    active: bool,
}

impl<'c> DatabaseTransaction<'c> {
    /// Open a transaction level on `conn`.
    pub fn begin(conn: &'c DatabaseConnection) -> Result<Self> {
        conn.core().tx_begin()?;
        Ok(Self { conn, active: true })
    }

    /// Commit this level. On failure the level is forced closed by a
    /// cancel so the guard's scope discipline holds, and the commit error
    /// propagates.
    pub fn commit(mut self) -> Result<()> {
        self.active = false;
        match self.conn.core().tx_commit() {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = self.conn.core().tx_cancel();
                Err(err)
            }
        }
    }

    /// Cancel this level, rolling back the database and every object save
    /// registered within it.
    pub fn cancel(mut self) -> Result<()> {
        self.active = false;
        self.conn.core().tx_cancel()
    }
}

impl Drop for DatabaseTransaction<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = self.conn.core().tx_cancel() {
                tracing::error!(error = %err, "implicit transaction cancel failed");
            }
        }
    }
}
