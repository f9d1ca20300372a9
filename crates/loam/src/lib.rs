//! # loam: typed persistence over an embedded SQLite database
//!
//! loam lets application code model business entities as row-backed
//! objects stored in a single-file database, with three guarantees that
//! hold simultaneously:
//!
//! - **One object per row**: each row is represented by at most one live
//!   in-memory object per connection, enforced by a per-type identity
//!   map. Independent [`Handle`]s to the same row always reference the
//!   same object.
//! - **Deterministic convergence**: concurrent mutations through
//!   independent handles act on that single object, and transactions are
//!   savepoint-structured with strict rollback.
//! - **No partial state**: a failed save restores the object's in-memory
//!   fields from a snapshot and rolls the database back; a failed load
//!   leaves the object an unloaded ghost.
//!
//! ## Quick start
//!
//! ```ignore
//! use loam::{DatabaseConnection, DatabaseTransaction, Handle};
//!
//! let conn = DatabaseConnection::new();
//! conn.open("app.db")?;
//! conn.execute_sql(
//!     "create table widgets(widget_id integer primary key autoincrement, \
//!      label text not null, weight float not null)",
//! )?;
//!
//! let tx = DatabaseTransaction::begin(&conn)?;
//! let widget = Handle::<Widget>::new(&conn)?;
//! widget.update(|w| w.label = "flange".to_owned())?;
//! let id = widget.save()?;
//! tx.commit()?;
//!
//! let same = Handle::<Widget>::get(&conn, id)?;
//! assert!(widget == same);
//! ```
//!
//! `Widget` implements [`Persistent`], supplying table names and the
//! SQL hooks (`do_load`, `do_save_new`, `do_save_existing`); the state
//! machine, identity management, and rollback handling are shared.
//!
//! ## Architecture
//!
//! - [`statement`]: prepared-statement wrapper (bind / step / extract)
//!   over the engine's C API, reusable across errors
//! - `cache`: per-connection statement cache with an exclusive-use lock
//!   per handle
//! - [`connection`]: the connection core owning the engine handle, the
//!   cache, the transaction coordinator, and the identity maps
//! - [`transaction`]: nested savepoint stack with rollback frames and
//!   poisoning
//! - [`identity_map`]: the per-base-type object cache with bounded
//!   orphan retention
//! - [`object`]: the ghost/loaded/dirty/saving state machine and the
//!   [`Persistent`] trait
//! - [`handle`]: refcounted smart references
//! - [`cursor`]: lazy table cursors materializing handles
//!
//! A connection and everything reachable from it belongs to one thread;
//! the types are deliberately not `Send`/`Sync`. Different connections
//! are fully independent.

pub mod connection;
pub mod cursor;
pub mod handle;
pub mod identity_map;
pub mod object;
pub mod statement;
pub mod transaction;
pub mod types;

mod cache;

pub use connection::DatabaseConnection;
pub use cursor::TableCursor;
pub use handle::Handle;
pub use identity_map::IdentityMap;
pub use loam_error::{EngineCode, Error, Result};
pub use object::{ObjectState, Persistent};
pub use statement::{BindValue, ColumnValue, Statement};
pub use transaction::DatabaseTransaction;
pub use types::{CacheKey, Id};
