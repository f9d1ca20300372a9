//! Error types for the loam persistence layer.
//!
//! Every fallible operation in loam returns [`Error`]. Failures reported by
//! the SQLite engine itself are carried with their extended result code and
//! message; the handful of codes callers routinely branch on (constraint
//! violations, busy, read-only) get their own variants so call sites can
//! match on them without numeric comparisons.

use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for loam operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An operation was attempted on a connection that is not open.
    #[error("invalid database connection")]
    InvalidConnection,

    /// `open` was called on a connection that is already open.
    #[error("database connection is already open: '{}'", .path.display())]
    AlreadyOpen { path: PathBuf },

    /// The database file could not be opened.
    #[error("unable to open database file: '{}': {}", .path.display(), .message)]
    CannotOpen { path: PathBuf, message: String },

    /// The engine reported a constraint violation (NOT NULL, UNIQUE,
    /// FOREIGN KEY, CHECK, PRIMARY KEY).
    #[error("{message}")]
    Constraint { extended: i32, message: String },

    /// The database is locked by another connection.
    #[error("database is busy: {message}")]
    Busy { message: String },

    /// Attempt to write a read-only database.
    #[error("attempt to write a readonly database: {message}")]
    ReadOnly { message: String },

    /// Any other non-OK status from the engine.
    #[error("SQL engine error ({code:?}): {message}")]
    Engine {
        code: EngineCode,
        extended: i32,
        message: String,
    },

    /// Statement text contained more than one SQL statement.
    #[error("statement text contains more than one SQL statement")]
    TooManyStatements,

    /// A bind referred to a parameter name the statement does not declare.
    #[error("no parameter named '{name}' in statement")]
    NoSuchParameter { name: String },

    /// A column was extracted as a type incompatible with its stored type.
    #[error("column {index} holds {actual}, but {requested} was requested")]
    ValueType {
        index: usize,
        requested: &'static str,
        actual: &'static str,
    },

    /// A result column index was at or beyond the row's column count.
    #[error("result column index {index} is out of range (row has {count} columns)")]
    ResultIndexOutOfRange { index: usize, count: usize },

    /// Extraction was attempted with no current result row.
    #[error("no result row is available for extraction")]
    NoResultRow,

    /// `step_final` saw a result row.
    #[error("statement yielded a result row where none was expected")]
    UnexpectedResultRow,

    /// Dereference of a cursor or handle that is not bound to an object.
    #[error("dereference of an unbound handle")]
    UnboundHandle,

    /// An id, cache key, or handle counter could not be allocated without
    /// arithmetic overflow.
    #[error("{what} exhausted")]
    Overflow { what: &'static str },

    /// Transaction misuse: commit/cancel without a matching begin, or an
    /// operation on a poisoned transaction stack.
    #[error("transaction misuse: {detail}")]
    TransactionNesting { detail: &'static str },

    /// Checked handle construction found no row with the given id.
    #[error("no row with id {id} in table '{table}'")]
    BadIdentifier { table: &'static str, id: i64 },

    /// A typed access found a cached object of a different concrete type.
    #[error("cached object does not have the requested concrete type")]
    WrongObjectType,

    /// Forced eviction was refused because live handles still reference
    /// the object.
    #[error("object is still referenced by {handles} handle(s)")]
    ObjectInUse { handles: u32 },
}

/// SQLite primary result codes, as defined in `sqlite3.h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EngineCode {
    /// Generic error.
    Error = 1,
    /// Internal logic error in the engine.
    Internal = 2,
    /// Access permission denied.
    Perm = 3,
    /// Callback requested abort.
    Abort = 4,
    /// Database file is locked.
    Busy = 5,
    /// Table is locked.
    Locked = 6,
    /// Out of memory.
    NoMem = 7,
    /// Attempt to write a read-only database.
    ReadOnly = 8,
    /// Interrupted.
    Interrupt = 9,
    /// Disk I/O error.
    IoErr = 10,
    /// Database disk image is malformed.
    Corrupt = 11,
    /// Not found (internal).
    NotFound = 12,
    /// Database or disk is full.
    Full = 13,
    /// Unable to open database file.
    CantOpen = 14,
    /// Locking protocol error.
    Protocol = 15,
    /// (Historical, unused.)
    Empty = 16,
    /// Database schema has changed.
    Schema = 17,
    /// String or BLOB exceeds size limit.
    TooBig = 18,
    /// Constraint violation.
    Constraint = 19,
    /// Data type mismatch.
    Mismatch = 20,
    /// Library used incorrectly.
    Misuse = 21,
    /// OS feature not available.
    NoLfs = 22,
    /// Authorization denied.
    Auth = 23,
    /// (Historical, unused.)
    Format = 24,
    /// Bind parameter index out of range.
    Range = 25,
    /// Not a database file.
    NotADb = 26,
    /// Notification (not an error).
    Notice = 27,
    /// Warning (not an error).
    Warning = 28,
}

impl EngineCode {
    /// Classify a primary result code. Unknown codes collapse to `Error`.
    #[must_use]
    pub const fn from_primary(code: i32) -> Self {
        match code {
            2 => Self::Internal,
            3 => Self::Perm,
            4 => Self::Abort,
            5 => Self::Busy,
            6 => Self::Locked,
            7 => Self::NoMem,
            8 => Self::ReadOnly,
            9 => Self::Interrupt,
            10 => Self::IoErr,
            11 => Self::Corrupt,
            12 => Self::NotFound,
            13 => Self::Full,
            14 => Self::CantOpen,
            15 => Self::Protocol,
            16 => Self::Empty,
            17 => Self::Schema,
            18 => Self::TooBig,
            19 => Self::Constraint,
            20 => Self::Mismatch,
            21 => Self::Misuse,
            22 => Self::NoLfs,
            23 => Self::Auth,
            24 => Self::Format,
            25 => Self::Range,
            26 => Self::NotADb,
            27 => Self::Notice,
            28 => Self::Warning,
            _ => Self::Error,
        }
    }
}

impl Error {
    /// Build an error from an extended engine result code and message.
    ///
    /// The primary code (low byte) selects the variant: constraint, busy,
    /// and read-only failures get dedicated variants, everything else is
    /// carried as [`Error::Engine`].
    #[must_use]
    pub fn from_engine(extended: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match extended & 0xff {
            19 => Self::Constraint { extended, message },
            5 | 6 => Self::Busy { message },
            8 => Self::ReadOnly { message },
            primary => Self::Engine {
                code: EngineCode::from_primary(primary),
                extended,
                message,
            },
        }
    }

    /// The engine result code that best describes this error, for callers
    /// that need a numeric classification.
    #[must_use]
    pub const fn engine_code(&self) -> EngineCode {
        match self {
            Self::Constraint { .. } => EngineCode::Constraint,
            Self::Busy { .. } => EngineCode::Busy,
            Self::ReadOnly { .. } => EngineCode::ReadOnly,
            Self::Engine { code, .. } => *code,
            Self::CannotOpen { .. } => EngineCode::CantOpen,
            Self::ValueType { .. } => EngineCode::Mismatch,
            Self::ResultIndexOutOfRange { .. } => EngineCode::Range,
            Self::InvalidConnection
            | Self::AlreadyOpen { .. }
            | Self::TooManyStatements
            | Self::NoSuchParameter { .. }
            | Self::NoResultRow
            | Self::UnexpectedResultRow
            | Self::UnboundHandle
            | Self::Overflow { .. }
            | Self::TransactionNesting { .. }
            | Self::BadIdentifier { .. }
            | Self::WrongObjectType
            | Self::ObjectInUse { .. } => EngineCode::Error,
        }
    }

    /// Whether this failure came from the engine (as opposed to loam's own
    /// bookkeeping).
    #[must_use]
    pub const fn is_engine_error(&self) -> bool {
        matches!(
            self,
            Self::Constraint { .. }
                | Self::Busy { .. }
                | Self::ReadOnly { .. }
                | Self::Engine { .. }
        )
    }

    /// Whether a retry of the same operation may succeed without any code
    /// change (lock contention and friends).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Busy { .. }
                | Self::Engine {
                    code: EngineCode::Locked | EngineCode::Interrupt,
                    ..
                }
        )
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
