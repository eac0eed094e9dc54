use std::io;
use std::path::PathBuf;

use snafu::Snafu;

/// Errors surfaced by the storage engine.
///
/// This taxonomy is exhaustive with respect to spec §7: every other failure
/// mode (lock contention) is handled internally by waiting and never
/// reaches a caller.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A data or index file was missing for an operation that requires it.
    #[snafu(display("{path:?} does not exist"))]
    NotFound { path: PathBuf },

    /// An exclusive create was attempted against a file that already exists.
    #[snafu(display("{path:?} already exists"))]
    AlreadyExists { path: PathBuf },

    /// The on-disk representation did not parse the way the format requires.
    #[snafu(display("invalid format in {path:?}: {reason}"))]
    InvalidFormat { path: PathBuf, reason: String },

    /// `find`/`insert` referenced a field with no header entry in the index.
    #[snafu(display("field {field:?} is not indexed"))]
    FieldMissing { field: String },

    /// `find` was attempted against a field whose header has `tx = 1`.
    #[snafu(display("field {field:?} is being rebuilt and is not queryable"))]
    FieldInTransaction { field: String },

    /// A malformed predicate reached the engine (from the query parser).
    #[snafu(display("invalid predicate: {reason}"))]
    PredicateInvalid { reason: String },

    /// An underlying filesystem error.
    #[snafu(display("I/O error on {path:?}: {source}"))]
    Io { path: PathBuf, source: io::Error },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
