//! Storage engine for an append-only JSON document store with a
//! persistent, ordered secondary index.
//!
//! [`database::Database`] is the entry point: it pairs a data file with
//! its index file and knows when the index needs to be (re)built.
//! Everything below it is layered file formats, each built on the one
//! before:
//!
//! - [`file`] — a single file handle with positional read/write and
//!   advisory locking.
//! - [`byte_reader`] — a bidirectional UTF-8 stream over a [`file::File`].
//! - [`scanner`] — locates one JSON value's byte range inside an array.
//! - [`store`] — treats a file as a JSON array: create, append, get, scan.
//! - [`z85`] and [`entry`] — the fixed-width binary encoding index nodes
//!   are stored in, and the skip-list node format built on it.
//! - [`predicate`] — comparison keys and range predicates for queries.
//! - [`index`] — the per-field skip list itself.

pub mod byte_reader;
pub mod database;
pub mod entry;
pub mod error;
pub mod file;
pub mod index;
pub mod predicate;
pub mod scanner;
pub mod store;
pub mod z85;

pub use database::Database;
pub use error::{Error, Result};
pub use index::{FieldSpec, Index};
pub use predicate::{build_predicate, Comparison, FieldType, Key, Op, RangePredicate};
