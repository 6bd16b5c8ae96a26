#![forbid(unsafe_code)]

//! # jobdb
//!
//! Metadata bookkeeping for computational chemistry jobs.
//!
//! Job properties arrive from many places: a guess from the file name, the
//! property block of a job document, or values typed in by hand. `jobdb`
//! layers them into a property set, normalizes that set against a fixed
//! [`Schema`], and appends the resulting [`Row`] to a SQLite-backed
//! [`RecordStore`]. The authoritative copy of the store is a deterministic
//! JSONL dump ([`codec`]) that can live in version control; the indexed
//! SQLite copy is rebuilt from it on demand.

pub mod codec;
pub mod config;
pub mod error;
pub mod identifier;
pub mod normalize;
pub mod properties;
pub mod row;
pub mod schema;
pub mod store;

pub use config::JobDbConfig;
pub use error::{JobDbError, Result};
pub use identifier::{resolve, resolve_or_prompt, Identifier, IdentifierPrompt};
pub use normalize::{normalize, normalize_batch};
pub use properties::{PropertyMarkers, PropertySet};
pub use row::{Row, Value};
pub use schema::{ColumnDef, ColumnKind, Schema};
pub use store::{Filter, RecordStore, StoreLock};
