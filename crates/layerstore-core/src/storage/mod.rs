//! Storage layer
//!
//! Opens the SQLite record store that backs a stack's root context.
//!
//! ## Layout
//!
//! - One `<identifier>.sqlite` file per model in the data directory
//! - `records` holds every entity's rows as JSON bodies
//! - `schema_info` / `entities` remember the model the store was opened with,
//!   so a newer model version migrates the store on open

pub mod error;
pub mod opener;
pub mod schema;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use opener::{OpenedStore, StoreOpener};
pub use schema::SCHEMA_VERSION;
pub use sqlite::SqliteStore;
