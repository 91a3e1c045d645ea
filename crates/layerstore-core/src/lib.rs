//! Layerstore Core Library
//!
//! Layered working contexts over a SQLite record store. A stack opens its
//! store in the background, seeds it on first run, and flushes changes from
//! a foreground context through a background context into the database.
//!
//! # Architecture
//!
//! - **private**: root context, owns the store, runs on a background domain
//! - **main**: child of private, the context callers read and write through
//! - **scoped children**: children of main for isolated units of work
//!
//! # Quick Start
//!
//! ```text
//! let seeder = |main: &WorkingContext| {
//!     main.insert("Book", "dune", &json!({"title": "Dune"})).ok();
//! };
//! let stack = PersistenceStack::new("catalog", Some(Arc::new(seeder)))?;
//! stack.wait_until_settled().await?;
//!
//! let child = stack.new_scoped_child_context()?;
//! child.insert("Book", "emma", &json!({"title": "Emma"}))?;
//! child.save()?;
//!
//! stack.save_changes(|e| tracing::error!("{}", e));
//! ```
//!
//! # Modules
//!
//! - `stack`: Stack construction, initialization and save propagation
//! - `context`: Working contexts and their confinement domains
//! - `storage`: SQLite record store and store opening
//! - `model`: Model definitions and where to find them
//! - `record`: Record keys and change sets
//! - `notification`: Lifecycle notifications
//! - `config`: Configuration
//! - `logging`: File-based tracing setup

pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod model;
pub mod notification;
pub mod record;
pub mod stack;
pub mod storage;

pub use config::{Config, FileProtection, JournalMode, StoreSettings};
pub use context::{Confinement, WorkingContext};
pub use error::{ContextError, InitError, SaveError, Tier};
pub use model::{EntityDef, Model, ModelDirectory, ModelSource, StaticModels};
pub use notification::{Notification, NotificationCenter};
pub use record::{Change, ChangeSet, Record, RecordKey};
pub use stack::{PersistenceStack, SaveReceipt, Seeder, StackOptions, StackState};
pub use storage::{SqliteStore, StorageError, StoreOpener};
