//! Store opener
//!
//! Resolves a model identifier to a model and a backing file, then opens the
//! storage engine with the configured options. Runs once per stack, on the
//! initialization worker.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::sqlite::SqliteStore;
use crate::config::Config;
use crate::error::InitError;
use crate::model::ModelSource;

/// A store that opened successfully
pub struct OpenedStore {
    pub store: SqliteStore,
    pub path: PathBuf,
    /// Whether the backing file was already there before opening
    pub preexisting: bool,
}

/// Opens the backing store for a model identifier
pub struct StoreOpener<'a> {
    config: &'a Config,
    models: &'a dyn ModelSource,
}

impl<'a> StoreOpener<'a> {
    pub fn new(config: &'a Config, models: &'a dyn ModelSource) -> Self {
        Self { config, models }
    }

    /// Resolve the model, then create or open `<identifier>.sqlite`
    pub fn open(&self, identifier: &str) -> Result<OpenedStore, InitError> {
        let model = self.models.resolve(identifier)?;
        let path = self.config.store_path(identifier);

        let preexisting = match path.try_exists() {
            Ok(exists) => exists,
            Err(e) => {
                warn!("Could not check for existing store {:?}: {}", path, e);
                false
            }
        };
        debug!(
            "Opening store {:?} (model '{}' v{}, preexisting={})",
            path, model.name, model.version, preexisting
        );

        let store = SqliteStore::open(&path, model, &self.config.store).map_err(|source| {
            InitError::StoreOpen {
                path: path.clone(),
                source,
            }
        })?;

        info!("Store for '{}' opened at {:?}", identifier, path);
        Ok(OpenedStore {
            store,
            path,
            preexisting,
        })
    }
}
