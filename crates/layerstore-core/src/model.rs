//! Model definitions
//!
//! A model names the entities a store may hold and carries a version used for
//! automatic migration. Models are resolved by identifier through a
//! `ModelSource`: either a directory of `<identifier>.model.toml` files or an
//! in-process table.
//!
//! ```toml
//! name = "catalog"
//! version = 2
//!
//! [[entities]]
//! name = "Book"
//!
//! [[entities]]
//! name = "Writer"
//! renamed_from = "Author"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ContextError, InitError};
use crate::record::{Change, ChangeSet};

/// A versioned set of entity declarations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub entities: Vec<EntityDef>,
}

/// One entity declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    /// Previous name, used to carry rows across a rename during migration
    #[serde(default)]
    pub renamed_from: Option<String>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            renamed_from: None,
        }
    }

    pub fn renamed_from(mut self, old: impl Into<String>) -> Self {
        self.renamed_from = Some(old.into());
        self
    }
}

impl Model {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            entities: Vec::new(),
        }
    }

    pub fn with_entity(mut self, entity: EntityDef) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn has_entity(&self, name: &str) -> bool {
        self.entity(name).is_some()
    }

    /// Check that every change targets a declared entity and upserts an object
    pub fn validate(&self, changes: &ChangeSet) -> Result<(), ContextError> {
        for (key, change) in changes.iter() {
            if !self.has_entity(&key.entity) {
                return Err(ContextError::UnknownEntity {
                    entity: key.entity.clone(),
                    model: self.name.clone(),
                });
            }
            if let Change::Upsert(body) = change {
                if !body.is_object() {
                    return Err(ContextError::InvalidRecord {
                        key: key.to_string(),
                        reason: "body must be a JSON object".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn default_version() -> u32 {
    1
}

/// Resolves a model by identifier
pub trait ModelSource: Send + Sync {
    /// Returns `InitError::ModelNotFound` when nothing is registered under `identifier`
    fn resolve(&self, identifier: &str) -> Result<Model, InitError>;
}

/// Models read from `<dir>/<identifier>.model.toml`
#[derive(Debug, Clone)]
pub struct ModelDirectory {
    dir: PathBuf,
}

impl ModelDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{}.model.toml", identifier))
    }
}

impl ModelSource for ModelDirectory {
    fn resolve(&self, identifier: &str) -> Result<Model, InitError> {
        let not_found = || InitError::ModelNotFound {
            identifier: identifier.to_string(),
        };

        // Identifiers name files directly under the directory
        let path_like = identifier.contains(|c: char| c == '/' || c == '\\');
        if identifier.is_empty() || path_like || identifier == ".." {
            return Err(not_found());
        }

        let path = self.path_for(identifier);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => {
                return Err(InitError::InvalidModel {
                    identifier: identifier.to_string(),
                    details: format!("failed to read {:?}: {}", path, e),
                })
            }
        };

        toml::from_str(&content).map_err(|e| InitError::InvalidModel {
            identifier: identifier.to_string(),
            details: e.to_string(),
        })
    }
}

/// Models registered in-process
#[derive(Debug, Clone, Default)]
pub struct StaticModels {
    models: HashMap<String, Model>,
}

impl StaticModels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `model` under its own name
    pub fn with(mut self, model: Model) -> Self {
        self.models.insert(model.name.clone(), model);
        self
    }

    pub fn insert(&mut self, identifier: impl Into<String>, model: Model) {
        self.models.insert(identifier.into(), model);
    }
}

impl ModelSource for StaticModels {
    fn resolve(&self, identifier: &str) -> Result<Model, InitError> {
        self.models
            .get(identifier)
            .cloned()
            .ok_or_else(|| InitError::ModelNotFound {
                identifier: identifier.to_string(),
            })
    }
}
