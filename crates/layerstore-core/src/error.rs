//! Context, save and initialization errors

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::storage::StorageError;

/// Errors raised by working context operations
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Entity '{entity}' is not declared in model '{model}'")]
    UnknownEntity { entity: String, model: String },

    #[error("Record '{key}' is invalid: {reason}")]
    InvalidRecord { key: String, reason: String },

    /// The stack has not reached the ready state
    #[error("Stack is not ready (state: {state})")]
    NotReady { state: &'static str },

    /// The root context has no store yet
    #[error("No store is bound to the root context")]
    StoreNotBound,

    #[error("A store is already bound to context '{0}'")]
    StoreAlreadyBound(String),

    #[error("Context '{0}' has a parent and cannot own a store")]
    NotRoot(String),

    /// The context's confinement domain stopped accepting work
    #[error("Confinement domain '{0}' has shut down")]
    DomainClosed(String),

    #[error("Failed to start confinement domain '{name}': {source}")]
    DomainSpawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Level of the hierarchy a save was flushing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// main → private
    Main,
    /// private → store
    Private,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Main => write!(f, "main"),
            Tier::Private => write!(f, "private"),
        }
    }
}

/// A failed flush at one tier. The changes stay pending in that tier's context.
#[derive(Error, Debug)]
#[error("Saving the {tier} context failed: {source}")]
pub struct SaveError {
    pub tier: Tier,
    #[source]
    pub source: ContextError,
}

impl SaveError {
    pub fn new(tier: Tier, source: ContextError) -> Self {
        Self { tier, source }
    }
}

/// Reasons initialization can end in the failed state
#[derive(Error, Debug)]
pub enum InitError {
    #[error("Model '{identifier}' was not found")]
    ModelNotFound { identifier: String },

    #[error("Model '{identifier}' could not be loaded: {details}")]
    InvalidModel { identifier: String, details: String },

    #[error("Failed to open store at '{path}': {source}")]
    StoreOpen {
        path: PathBuf,
        #[source]
        source: StorageError,
    },

    #[error("Failed to attach store: {0}")]
    Context(#[from] ContextError),

    #[error("Initialization worker exited before the stack settled")]
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_error_names_tier() {
        let err = SaveError::new(Tier::Private, ContextError::StoreNotBound);

        assert_eq!(err.tier, Tier::Private);
        assert!(err.to_string().contains("private context"));
    }

    #[test]
    fn test_store_open_keeps_source() {
        use std::error::Error as _;

        let err = InitError::StoreOpen {
            path: PathBuf::from("/data/catalog.sqlite"),
            source: StorageError::IncompatibleModel { stored: 2, model: 1 },
        };

        assert!(err.to_string().contains("catalog.sqlite"));
        assert!(err.source().is_some());
    }
}
