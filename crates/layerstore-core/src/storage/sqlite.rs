//! SQLite record store
//!
//! The storage engine bound to a stack's root context. Opening a store
//! creates the file if needed, applies the configured journal mode and file
//! protection, and migrates the recorded model to the requested one.
//!
//! All writes go through `commit`, which applies a whole `ChangeSet` in one
//! transaction: either every change lands or none does.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info};

use super::error::{StorageError, StorageResult};
use super::schema::{
    init_schema, needs_init, record_model, registered_entities, rename_entity, stored_model,
};
use crate::config::{FileProtection, StoreSettings};
use crate::model::Model;
use crate::record::{Change, ChangeSet, Record, RecordKey};

/// An open record store
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
    model: Model,
}

impl SqliteStore {
    /// Open or create the store at `path` for `model`
    pub fn open(path: &Path, model: Model, settings: &StoreSettings) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
        }

        let mut conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))?;
        apply_journal_mode(&conn, settings)?;
        migrate(&mut conn, &model, settings)?;
        apply_file_protection(path, settings.file_protection)?;

        debug!("Opened store {:?} for model '{}'", path, model.name);
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            model,
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(model: Model) -> StorageResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn, &model, &StoreSettings::default())?;
        Ok(Self {
            conn,
            path: None,
            model,
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// File backing the store; `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Get a record body
    pub fn fetch(&self, key: &RecordKey) -> StorageResult<Option<Value>> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM records WHERE entity = ?1 AND id = ?2",
                params![key.entity, key.id],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|body| decode(key, &body)).transpose()
    }

    /// Get every record of an entity, keyed by id
    pub fn fetch_all(&self, entity: &str) -> StorageResult<BTreeMap<String, Value>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, body FROM records WHERE entity = ? ORDER BY id")?;
        let rows = stmt.query_map([entity], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = BTreeMap::new();
        for row in rows {
            let (id, body) = row?;
            let key = RecordKey::new(entity, id);
            let value = decode(&key, &body)?;
            records.insert(key.id, value);
        }
        Ok(records)
    }

    /// Get every record of an entity as `Record`s
    pub fn records(&self, entity: &str) -> StorageResult<Vec<Record>> {
        Ok(self
            .fetch_all(entity)?
            .into_iter()
            .map(|(id, body)| Record {
                entity: entity.to_string(),
                id,
                body,
            })
            .collect())
    }

    /// Count records of an entity
    pub fn count(&self, entity: &str) -> StorageResult<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE entity = ?",
            [entity],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Apply `changes` in a single transaction
    pub fn commit(&mut self, changes: &ChangeSet) -> StorageResult<()> {
        let now = Utc::now().timestamp_millis();
        let tx = self.conn.transaction()?;

        for (key, change) in changes.iter() {
            match change {
                Change::Upsert(body) => {
                    let body = serde_json::to_string(body).map_err(|e| {
                        StorageError::CorruptRecord {
                            key: key.to_string(),
                            details: e.to_string(),
                        }
                    })?;
                    tx.execute(
                        "INSERT INTO records (entity, id, body, updated_at)
                         VALUES (?1, ?2, ?3, ?4)
                         ON CONFLICT(entity, id) DO UPDATE SET
                            body = excluded.body,
                            updated_at = excluded.updated_at",
                        params![key.entity, key.id, body, now],
                    )?;
                }
                Change::Delete => {
                    tx.execute(
                        "DELETE FROM records WHERE entity = ?1 AND id = ?2",
                        params![key.entity, key.id],
                    )?;
                }
            }
        }

        tx.commit()?;
        Ok(())
    }
}

fn decode(key: &RecordKey, body: &str) -> StorageResult<Value> {
    serde_json::from_str(body).map_err(|e| StorageError::CorruptRecord {
        key: key.to_string(),
        details: e.to_string(),
    })
}

fn apply_journal_mode(conn: &Connection, settings: &StoreSettings) -> StorageResult<()> {
    let requested = settings.journal_mode.as_pragma();
    let actual: String =
        conn.pragma_update_and_check(None, "journal_mode", requested, |row| row.get(0))?;

    if !actual.eq_ignore_ascii_case(requested) {
        return Err(StorageError::JournalMode {
            requested: requested.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(unix)]
fn apply_file_protection(path: &Path, protection: FileProtection) -> StorageResult<()> {
    use std::os::unix::fs::PermissionsExt;

    if protection == FileProtection::Complete {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|source| StorageError::ProtectFile {
                path: path.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_file_protection(path: &Path, protection: FileProtection) -> StorageResult<()> {
    if protection == FileProtection::Complete {
        debug!("File protection is not supported on this platform, leaving {:?} as is", path);
    }
    Ok(())
}

/// Bring the store's recorded model up to `model`
fn migrate(conn: &mut Connection, model: &Model, settings: &StoreSettings) -> StorageResult<()> {
    let tx = conn.transaction()?;

    if needs_init(&tx) {
        init_schema(&tx)?;
    }

    match stored_model(&tx)? {
        None => {
            record_model(&tx, model)?;
        }
        Some((stored, _)) if stored != model.name => {
            return Err(StorageError::ModelMismatch {
                stored,
                requested: model.name.clone(),
            });
        }
        Some((_, version)) if version > model.version => {
            return Err(StorageError::IncompatibleModel {
                stored: version,
                model: model.version,
            });
        }
        Some((_, version)) if version == model.version => {}
        Some((_, version)) => {
            if !settings.auto_migrate {
                return Err(StorageError::MigrationRequired {
                    from: version,
                    to: model.version,
                });
            }

            let registered = registered_entities(&tx)?;
            for entity in &model.entities {
                let Some(old) = entity.renamed_from.as_deref() else {
                    continue;
                };
                if !registered.iter().any(|r| r == old) || registered.contains(&entity.name) {
                    continue;
                }
                if !settings.infer_mapping {
                    return Err(StorageError::MappingRequired {
                        entity: entity.name.clone(),
                        renamed_from: old.to_string(),
                    });
                }
                let moved = rename_entity(&tx, old, &entity.name)?;
                debug!("Mapped {} '{}' rows to '{}'", moved, old, entity.name);
            }

            record_model(&tx, model)?;
            info!(
                "Migrated store for model '{}' from version {} to {}",
                model.name, version, model.version
            );
        }
    }

    tx.commit()?;
    Ok(())
}
