//! SQLite schema for the record store
//!
//! The layout is model-independent: every entity's rows live in `records`,
//! keyed by `(entity, id)`. The model's name, version and declared entities
//! are tracked alongside so migrations can be detected on open.

use rusqlite::{params, Connection, OptionalExtension, Result};

use crate::model::Model;

/// Version of the table layout itself (not the model version)
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema and model version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Entities declared by the model the store was last opened with
        CREATE TABLE IF NOT EXISTS entities (
            name TEXT PRIMARY KEY
        );

        -- Record bodies as JSON
        CREATE TABLE IF NOT EXISTS records (
            entity TEXT NOT NULL,
            id TEXT NOT NULL,
            body TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (entity, id)
        );

        CREATE INDEX IF NOT EXISTS idx_records_updated_at ON records(updated_at);
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Get the layout version from the database
pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    Ok(get_info(conn, "version")?.and_then(|v| v.parse().ok()))
}

/// Check if the layout needs initialization or upgrade
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_schema_version(conn) {
        Ok(Some(v)) => v < SCHEMA_VERSION,
        _ => true,
    }
}

/// Model name and version recorded in the store, if any
pub fn stored_model(conn: &Connection) -> Result<Option<(String, u32)>> {
    let name = get_info(conn, "model_name")?;
    let version = get_info(conn, "model_version")?.and_then(|v| v.parse().ok());

    Ok(name.zip(version))
}

/// Entity names registered in the store
pub fn registered_entities(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM entities ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<String>>>()?;
    Ok(names)
}

/// Record `model` as the store's model, registering its entities
pub fn record_model(conn: &Connection, model: &Model) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('model_name', ?)",
        [&model.name],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('model_version', ?)",
        [model.version.to_string()],
    )?;
    for entity in &model.entities {
        conn.execute(
            "INSERT OR IGNORE INTO entities (name) VALUES (?)",
            [&entity.name],
        )?;
    }
    Ok(())
}

/// Move every row of `from` to entity `to`
pub fn rename_entity(conn: &Connection, from: &str, to: &str) -> Result<usize> {
    let moved = conn.execute(
        "UPDATE records SET entity = ?1 WHERE entity = ?2",
        params![to, from],
    )?;
    conn.execute("DELETE FROM entities WHERE name = ?", [from])?;
    Ok(moved)
}

fn get_info(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM schema_info WHERE key = ?",
        [key],
        |row| row.get(0),
    )
    .optional()
}
