//! Local SQLite key-value store.
//!
//! Uses rusqlite with WAL mode. Every persisted blob (orders, customers,
//! catalogs, remote credentials) lives in a single `kv_store` table keyed by
//! name. Provides schema migrations and the [`LocalStore`] trait the sync
//! controller writes through.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{StoreError, SyncError};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Durable string-keyed blob storage scoped to this device.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// SQLite-backed [`LocalStore`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open the store at `{data_dir}/printshop.db`.
    ///
    /// Creates the directory if needed, opens the connection, sets pragmas,
    /// and runs any pending migrations. On corruption or open failure,
    /// deletes the file and retries once.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("printshop.db");
        info!("Opening local store at {}", db_path.display());

        let conn = match open_and_configure(&db_path).and_then(|c| {
            run_migrations(&c)?;
            Ok(c)
        }) {
            Ok(c) => c,
            Err(first_err) => {
                warn!(
                    "Local store open failed ({}), deleting and retrying once",
                    first_err
                );
                if db_path.exists() {
                    let _ = fs::remove_file(&db_path);
                    let _ = fs::remove_file(db_path.with_extension("db-wal"));
                    let _ = fs::remove_file(db_path.with_extension("db-shm"));
                }
                let conn = open_and_configure(&db_path)?;
                run_migrations(&conn)?;
                conn
            }
        };

        info!("Local store initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    /// In-memory store, used by tests and throwaway sessions.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA synchronous = NORMAL;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

impl LocalStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Local store schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating local store from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

/// Migration v1: key-value blob table.
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv_store (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        StoreError::Migration {
            version: 1,
            source: e,
        }
    })?;

    info!("Applied migration v1 (kv_store table)");
    Ok(())
}

// ---------------------------------------------------------------------------
// JSON blob helpers
// ---------------------------------------------------------------------------

/// Read a JSON array blob. An absent or blank key reads as an empty array;
/// anything that is not a JSON array is a `LocalParse` error.
pub fn read_json_array(store: &dyn LocalStore, key: &str) -> Result<Vec<Value>, SyncError> {
    let raw = match store.get(key)? {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => return Ok(Vec::new()),
    };
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Array(arr)) => Ok(arr),
        Ok(other) => Err(SyncError::LocalParse(format!(
            "{key} is not an array (found {})",
            json_kind(&other)
        ))),
        Err(e) => Err(SyncError::LocalParse(format!("{key}: {e}"))),
    }
}

/// Serialize `value` and store it under `key`, replacing the whole blob.
pub fn write_json(store: &dyn LocalStore, key: &str, value: &Value) -> Result<(), SyncError> {
    store.set(key, &value.to_string())?;
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_create_kv_store() {
        let store = SqliteStore::open_in_memory().expect("open in-memory store");
        let conn = store.conn.lock().unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);

        // Running again should be a no-op (already at latest version)
        run_migrations(&conn).expect("second run should succeed");
    }

    #[test]
    fn test_set_get_overwrite_remove() {
        let store = SqliteStore::open_in_memory().expect("open");
        assert_eq!(store.get("orders").unwrap(), None);

        store.set("orders", "[1]").unwrap();
        store.set("orders", "[1,2]").unwrap();
        assert_eq!(store.get("orders").unwrap().as_deref(), Some("[1,2]"));

        store.remove("orders").unwrap();
        assert_eq!(store.get("orders").unwrap(), None);
        // Removing a missing key is not an error
        store.remove("orders").unwrap();
    }

    #[test]
    fn test_read_json_array_edge_cases() {
        let store = SqliteStore::open_in_memory().expect("open");
        assert!(read_json_array(&store, "orders").unwrap().is_empty());

        store.set("orders", "   ").unwrap();
        assert!(read_json_array(&store, "orders").unwrap().is_empty());

        store.set("orders", "{not json").unwrap();
        assert!(matches!(
            read_json_array(&store, "orders"),
            Err(SyncError::LocalParse(_))
        ));

        store.set("orders", "{\"a\":1}").unwrap();
        assert!(matches!(
            read_json_array(&store, "orders"),
            Err(SyncError::LocalParse(_))
        ));

        write_json(&store, "orders", &serde_json::json!([{"id": "x"}])).unwrap();
        assert_eq!(read_json_array(&store, "orders").unwrap().len(), 1);
    }

    #[test]
    fn test_wal_mode_and_persistence_on_file_db() {
        // WAL only works on file-backed databases; in-memory always returns "memory".
        let dir = std::env::temp_dir().join(format!("printshop_test_wal_{}", uuid::Uuid::new_v4()));

        {
            let store = SqliteStore::open(&dir).expect("open file store");
            let mode: String = store
                .conn
                .lock()
                .unwrap()
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .expect("read journal_mode");
            assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");
            store.set("colors", "[]").unwrap();
        }

        let reopened = SqliteStore::open(&dir).expect("reopen");
        assert_eq!(reopened.get("colors").unwrap().as_deref(), Some("[]"));
        assert!(reopened.path().ends_with("printshop.db"));

        drop(reopened);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_corrupt_file_is_replaced() {
        let dir =
            std::env::temp_dir().join(format!("printshop_test_corrupt_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("printshop.db"), b"definitely not sqlite").unwrap();

        let store = SqliteStore::open(&dir).expect("open should recover");
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
