//! SQLite-backed property store.
//!
//! # Storage layout
//!
//! | table | columns | notes |
//! |-------|---------|-------|
//! | `device_properties` | `device`, `name`, `value`, `updated_at` | `value` is a JSON array of strings |
//! | `device_aliases` | `alias`, `device` | `alias` is the primary key |
//!
//! # Example
//!
//! ```rust
//! use tangospec_store::{PropertyStore, SqlitePropertyStore};
//!
//! let store = SqlitePropertyStore::open_in_memory().unwrap();
//! store
//!     .put_property("id00/spec/fourc", "Variables", &["A".to_string()])
//!     .unwrap();
//! let values = store.get_property("ID00/Spec/FourC", "Variables").unwrap();
//! assert_eq!(values, Some(vec!["A".to_string()]));
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::{PropertyStore, StoreError, device_key};

/// Property store on a local SQLite database.
pub struct SqlitePropertyStore {
    conn: Mutex<Connection>,
}

impl SqlitePropertyStore {
    /// Open (or create) a persistent store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "opened property database");
        Self::with_connection(conn)
    }

    /// Open a temporary in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS device_properties (
                device      TEXT NOT NULL,
                name        TEXT NOT NULL,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (device, name)
            );
            CREATE TABLE IF NOT EXISTS device_aliases (
                alias   TEXT NOT NULL PRIMARY KEY,
                device  TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl PropertyStore for SqlitePropertyStore {
    fn get_property(&self, device: &str, name: &str) -> Result<Option<Vec<String>>, StoreError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM device_properties WHERE device = ?1 AND name = ?2",
                params![device_key(device), name],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn put_property(&self, device: &str, name: &str, values: &[String]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(values)?;
        let now = Utc::now().to_rfc3339();
        self.conn.lock().execute(
            "INSERT INTO device_properties (device, name, value, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(device, name) DO UPDATE SET value = ?3, updated_at = ?4",
            params![device_key(device), name, raw, now],
        )?;
        Ok(())
    }

    fn delete_property(&self, device: &str, name: &str) -> Result<(), StoreError> {
        self.conn.lock().execute(
            "DELETE FROM device_properties WHERE device = ?1 AND name = ?2",
            params![device_key(device), name],
        )?;
        Ok(())
    }

    fn device_properties(&self, device: &str) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT name, value FROM device_properties WHERE device = ?1")?;
        let rows = stmt.query_map(params![device_key(device)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (name, raw) = row?;
            out.insert(name, serde_json::from_str(&raw)?);
        }
        Ok(out)
    }

    fn delete_device(&self, device: &str) -> Result<(), StoreError> {
        let key = device_key(device);
        let conn = self.conn.lock();
        conn.execute("DELETE FROM device_properties WHERE device = ?1", params![key])?;
        conn.execute("DELETE FROM device_aliases WHERE device = ?1", params![key])?;
        Ok(())
    }

    fn get_alias(&self, alias: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT device FROM device_aliases WHERE alias = ?1",
                params![alias],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn put_alias(&self, device: &str, alias: &str) -> Result<(), StoreError> {
        let key = device_key(device);
        let conn = self.conn.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT device FROM device_aliases WHERE alias = ?1",
                params![alias],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(owner) if owner != key => Err(StoreError::AliasTaken {
                alias: alias.to_string(),
                device: owner,
            }),
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT INTO device_aliases (alias, device) VALUES (?1, ?2)",
                    params![alias, key],
                )?;
                Ok(())
            }
        }
    }

    fn delete_alias(&self, alias: &str) -> Result<(), StoreError> {
        self.conn
            .lock()
            .execute("DELETE FROM device_aliases WHERE alias = ?1", params![alias])?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
