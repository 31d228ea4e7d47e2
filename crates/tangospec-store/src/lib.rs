//! `tangospec-store` – The Property Database.
//!
//! Persists device properties and device aliases, the two pieces of state
//! the bridge keeps across restarts.
//!
//! # Modules
//!
//! - [`sqlite`] – [`SqlitePropertyStore`]: a local SQLite file, used by the
//!   console binary.
//! - [`memory`] – [`MemoryPropertyStore`]: in-process maps for tests.
//!
//! Device names are case-insensitive and stored lower-cased; aliases are
//! stored exactly as given.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use tangospec_types::BridgeError;
use thiserror::Error;

pub use memory::MemoryPropertyStore;
pub use sqlite::SqlitePropertyStore;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from property store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Property encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Alias '{alias}' already refers to {device}")]
    AliasTaken { alias: String, device: String },
}

impl From<StoreError> for BridgeError {
    fn from(e: StoreError) -> Self {
        BridgeError::Store(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PropertyStore
// ─────────────────────────────────────────────────────────────────────────────

/// Device property and alias persistence.
///
/// Properties are string lists keyed by `(device, name)`.
pub trait PropertyStore: Send + Sync {
    /// `None` when the property was never written.
    fn get_property(&self, device: &str, name: &str) -> Result<Option<Vec<String>>, StoreError>;

    fn put_property(&self, device: &str, name: &str, values: &[String]) -> Result<(), StoreError>;

    fn delete_property(&self, device: &str, name: &str) -> Result<(), StoreError>;

    /// Every property of `device`, by name.
    fn device_properties(&self, device: &str) -> Result<BTreeMap<String, Vec<String>>, StoreError>;

    /// Drop every property and alias of `device`.
    fn delete_device(&self, device: &str) -> Result<(), StoreError>;

    /// The device an alias refers to.
    fn get_alias(&self, alias: &str) -> Result<Option<String>, StoreError>;

    /// # Errors
    ///
    /// [`StoreError::AliasTaken`] when the alias already refers to another
    /// device.
    fn put_alias(&self, device: &str, alias: &str) -> Result<(), StoreError>;

    fn delete_alias(&self, alias: &str) -> Result<(), StoreError>;
}

pub(crate) fn device_key(device: &str) -> String {
    device.to_ascii_lowercase()
}
