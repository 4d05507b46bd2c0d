//! Context configuration.
//!
//! # Example YAML
//!
//! ```yaml
//! database: library.db
//! foreign_keys: true
//! busy_timeout_ms: 5000
//! drop_existing: false
//! custom_types:
//!   money: NUMERIC
//!   uuid: TEXT
//! ```

use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// In-memory database marker accepted by [`ContextConfig::database`].
pub const IN_MEMORY: &str = ":memory:";

/// Settings for opening a [`DbContext`](crate::DbContext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Database file path, or `:memory:`.
    pub database: String,
    /// Enables `PRAGMA foreign_keys` on the connection.
    pub foreign_keys: bool,
    /// Busy timeout applied to the connection, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy_timeout_ms: Option<u64>,
    /// Drop existing tables before creating them in `ensure_created`.
    pub drop_existing: bool,
    /// Extra semantic type tag to SQLite type token mappings.
    pub custom_types: BTreeMap<String, String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            database: IN_MEMORY.to_string(),
            foreign_keys: true,
            busy_timeout_ms: None,
            drop_existing: true,
            custom_types: BTreeMap::new(),
        }
    }
}

impl ContextConfig {
    /// Configuration for a file-backed database with default settings.
    pub fn for_path(path: impl AsRef<Path>) -> Self {
        Self {
            database: path.as_ref().to_string_lossy().into_owned(),
            ..Self::default()
        }
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`IoError`](crate::SqliteError::IoError) if the file cannot
    /// be read, or [`YamlError`](crate::SqliteError::YamlError) if parsing
    /// fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);
        let config = serde_yaml::from_reader(reader)?;
        Ok(config)
    }

    /// Saves the configuration as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`IoError`](crate::SqliteError::IoError) if the file cannot
    /// be written, or [`YamlError`](crate::SqliteError::YamlError) if
    /// serialization fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let writer = BufWriter::new(file);
        serde_yaml::to_writer(writer, self)?;
        Ok(())
    }

    pub fn is_in_memory(&self) -> bool {
        self.database == IN_MEMORY
    }

    /// Opens a connection and applies the connection-level settings.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError`](crate::SqliteError::DatabaseError) if the
    /// database cannot be opened or a pragma fails.
    pub fn open(&self) -> Result<Connection> {
        let conn = if self.is_in_memory() {
            Connection::open_in_memory()?
        } else {
            Connection::open(&self.database)?
        };
        if self.foreign_keys {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        }
        if let Some(ms) = self.busy_timeout_ms {
            conn.busy_timeout(Duration::from_millis(ms))?;
        }
        Ok(conn)
    }
}
