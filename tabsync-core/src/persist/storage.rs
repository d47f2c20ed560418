//! Key-value storage backends.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;
use thiserror::Error;

/// Errors that can occur reading or writing persisted stamps.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error for {}: {}", .0.display(), .1)]
    IoError(PathBuf, #[source] io::Error),

    #[error("Failed to parse {}: {}", .0.display(), .1)]
    ParseError(PathBuf, #[source] serde_json::Error),

    #[error("Invalid entry {key}: {reason}")]
    InvalidEntry { key: String, reason: String },
}

/// A flat map of JSON values, listed by key prefix.
pub trait KeyValueStorage: Send + Sync {
    /// Every entry whose key starts with `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError>;

    /// Writes all entries, replacing existing keys.
    fn put(&self, entries: Vec<(String, Value)>) -> Result<(), StorageError>;
}

pub(crate) fn list_prefix(map: &BTreeMap<String, Value>, prefix: &str) -> Vec<(String, Value)> {
    map.range(prefix.to_string()..)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Storage held in memory, lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStorage for MemoryStorage {
    fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(list_prefix(&entries, prefix))
    }

    fn put(&self, new_entries: Vec<(String, Value)>) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.extend(new_entries);
        Ok(())
    }
}
