//! File-backed key-value storage.
//!
//! All entries live in a single JSON object on disk, read once and cached.
//! Every `put` rewrites the file atomically through a temp file and rename.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use super::storage::{list_prefix, KeyValueStorage, StorageError};

#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    cache: Mutex<Option<BTreeMap<String, Value>>>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<BTreeMap<String, Value>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::ParseError(self.path.clone(), e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StorageError::IoError(self.path.clone(), e)),
        }
    }

    fn write(&self, entries: &BTreeMap<String, Value>) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| StorageError::IoError(dir.to_path_buf(), e))?;
        }
        let bytes =
            serde_json::to_vec(entries).map_err(|e| StorageError::ParseError(self.path.clone(), e))?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut file =
            File::create(&temp_path).map_err(|e| StorageError::IoError(temp_path.clone(), e))?;
        file.write_all(&bytes)
            .map_err(|e| StorageError::IoError(temp_path.clone(), e))?;
        file.sync_all()
            .map_err(|e| StorageError::IoError(temp_path.clone(), e))?;

        fs::rename(&temp_path, &self.path).map_err(|e| StorageError::IoError(self.path.clone(), e))
    }
}

impl KeyValueStorage for FileStorage {
    fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.is_none() {
            *cache = Some(self.read()?);
        }
        Ok(cache.as_ref().map(|entries| list_prefix(entries, prefix)).unwrap_or_default())
    }

    fn put(&self, new_entries: Vec<(String, Value)>) -> Result<(), StorageError> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = match cache.as_ref() {
            Some(entries) => entries.clone(),
            None => self.read()?,
        };
        entries.extend(new_entries);
        self.write(&entries)?;
        *cache = Some(entries);
        Ok(())
    }
}
