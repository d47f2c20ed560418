//! Server-side topic storage.
//!
//! Each topic's server replica is stored in its own directory:
//! ```text
//! <DATA_DIR>/
//!   <topic>/
//!     store.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use tabsync_core::FileStorage;

const STORE_FILENAME: &str = "store.json";

/// Errors that can occur resolving topic storage.
#[derive(Debug)]
pub enum TopicStorageError {
    /// Invalid topic id (e.g., contains path separators).
    InvalidTopic(String),
}

impl std::fmt::Display for TopicStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicStorageError::InvalidTopic(topic) => write!(f, "Invalid topic: {}", topic),
        }
    }
}

impl std::error::Error for TopicStorageError {}

/// Locates durable storage for each topic's server replica.
#[derive(Debug, Clone)]
pub struct TopicStorage {
    data_dir: PathBuf,
}

impl TopicStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Validates a topic id to prevent path traversal attacks.
    pub fn validate_topic(topic: &str) -> Result<(), TopicStorageError> {
        if topic.is_empty()
            || topic.contains('/')
            || topic.contains('\\')
            || topic.contains("..")
            || topic.starts_with('.')
            || topic.chars().any(char::is_control)
        {
            return Err(TopicStorageError::InvalidTopic(topic.to_string()));
        }
        Ok(())
    }

    fn topic_dir(&self, topic: &str) -> PathBuf {
        self.data_dir.join(topic)
    }

    /// Returns the store file for a topic.
    pub fn store_path(&self, topic: &str) -> Result<PathBuf, TopicStorageError> {
        Self::validate_topic(topic)?;
        Ok(self.topic_dir(topic).join(STORE_FILENAME))
    }

    /// Opens the key-value storage for a topic. The file is created on first save.
    pub fn open(&self, topic: &str) -> Result<Arc<FileStorage>, TopicStorageError> {
        Ok(Arc::new(FileStorage::new(self.store_path(topic)?)))
    }
}
