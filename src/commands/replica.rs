//! The CLI's local replica of a topic.

use std::path::PathBuf;
use std::sync::Arc;

use tabsync_core::sync::log_ignored_error;
use tabsync_core::{create_key_value_persister, FileStorage, KeyValuePersister, MergeableStore, Scheduler, SharedStore};

use tabsync::config::Config;
use tabsync::server::TopicStorage;

const STORE_FILENAME: &str = "store.json";

/// A topic's store, loaded from and saved to `<data_dir>/replicas/<topic>`.
pub struct LocalReplica {
    path: PathBuf,
    scheduler: Arc<Scheduler>,
    persister: KeyValuePersister,
}

impl LocalReplica {
    pub async fn open(config: &Config, topic: &str) -> Result<Self, Box<dyn std::error::Error>> {
        TopicStorage::validate_topic(topic)?;
        let path = config.replica_dir(topic).join(STORE_FILENAME);
        let store = SharedStore::new(MergeableStore::new(config.replica_id.value.as_deref()));
        let scheduler = Scheduler::new();
        let persister = create_key_value_persister(
            store,
            Arc::new(FileStorage::new(&path)),
            "",
            scheduler.clone(),
            log_ignored_error(),
        );
        persister.load(None).await;
        Ok(Self {
            path,
            scheduler,
            persister,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn store(&self) -> &SharedStore {
        self.persister.store()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn persister(&self) -> &KeyValuePersister {
        &self.persister
    }

    /// Writes the whole store back to disk.
    pub async fn save(&self) {
        self.persister.save(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_core::CellValue;
    use tempfile::TempDir;

    fn config(temp_dir: &TempDir) -> Config {
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "data_dir: data\nreplica_id: laptop\n").unwrap();
        Config::load(Some(config_path)).unwrap()
    }

    #[tokio::test]
    async fn test_changes_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);

        let replica = LocalReplica::open(&config, "pets").await.unwrap();
        replica
            .store()
            .with(|s| s.set_cell("pets", "fido", "species", "dog").map(|_| ()))
            .unwrap();
        replica.save().await;
        assert!(replica.path().exists());

        let reopened = LocalReplica::open(&config, "pets").await.unwrap();
        assert_eq!(
            reopened.store().with(|s| s.get_cell("pets", "fido", "species").cloned()),
            Some(CellValue::from("dog"))
        );
    }

    #[tokio::test]
    async fn test_rejects_invalid_topic() {
        let temp_dir = TempDir::new().unwrap();
        let config = config(&temp_dir);
        assert!(LocalReplica::open(&config, "../pets").await.is_err());
    }
}
