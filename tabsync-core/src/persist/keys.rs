//! Stamp trees stored as one key-value entry per node.
//!
//! Keys are `prefix + type + ids`, where the type is `t` for the tables tree
//! or `v` for the values tree, and `ids` is the JSON array of the node's id
//! path without its brackets. The tables root is therefore `prefix + "t"`
//! and a cell is `prefix + "t\"pets\",\"fido\",\"legs\""`.
//!
//! Interior nodes are stored as `[0, time, hash]`; leaves as
//! `[value, time, hash]`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::storage::{KeyValueStorage, StorageError};
use super::{Persisted, Persistence};
use crate::stamp::{CellStamp, Id, MergeableContent};
use crate::store::SharedStore;
use crate::sync::SyncError;

const TABLES: char = 't';
const VALUES: char = 'v';

pub fn construct_key(prefix: &str, kind: char, ids: &[&str]) -> String {
    let ids = serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string());
    format!("{prefix}{kind}{}", &ids[1..ids.len() - 1])
}

/// Splits a key into its tree type and id path. Foreign keys yield `None`.
pub fn deconstruct_key(prefix: &str, key: &str) -> Option<(char, Vec<Id>)> {
    let rest = key.strip_prefix(prefix)?;
    let mut chars = rest.chars();
    let kind = chars.next().filter(|c| *c == TABLES || *c == VALUES)?;
    let ids = serde_json::from_str(&format!("[{}]", chars.as_str())).ok()?;
    Some((kind, ids))
}

fn invalid(key: &str, reason: impl ToString) -> StorageError {
    StorageError::InvalidEntry {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Flattens content (or touched changes) into storage entries.
pub fn entries_from_content(prefix: &str, content: &MergeableContent) -> Vec<(String, Value)> {
    let node = |time: &str, hash: Option<u32>| json!([0, time, hash.unwrap_or(0)]);
    let leaf = |stamp: &CellStamp| json!([stamp.value, stamp.time, stamp.hash.unwrap_or(0)]);

    let mut entries = vec![(
        construct_key(prefix, TABLES, &[]),
        node(&content.tables.time, content.tables.hash),
    )];
    for (table_id, table) in &content.tables.value {
        entries.push((
            construct_key(prefix, TABLES, &[table_id.as_str()]),
            node(&table.time, table.hash),
        ));
        for (row_id, row) in &table.value {
            entries.push((
                construct_key(prefix, TABLES, &[table_id.as_str(), row_id.as_str()]),
                node(&row.time, row.hash),
            ));
            for (cell_id, cell) in &row.value {
                let ids = [table_id.as_str(), row_id.as_str(), cell_id.as_str()];
                entries.push((construct_key(prefix, TABLES, &ids), leaf(cell)));
            }
        }
    }

    entries.push((
        construct_key(prefix, VALUES, &[]),
        node(&content.values.time, content.values.hash),
    ));
    for (value_id, value) in &content.values.value {
        entries.push((construct_key(prefix, VALUES, &[value_id.as_str()]), leaf(value)));
    }
    entries
}

/// Rebuilds content from every entry under a prefix.
pub fn content_from_entries(
    prefix: &str,
    entries: Vec<(String, Value)>,
) -> Result<MergeableContent, StorageError> {
    let mut content = MergeableContent::default();
    for (key, value) in entries {
        let Some((kind, ids)) = deconstruct_key(prefix, &key) else {
            continue;
        };
        let stamp: CellStamp = serde_json::from_value(value).map_err(|e| invalid(&key, e))?;
        let set_node = |node_time: &mut String, node_hash: &mut Option<u32>| {
            *node_time = stamp.time.clone();
            *node_hash = stamp.hash;
        };

        match (kind, ids.as_slice()) {
            (TABLES, []) => set_node(&mut content.tables.time, &mut content.tables.hash),
            (TABLES, [table_id]) => {
                let table = content.tables.value.entry(table_id.clone()).or_default();
                set_node(&mut table.time, &mut table.hash);
            }
            (TABLES, [table_id, row_id]) => {
                let row = content
                    .tables
                    .value
                    .entry(table_id.clone())
                    .or_default()
                    .value
                    .entry(row_id.clone())
                    .or_default();
                set_node(&mut row.time, &mut row.hash);
            }
            (TABLES, [table_id, row_id, cell_id]) => {
                content
                    .tables
                    .value
                    .entry(table_id.clone())
                    .or_default()
                    .value
                    .entry(row_id.clone())
                    .or_default()
                    .value
                    .insert(cell_id.clone(), stamp.clone());
            }
            (VALUES, []) => set_node(&mut content.values.time, &mut content.values.hash),
            (VALUES, [value_id]) => {
                content.values.value.insert(value_id.clone(), stamp.clone());
            }
            _ => return Err(invalid(&key, "unexpected id path")),
        }
    }
    Ok(content)
}

/// Persists a store as key-value entries under a prefix.
pub struct KeyValuePersistence {
    storage: Arc<dyn KeyValueStorage>,
    prefix: String,
    poll_interval: Option<Duration>,
}

impl KeyValuePersistence {
    pub fn new(storage: Arc<dyn KeyValueStorage>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            poll_interval: None,
        }
    }

    /// Re-reads storage at `interval` while auto-loading.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn storage(&self) -> &Arc<dyn KeyValueStorage> {
        &self.storage
    }
}

impl Persistence for KeyValuePersistence {
    fn get_persisted(&self) -> impl Future<Output = Result<Option<Persisted>, SyncError>> + Send {
        async move {
            let entries = self.storage.list(&self.prefix)?;
            if entries.is_empty() {
                return Ok(None);
            }
            Ok(Some(Persisted::Content(content_from_entries(&self.prefix, entries)?)))
        }
    }

    fn set_persisted(
        &self,
        store: &SharedStore,
        changes: Option<MergeableContent>,
    ) -> impl Future<Output = Result<(), SyncError>> + Send {
        let content = changes.unwrap_or_else(|| store.with(|store| store.get_mergeable_content()));
        async move {
            self.storage.put(entries_from_content(&self.prefix, &content))?;
            Ok(())
        }
    }

    fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryStorage;
    use crate::store::MergeableStore;

    #[test]
    fn test_construct_key() {
        assert_eq!(construct_key("p/", 't', &[]), "p/t");
        assert_eq!(construct_key("", 't', &["pets", "fido"]), "t\"pets\",\"fido\"");
        assert_eq!(construct_key("", 'v', &["a\"b"]), "v\"a\\\"b\"");
    }

    #[test]
    fn test_deconstruct_key() {
        assert_eq!(deconstruct_key("p/", "p/t"), Some(('t', vec![])));
        assert_eq!(
            deconstruct_key("p/", "p/t\"pets\",\"fido\""),
            Some(('t', vec!["pets".to_string(), "fido".to_string()]))
        );
        assert_eq!(deconstruct_key("p/", "q/t"), None);
        assert_eq!(deconstruct_key("p/", "p/x\"a\""), None);
    }

    #[test]
    fn test_entries_round_trip_content() {
        let mut store = MergeableStore::new(Some("a"));
        store.set_cell("pets", "fido", "legs", 4).unwrap();
        store.set_cell("pets", "fido", "name", "Fido").unwrap();
        store.del_cell("pets", "fido", "name").unwrap();
        store.set_value("open", true).unwrap();
        let content = store.get_mergeable_content();

        let entries = entries_from_content("x/", &content);
        assert_eq!(entries.len(), 1 + 1 + 1 + 2 + 1 + 1);
        assert_eq!(content_from_entries("x/", entries).unwrap(), content);
    }

    #[test]
    fn test_entries_stored_as_triples() {
        let mut store = MergeableStore::new(Some("a"));
        store.set_value("open", true).unwrap();
        let content = store.get_mergeable_content();
        let entries = entries_from_content("", &content);

        let (_, root) = entries.iter().find(|(key, _)| key == "v").unwrap();
        assert_eq!(root[0], json!(0));
        let (_, leaf) = entries.iter().find(|(key, _)| key == "v\"open\"").unwrap();
        assert_eq!(leaf[0], json!(true));
        assert_eq!(leaf[2], json!(content.values.value["open"].hash.unwrap()));
    }

    #[tokio::test]
    async fn test_partial_save_updates_only_touched_keys() {
        let storage = Arc::new(MemoryStorage::new());
        let persistence = KeyValuePersistence::new(storage.clone(), "");
        let store = SharedStore::new(MergeableStore::new(Some("a")));
        let mut events = store.subscribe();

        store.with(|s| s.set_value("a", 1).map(|_| ())).unwrap();
        persistence.set_persisted(&store, None).await.unwrap();
        let before = storage.len();

        store.with(|s| s.set_value("b", 2).map(|_| ())).unwrap();
        let _ = events.recv().await.unwrap();
        let touched = events.recv().await.unwrap().changes;
        persistence.set_persisted(&store, Some(touched)).await.unwrap();

        assert_eq!(storage.len(), before + 1);
        let Some(Persisted::Content(loaded)) = persistence.get_persisted().await.unwrap() else {
            panic!("expected content");
        };
        assert_eq!(loaded, store.with(|s| s.get_mergeable_content()));
    }
}
