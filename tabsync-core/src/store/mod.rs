//! The mergeable tabular store.
//!
//! [`MergeableStore`] keeps a stamped tree of tables, rows and cells plus a
//! flat tree of values, and derives a plain [`Content`] view from them. Local
//! writes go through [`MergeableStore::transaction`]; remote data arrives
//! through [`MergeableStore::apply_mergeable_changes`] or
//! [`MergeableStore::set_mergeable_content`]. Every accepted change is
//! published as a [`StoreEvent`].

mod content;
mod error;
mod shared;
mod transaction;

use std::collections::BTreeMap;

use tokio::sync::broadcast;
use tracing::debug;

use crate::hlc::Hlc;
use crate::stamp::{
    CellHashes, CellValue, ContentHashes, Id, MergeableChanges, MergeableContent, RowDiff, RowHashes, Stamp,
    TableDiff, TableHashes, TablesStamp, ValueHashes, ValuesStamp,
};
use crate::tree::{latest_time, StampTree, TablesNode, ValuesNode};

pub use content::{Content, Row, Table, Tables, Values};
pub use error::StoreError;
pub use shared::{Origin, SharedStore, StoreEvent};
pub use transaction::Transaction;

const EVENT_CAPACITY: usize = 1024;

pub struct MergeableStore {
    hlc: Hlc,
    tables: TablesNode,
    values: ValuesNode,
    content: Content,
    defaulting: bool,
    events: broadcast::Sender<StoreEvent>,
}

impl MergeableStore {
    /// Creates an empty store. `unique_id` fixes the clock's replica tag.
    pub fn new(unique_id: Option<&str>) -> Self {
        Self::with_hlc(Hlc::new(unique_id))
    }

    pub fn with_hlc(hlc: Hlc) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            hlc,
            tables: TablesNode::default(),
            values: ValuesNode::default(),
            content: Content::default(),
            defaulting: false,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    // Plain view

    pub fn get_content(&self) -> Content {
        self.content.clone()
    }

    pub fn get_tables(&self) -> &Tables {
        &self.content.tables
    }

    pub fn get_table(&self, table_id: &str) -> Option<&Table> {
        self.content.tables.get(table_id)
    }

    pub fn get_row(&self, table_id: &str, row_id: &str) -> Option<&Row> {
        self.get_table(table_id)?.get(row_id)
    }

    pub fn get_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<&CellValue> {
        self.content.get_cell(table_id, row_id, cell_id)
    }

    pub fn get_values(&self) -> &Values {
        &self.content.values
    }

    pub fn get_value(&self, value_id: &str) -> Option<&CellValue> {
        self.content.values.get(value_id)
    }

    // Local writes

    /// Runs `actions` against a [`Transaction`] and commits its writes.
    ///
    /// Each changed cell or value gets a fresh timestamp. An invalid write
    /// rejects the whole transaction and leaves the store untouched.
    pub fn transaction<R>(&mut self, actions: impl FnOnce(&mut Transaction<'_>) -> R) -> Result<R, StoreError> {
        let (result, writes) = {
            let mut transaction = Transaction::new(self);
            let result = actions(&mut transaction);
            (result, transaction.into_writes()?)
        };
        if writes.is_empty() {
            return Ok(result);
        }

        let mut changes = MergeableChanges::default();
        for ((table_id, row_id, cell_id), value) in writes.cells {
            let time = self.next_time();
            changes
                .tables
                .value
                .entry(table_id)
                .or_default()
                .value
                .entry(row_id)
                .or_default()
                .value
                .insert(cell_id, Stamp::new(value, time));
        }
        for (value_id, value) in writes.values {
            let time = self.next_time();
            changes.values.value.insert(value_id, Stamp::new(value, time));
        }

        self.merge_stamps(&changes, false, Origin::Local);
        Ok(result)
    }

    pub fn set_cell(
        &mut self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        value: impl Into<CellValue>,
    ) -> Result<&mut Self, StoreError> {
        self.transaction(|tx| {
            tx.set_cell(table_id, row_id, cell_id, value);
        })?;
        Ok(self)
    }

    pub fn del_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str) -> Result<&mut Self, StoreError> {
        self.transaction(|tx| {
            tx.del_cell(table_id, row_id, cell_id);
        })?;
        Ok(self)
    }

    pub fn set_row(&mut self, table_id: &str, row_id: &str, row: Row) -> Result<&mut Self, StoreError> {
        self.transaction(|tx| {
            tx.set_row(table_id, row_id, row);
        })?;
        Ok(self)
    }

    pub fn del_row(&mut self, table_id: &str, row_id: &str) -> Result<&mut Self, StoreError> {
        self.transaction(|tx| {
            tx.del_row(table_id, row_id);
        })?;
        Ok(self)
    }

    pub fn del_table(&mut self, table_id: &str) -> Result<&mut Self, StoreError> {
        self.transaction(|tx| {
            tx.del_table(table_id);
        })?;
        Ok(self)
    }

    pub fn set_value(&mut self, value_id: &str, value: impl Into<CellValue>) -> Result<&mut Self, StoreError> {
        self.transaction(|tx| {
            tx.set_value(value_id, value);
        })?;
        Ok(self)
    }

    pub fn del_value(&mut self, value_id: &str) -> Result<&mut Self, StoreError> {
        self.transaction(|tx| {
            tx.del_value(value_id);
        })?;
        Ok(self)
    }

    /// Writes `content` with empty timestamps, so any real write supersedes it.
    pub fn set_default_content(&mut self, content: &Content) -> Result<&mut Self, StoreError> {
        self.defaulting = true;
        let result = self.transaction(|tx| {
            tx.set_content(content);
        });
        self.defaulting = false;
        result?;
        Ok(self)
    }

    fn next_time(&mut self) -> String {
        if self.defaulting {
            String::new()
        } else {
            self.hlc.next()
        }
    }

    // Mergeable API

    pub fn get_mergeable_content(&self) -> MergeableContent {
        MergeableContent::new(self.tables.to_stamp(true), self.values.to_stamp(true))
    }

    pub fn get_mergeable_content_hashes(&self) -> ContentHashes {
        ContentHashes(self.tables.hash, self.values.hash)
    }

    pub fn get_mergeable_table_hashes(&self) -> TableHashes {
        self.tables.hashes()
    }

    /// Tables the other side lacks, and shared tables whose hashes differ.
    pub fn get_mergeable_table_diff(&self, other_table_hashes: &TableHashes) -> TableDiff {
        self.tables.diff(other_table_hashes)
    }

    /// Row hashes of every local table whose hash differs from the one given.
    pub fn get_mergeable_row_hashes(&self, other_table_hashes: &TableHashes) -> RowHashes {
        other_table_hashes
            .iter()
            .filter_map(|(table_id, other_hash)| {
                let table = self.tables.children.get(table_id)?;
                (table.hash != *other_hash).then(|| (table_id.clone(), table.hashes()))
            })
            .collect()
    }

    pub fn get_mergeable_row_diff(&self, other_table_row_hashes: &RowHashes) -> RowDiff {
        let mut new_rows = TablesStamp::new(BTreeMap::new(), self.tables.time.clone());
        let mut differing = RowHashes::new();
        for (table_id, other_row_hashes) in other_table_row_hashes {
            let Some(table) = self.tables.children.get(table_id) else {
                continue;
            };
            let (new, differing_rows) = table.diff(other_row_hashes);
            if !new.value.is_empty() {
                new_rows.value.insert(table_id.clone(), new);
            }
            if !differing_rows.is_empty() {
                differing.insert(table_id.clone(), differing_rows);
            }
        }
        (new_rows, differing)
    }

    /// Cell hashes of every local row whose hash differs from the one given.
    pub fn get_mergeable_cell_hashes(&self, other_table_row_hashes: &RowHashes) -> CellHashes {
        let mut cell_hashes = CellHashes::new();
        for (table_id, other_row_hashes) in other_table_row_hashes {
            let Some(table) = self.tables.children.get(table_id) else {
                continue;
            };
            for (row_id, other_hash) in other_row_hashes {
                match table.children.get(row_id) {
                    Some(row) if row.hash != *other_hash => {
                        cell_hashes
                            .entry(table_id.clone())
                            .or_default()
                            .insert(row_id.clone(), row.hashes());
                    }
                    _ => {}
                }
            }
        }
        cell_hashes
    }

    pub fn get_mergeable_cell_diff(&self, other_table_row_cell_hashes: &CellHashes) -> TablesStamp {
        let mut tables = TablesStamp::new(BTreeMap::new(), self.tables.time.clone());
        for (table_id, other_row_cell_hashes) in other_table_row_cell_hashes {
            let Some(table) = self.tables.children.get(table_id) else {
                continue;
            };
            for (row_id, other_cell_hashes) in other_row_cell_hashes {
                let Some(row) = table.children.get(row_id) else {
                    continue;
                };
                let cells = row.stamps_unlike(other_cell_hashes);
                if cells.value.is_empty() {
                    continue;
                }
                tables
                    .value
                    .entry(table_id.clone())
                    .or_insert_with(|| Stamp::new(BTreeMap::new(), table.time.clone()))
                    .value
                    .insert(row_id.clone(), cells);
            }
        }
        tables
    }

    pub fn get_mergeable_value_hashes(&self) -> ValueHashes {
        self.values.hashes()
    }

    pub fn get_mergeable_value_diff(&self, other_value_hashes: &ValueHashes) -> ValuesStamp {
        self.values.stamps_unlike(other_value_hashes)
    }

    /// Replaces the whole store with a validated content snapshot.
    ///
    /// Hashes in `content` are trusted as-is. Content without a hash at every
    /// level, or with non-finite numbers, is rejected and the store is left
    /// unchanged.
    pub fn set_mergeable_content(&mut self, content: &MergeableContent) -> Result<&mut Self, StoreError> {
        if !TablesNode::validate(&content.tables) || !ValuesNode::validate(&content.values) {
            return Err(StoreError::InvalidContent(
                "every stamp needs a time and hash, and every leaf a primitive value".to_string(),
            ));
        }
        self.tables = TablesNode::default();
        self.values = ValuesNode::default();
        self.content = Content::default();
        self.merge_stamps(content, true, Origin::Remote);
        Ok(self)
    }

    /// Merges changes from another replica, recomputing hashes locally.
    ///
    /// Returns whether anything was accepted.
    pub fn apply_mergeable_changes(&mut self, changes: &MergeableChanges) -> bool {
        self.merge_stamps(changes, false, Origin::Remote)
    }

    /// Exchanges full content with `other` in both directions.
    pub fn merge(&mut self, other: &mut MergeableStore) -> &mut Self {
        let mine = self.get_mergeable_content();
        let theirs = other.get_mergeable_content();
        other.apply_mergeable_changes(&mine);
        self.apply_mergeable_changes(&theirs);
        self
    }

    fn merge_stamps(&mut self, incoming: &MergeableContent, is_content: bool, origin: Origin) -> bool {
        let tables = self.tables.merge(&incoming.tables, is_content);
        let values = self.values.merge(&incoming.values, is_content);
        self.hlc.seen(Some(&latest_time(&tables.latest, &values.latest)));

        let changes = MergeableChanges::new(
            tables.changes.unwrap_or_default(),
            values.changes.unwrap_or_default(),
        );
        if changes.is_empty() {
            return false;
        }

        for (table_id, table) in &changes.tables.value {
            for (row_id, row) in &table.value {
                for (cell_id, cell) in &row.value {
                    self.content.set_cell(table_id, row_id, cell_id, cell.value.clone());
                }
            }
        }
        for (value_id, value) in &changes.values.value {
            self.content.set_value(value_id, value.value.clone());
        }

        let touched = MergeableChanges::new(
            self.tables.touched(&changes.tables, true),
            self.values.touched(&changes.values, true),
        );
        debug!(
            ?origin,
            tables = touched.tables.value.len(),
            values = touched.values.value.len(),
            "Merged changes"
        );
        // No subscribers is not an error.
        let _ = self.events.send(StoreEvent {
            origin,
            changes: touched,
        });
        true
    }
}

impl Default for MergeableStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MergeableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeableStore")
            .field("hlc", &self.hlc)
            .field("content", &self.content)
            .finish()
    }
}

/// Ids present in both maps, used to ignore diff responses about unasked ids.
pub(crate) fn retain_known<V, W>(map: &mut BTreeMap<Id, V>, known: &BTreeMap<Id, W>) {
    map.retain(|id, _| known.contains_key(id));
}
