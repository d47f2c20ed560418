//! Batched local writes.

use std::collections::BTreeMap;

use super::content::{Content, Row};
use super::error::StoreError;
use super::MergeableStore;
use crate::stamp::{CellValue, Id};

type CellPath = (Id, Id, Id);

/// Writes collected inside [`MergeableStore::transaction`].
///
/// Reads see the transaction's own pending writes. Nothing reaches the store
/// until the closure returns, and then every write is stamped and merged.
pub struct Transaction<'a> {
    store: &'a MergeableStore,
    cells: BTreeMap<CellPath, Option<CellValue>>,
    values: BTreeMap<Id, Option<CellValue>>,
}

impl<'a> Transaction<'a> {
    pub(super) fn new(store: &'a MergeableStore) -> Self {
        Self {
            store,
            cells: BTreeMap::new(),
            values: BTreeMap::new(),
        }
    }

    pub fn get_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<&CellValue> {
        let path = (table_id.to_string(), row_id.to_string(), cell_id.to_string());
        match self.cells.get(&path) {
            Some(pending) => pending.as_ref(),
            None => self.store.get_cell(table_id, row_id, cell_id),
        }
    }

    pub fn get_value(&self, value_id: &str) -> Option<&CellValue> {
        match self.values.get(value_id) {
            Some(pending) => pending.as_ref(),
            None => self.store.get_value(value_id),
        }
    }

    /// Cell ids of a row, including pending writes.
    pub fn get_cell_ids(&self, table_id: &str, row_id: &str) -> Vec<Id> {
        let mut ids: Vec<Id> = self
            .store
            .get_row(table_id, row_id)
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default();
        for ((t, r, c), value) in &self.cells {
            if t == table_id && r == row_id && value.is_some() && !ids.contains(c) {
                ids.push(c.clone());
            }
        }
        ids.retain(|id| self.get_cell(table_id, row_id, id).is_some());
        ids
    }

    pub fn set_cell(
        &mut self,
        table_id: &str,
        row_id: &str,
        cell_id: &str,
        value: impl Into<CellValue>,
    ) -> &mut Self {
        self.write_cell(table_id, row_id, cell_id, Some(value.into()))
    }

    pub fn del_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str) -> &mut Self {
        self.write_cell(table_id, row_id, cell_id, None)
    }

    /// Replaces a row: cells missing from `row` are deleted.
    pub fn set_row(&mut self, table_id: &str, row_id: &str, row: Row) -> &mut Self {
        for cell_id in self.get_cell_ids(table_id, row_id) {
            if !row.contains_key(&cell_id) {
                self.del_cell(table_id, row_id, &cell_id);
            }
        }
        for (cell_id, value) in row {
            self.set_cell(table_id, row_id, &cell_id, value);
        }
        self
    }

    pub fn del_row(&mut self, table_id: &str, row_id: &str) -> &mut Self {
        for cell_id in self.get_cell_ids(table_id, row_id) {
            self.del_cell(table_id, row_id, &cell_id);
        }
        self
    }

    pub fn del_table(&mut self, table_id: &str) -> &mut Self {
        let row_ids: Vec<Id> = self
            .store
            .get_table(table_id)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default();
        for row_id in row_ids {
            self.del_row(table_id, &row_id);
        }
        self
    }

    pub fn set_value(&mut self, value_id: &str, value: impl Into<CellValue>) -> &mut Self {
        self.values.insert(value_id.to_string(), Some(value.into()));
        self
    }

    pub fn del_value(&mut self, value_id: &str) -> &mut Self {
        self.values.insert(value_id.to_string(), None);
        self
    }

    /// Replaces all tables and values with `content`.
    pub fn set_content(&mut self, content: &Content) -> &mut Self {
        let table_ids: Vec<Id> = self.store.get_tables().keys().cloned().collect();
        for table_id in table_ids {
            match content.tables.get(&table_id) {
                Some(table) => {
                    let row_ids: Vec<Id> = self
                        .store
                        .get_table(&table_id)
                        .map(|rows| rows.keys().cloned().collect())
                        .unwrap_or_default();
                    for row_id in row_ids.iter().filter(|id| !table.contains_key(*id)) {
                        self.del_row(&table_id, row_id);
                    }
                }
                None => {
                    self.del_table(&table_id);
                }
            }
        }
        for (table_id, table) in &content.tables {
            for (row_id, row) in table {
                self.set_row(table_id, row_id, row.clone());
            }
        }

        let value_ids: Vec<Id> = self.store.get_values().keys().cloned().collect();
        for value_id in value_ids.iter().filter(|id| !content.values.contains_key(*id)) {
            self.del_value(value_id);
        }
        for (value_id, value) in &content.values {
            self.set_value(value_id, value.clone());
        }
        self
    }

    fn write_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str, value: Option<CellValue>) -> &mut Self {
        self.cells
            .insert((table_id.to_string(), row_id.to_string(), cell_id.to_string()), value);
        self
    }

    /// Validates and drops writes that leave the plain view unchanged.
    pub(super) fn into_writes(self) -> Result<Writes, StoreError> {
        let store = self.store;
        let mut cells = Vec::new();
        for ((table_id, row_id, cell_id), value) in self.cells {
            if value.as_ref().is_some_and(|v| !v.is_valid()) {
                return Err(StoreError::InvalidCell {
                    table_id,
                    row_id,
                    cell_id,
                });
            }
            if store.get_cell(&table_id, &row_id, &cell_id) != value.as_ref() {
                cells.push(((table_id, row_id, cell_id), value));
            }
        }

        let mut values = Vec::new();
        for (value_id, value) in self.values {
            if value.as_ref().is_some_and(|v| !v.is_valid()) {
                return Err(StoreError::InvalidValue(value_id));
            }
            if store.get_value(&value_id) != value.as_ref() {
                values.push((value_id, value));
            }
        }
        Ok(Writes { cells, values })
    }
}

pub(super) struct Writes {
    pub cells: Vec<(CellPath, Option<CellValue>)>,
    pub values: Vec<(Id, Option<CellValue>)>,
}

impl Writes {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty() && self.values.is_empty()
    }
}
