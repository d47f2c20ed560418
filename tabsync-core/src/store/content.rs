//! The plain, unstamped view of a store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::stamp::{CellValue, Id};

pub type Row = BTreeMap<Id, CellValue>;
pub type Table = BTreeMap<Id, Row>;
pub type Tables = BTreeMap<Id, Table>;
pub type Values = BTreeMap<Id, CellValue>;

/// Tables and values without timestamps or hashes.
///
/// Empty rows and tables are never kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub tables: Tables,
    #[serde(default)]
    pub values: Values,
}

impl Content {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.values.is_empty()
    }

    pub fn get_cell(&self, table_id: &str, row_id: &str, cell_id: &str) -> Option<&CellValue> {
        self.tables.get(table_id)?.get(row_id)?.get(cell_id)
    }

    pub(crate) fn set_cell(&mut self, table_id: &str, row_id: &str, cell_id: &str, value: Option<CellValue>) {
        match value {
            Some(value) => {
                self.tables
                    .entry(table_id.to_string())
                    .or_default()
                    .entry(row_id.to_string())
                    .or_default()
                    .insert(cell_id.to_string(), value);
            }
            None => {
                let Some(table) = self.tables.get_mut(table_id) else {
                    return;
                };
                if let Some(row) = table.get_mut(row_id) {
                    row.remove(cell_id);
                    if row.is_empty() {
                        table.remove(row_id);
                    }
                }
                if table.is_empty() {
                    self.tables.remove(table_id);
                }
            }
        }
    }

    pub(crate) fn set_value(&mut self, value_id: &str, value: Option<CellValue>) {
        match value {
            Some(value) => {
                self.values.insert(value_id.to_string(), value);
            }
            None => {
                self.values.remove(value_id);
            }
        }
    }
}
