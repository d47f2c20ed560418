use thiserror::Error;

/// Errors raised by store writes and content replacement.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid cell {table_id}/{row_id}/{cell_id}: numbers must be finite")]
    InvalidCell {
        table_id: String,
        row_id: String,
        cell_id: String,
    },

    #[error("Invalid value {0}: numbers must be finite")]
    InvalidValue(String),

    #[error("Invalid mergeable content: {0}")]
    InvalidContent(String),
}
