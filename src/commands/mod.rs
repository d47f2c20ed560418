mod config_cmd;
mod data;
mod replica;
mod sync_cmd;

pub use config_cmd::{ConfigCommand, OutputFormat};
pub use data::{DelCellArgs, DelValueArgs, SetCellArgs, SetValueArgs, ShowArgs};
pub use replica::LocalReplica;
pub use sync_cmd::SyncCommand;
