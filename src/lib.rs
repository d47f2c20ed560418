//! Tabsync relay server and CLI support.

pub mod config;
pub mod server;
