//! Server-side modules for the tabsync relay.

pub mod hooks;
pub mod relay;
pub mod storage;
pub mod ws;

pub use hooks::{LoggingHooks, RelayHooks};
pub use relay::{ClientConnection, RelayError, RelayHub, RelayOptions};
pub use storage::{TopicStorage, TopicStorageError};
pub use ws::router;
