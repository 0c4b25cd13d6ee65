pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::{S3Config, TransferOptions};
pub use core::{TransferEngine, TransferReport};
pub use error::{ConfigError, StorageError};
pub use storage::{Entry, EntryKind, LocalStorage, MemoryStorage, S3Storage, Storage};
