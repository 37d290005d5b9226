pub mod cf;
pub mod config;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod hasher;
pub mod index;
pub mod memtable;
pub mod vlog;
pub mod wal;

pub use cf::{ColumnFamily, Stat};
pub use config::{ColumnFamilyOptions, IoMode, WriteOptions};
pub use error::{Error, Result};
