//! Optional persistence for the comment gateway.
//!
//! Comment threads outlive any editing session, so the gateway can be
//! backed by a RocksDB database: one column family maps a resource key to
//! its serialized thread list, a second keeps per-resource bookkeeping.
//! With no storage path configured the gateway runs purely in memory and
//! this module stays unused at runtime.

pub mod rocks;

pub use rocks::{CommentDb, ResourceMeta, StoreConfig, StoreError};
