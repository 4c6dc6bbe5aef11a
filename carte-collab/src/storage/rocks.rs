//! RocksDB-backed comment thread store.
//!
//! Column families:
//! - `threads` — resource key → JSON array of root comments (full thread)
//! - `meta`    — resource key → JSON [`ResourceMeta`]
//!
//! Values are small JSON documents written whole on every mutation; the
//! gateway holds the per-resource lock across the write, which gives the
//! one-write-path-per-resource discipline without touching RocksDB's
//! transaction machinery.

use crate::protocol::Comment;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

const CF_THREADS: &str = "threads";
const CF_META: &str = "meta";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Max open files for RocksDB.
    pub max_open_files: i32,
    /// Write buffer size per column family.
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("carte_comments"),
            max_open_files: 256,
            write_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for tests: small buffers, caller-provided temp directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Per-resource bookkeeping stored alongside threads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMeta {
    /// Number of root comments (replies not counted).
    pub thread_count: u64,
    /// Last mutation timestamp (millis since epoch).
    pub updated_at: u64,
}

/// Errors from the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),

    #[error("failed to (de)serialize thread: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("missing column family {0}")]
    MissingColumnFamily(&'static str),

    #[error("stored key is not valid utf-8")]
    BadKey,
}

pub struct CommentDb {
    db: DB,
}

impl CommentDb {
    /// Open (or create) the database at the configured path.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(config.max_open_files);

        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(config.write_buffer_size);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_THREADS, cf_opts.clone()),
            ColumnFamilyDescriptor::new(CF_META, cf_opts),
        ];
        let db = DB::open_cf_descriptors(&opts, &config.path, cfs)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or(StoreError::MissingColumnFamily(name))
    }

    /// Persist a resource's full thread list.
    pub fn save_thread(
        &self,
        resource: &str,
        comments: &[Comment],
        updated_at: u64,
    ) -> Result<(), StoreError> {
        let threads = self.cf(CF_THREADS)?;
        self.db
            .put_cf(threads, resource.as_bytes(), serde_json::to_vec(comments)?)?;

        let meta = ResourceMeta {
            thread_count: comments.len() as u64,
            updated_at,
        };
        let meta_cf = self.cf(CF_META)?;
        self.db
            .put_cf(meta_cf, resource.as_bytes(), serde_json::to_vec(&meta)?)?;
        Ok(())
    }

    /// Load a single resource's thread list, if stored.
    pub fn load_thread(&self, resource: &str) -> Result<Option<Vec<Comment>>, StoreError> {
        let threads = self.cf(CF_THREADS)?;
        match self.db.get_cf(threads, resource.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load bookkeeping for a resource.
    pub fn load_meta(&self, resource: &str) -> Result<Option<ResourceMeta>, StoreError> {
        let meta = self.cf(CF_META)?;
        match self.db.get_cf(meta, resource.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load every stored resource's threads (used once, on gateway open).
    pub fn load_all(&self) -> Result<HashMap<String, Vec<Comment>>, StoreError> {
        let threads = self.cf(CF_THREADS)?;
        let mut out = HashMap::new();
        for entry in self.db.iterator_cf(threads, IteratorMode::Start) {
            let (key, value) = entry?;
            let resource = String::from_utf8(key.to_vec()).map_err(|_| StoreError::BadKey)?;
            out.insert(resource, serde_json::from_slice(&value)?);
        }
        Ok(out)
    }
}
