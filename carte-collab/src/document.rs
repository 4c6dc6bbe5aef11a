//! Seam to the platform's document-content store.
//!
//! The synchronizer never persists edited content itself; durability
//! belongs to the host platform. This trait is the resync path: when a
//! client's base falls out of the retained history it fetches the
//! authoritative snapshot here and resumes from its sequence number.

use crate::protocol::ResourceKey;
use std::collections::HashMap;
use std::sync::RwLock;

/// A point-in-time view of a resource's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub content: String,
    /// Sequence number the content reflects.
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("no snapshot stored for {0}")]
    NotFound(String),
}

/// Opaque content store owned by the host platform.
pub trait SnapshotStore: Send + Sync {
    fn snapshot(&self, resource: &ResourceKey) -> Result<Snapshot, SnapshotError>;
    fn commit(&self, resource: &ResourceKey, snapshot: Snapshot) -> Result<(), SnapshotError>;
}

/// In-memory store used by tests and single-process deployments.
#[derive(Default)]
pub struct MemorySnapshots {
    inner: RwLock<HashMap<String, Snapshot>>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(resource: &ResourceKey, content: impl Into<String>, sequence: u64) -> Self {
        let store = Self::new();
        store
            .commit(
                resource,
                Snapshot {
                    content: content.into(),
                    sequence,
                },
            )
            .expect("memory commit cannot fail");
        store
    }
}

impl SnapshotStore for MemorySnapshots {
    fn snapshot(&self, resource: &ResourceKey) -> Result<Snapshot, SnapshotError> {
        self.inner
            .read()
            .expect("snapshot lock poisoned")
            .get(&resource.to_string())
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(resource.to_string()))
    }

    fn commit(&self, resource: &ResourceKey, snapshot: Snapshot) -> Result<(), SnapshotError> {
        self.inner
            .write()
            .expect("snapshot lock poisoned")
            .insert(resource.to_string(), snapshot);
        Ok(())
    }
}
