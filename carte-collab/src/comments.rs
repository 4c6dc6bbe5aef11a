//! Cross-session comment gateway.
//!
//! Comments are anchored to resources, not sessions: a session with zero
//! participants (or no session at all) can still accumulate comments via
//! direct API calls, and threads survive every reconnect. This is the one
//! component shared between session actors, so access goes through an
//! async API with a single write path per resource: an outer map of
//! per-resource locks, each mutation holding its resource's lock across
//! both the in-memory change and the optional RocksDB write.

use crate::protocol::{now_millis, Comment, ResourceKey};
use crate::storage::{CommentDb, StoreConfig, StoreError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Gateway configuration.
#[derive(Debug, Clone, Default)]
pub struct CommentStoreConfig {
    /// Persistence directory; `None` keeps threads in memory only.
    pub path: Option<PathBuf>,
}

/// Outcome of a resolve/unresolve request.
///
/// `Unchanged` means the comment was already in the requested state; the
/// caller must not broadcast anything for it.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Changed(Comment),
    Unchanged,
}

#[derive(Debug, thiserror::Error)]
pub enum CommentError {
    #[error("comment {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

type Thread = Arc<Mutex<Vec<Comment>>>;

pub struct CommentStore {
    threads: RwLock<HashMap<String, Thread>>,
    db: Option<CommentDb>,
}

impl CommentStore {
    /// Open the gateway, loading any persisted threads.
    pub fn open(config: &CommentStoreConfig) -> Result<Self, CommentError> {
        let mut loaded: HashMap<String, Thread> = HashMap::new();
        let db = match &config.path {
            Some(path) => {
                let db = CommentDb::open(&StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                for (resource, comments) in db.load_all()? {
                    loaded.insert(resource, Arc::new(Mutex::new(comments)));
                }
                Some(db)
            }
            None => None,
        };
        Ok(Self {
            threads: RwLock::new(loaded),
            db,
        })
    }

    /// In-memory gateway (tests, single-process deployments).
    pub fn in_memory() -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    /// Create a new root comment.
    pub async fn create(&self, resource: &ResourceKey, comment: Comment) -> Result<Comment, CommentError> {
        let thread = self.entry(resource).await;
        let mut comments = thread.lock().await;
        comments.push(comment.clone());
        self.persist(resource, &comments)?;
        Ok(comment)
    }

    /// Append a reply under `parent_id`; returns the updated root thread.
    pub async fn reply(
        &self,
        resource: &ResourceKey,
        parent_id: Uuid,
        reply: Comment,
    ) -> Result<Comment, CommentError> {
        let thread = self.entry(resource).await;
        let mut comments = thread.lock().await;
        let parent = find_mut(&mut comments, parent_id).ok_or(CommentError::NotFound(parent_id))?;
        parent.replies.push(reply);
        let root = root_of(&comments, parent_id)
            .cloned()
            .ok_or(CommentError::NotFound(parent_id))?;
        self.persist(resource, &comments)?;
        Ok(root)
    }

    /// Mark a comment resolved. Idempotent: resolving an already-resolved
    /// comment reports `Unchanged` instead of erroring.
    pub async fn resolve(&self, resource: &ResourceKey, id: Uuid) -> Result<Resolution, CommentError> {
        self.set_resolved(resource, id, true).await
    }

    /// Explicitly reopen a resolved comment. Distinct from resolve, never
    /// a toggle side effect.
    pub async fn unresolve(&self, resource: &ResourceKey, id: Uuid) -> Result<Resolution, CommentError> {
        self.set_resolved(resource, id, false).await
    }

    /// Bump a reaction count; returns the updated root thread.
    pub async fn react(
        &self,
        resource: &ResourceKey,
        id: Uuid,
        emoji: &str,
    ) -> Result<Comment, CommentError> {
        let thread = self.entry(resource).await;
        let mut comments = thread.lock().await;
        let target = find_mut(&mut comments, id).ok_or(CommentError::NotFound(id))?;
        *target.reactions.entry(emoji.to_string()).or_insert(0) += 1;
        let root = root_of(&comments, id).cloned().ok_or(CommentError::NotFound(id))?;
        self.persist(resource, &comments)?;
        Ok(root)
    }

    /// Full thread list for a resource.
    pub async fn list_by_resource(&self, resource: &ResourceKey) -> Vec<Comment> {
        match self.threads.read().await.get(&resource.to_string()) {
            Some(thread) => thread.lock().await.clone(),
            None => Vec::new(),
        }
    }

    /// Root comments that are still open, for join snapshots.
    pub async fn unresolved(&self, resource: &ResourceKey) -> Vec<Comment> {
        self.list_by_resource(resource)
            .await
            .into_iter()
            .filter(|c| !c.resolved)
            .collect()
    }

    async fn set_resolved(
        &self,
        resource: &ResourceKey,
        id: Uuid,
        resolved: bool,
    ) -> Result<Resolution, CommentError> {
        let thread = self.entry(resource).await;
        let mut comments = thread.lock().await;
        let target = find_mut(&mut comments, id).ok_or(CommentError::NotFound(id))?;
        if target.resolved == resolved {
            return Ok(Resolution::Unchanged);
        }
        target.resolved = resolved;
        let root = root_of(&comments, id).cloned().ok_or(CommentError::NotFound(id))?;
        self.persist(resource, &comments)?;
        Ok(Resolution::Changed(root))
    }

    /// Get or create the per-resource thread entry (double-checked).
    async fn entry(&self, resource: &ResourceKey) -> Thread {
        let key = resource.to_string();
        {
            let threads = self.threads.read().await;
            if let Some(thread) = threads.get(&key) {
                return thread.clone();
            }
        }
        let mut threads = self.threads.write().await;
        threads
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    fn persist(&self, resource: &ResourceKey, comments: &[Comment]) -> Result<(), CommentError> {
        if let Some(db) = &self.db {
            db.save_thread(&resource.to_string(), comments, now_millis())?;
        }
        Ok(())
    }
}

/// Depth-first search through roots and replies.
fn find_mut(comments: &mut [Comment], id: Uuid) -> Option<&mut Comment> {
    for comment in comments {
        if comment.id == id {
            return Some(comment);
        }
        if let Some(found) = find_mut(&mut comment.replies, id) {
            return Some(found);
        }
    }
    None
}

fn contains(comment: &Comment, id: Uuid) -> bool {
    comment.id == id || comment.replies.iter().any(|r| contains(r, id))
}

/// The root comment whose thread contains `id`.
fn root_of(comments: &[Comment], id: Uuid) -> Option<&Comment> {
    comments.iter().find(|c| contains(c, id))
}
