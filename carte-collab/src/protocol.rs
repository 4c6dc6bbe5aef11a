//! JSON wire protocol for the collaboration channel.
//!
//! Every frame is a single JSON object with a `type` discriminator:
//! ```text
//! { "type": "edit", "operation": "insert", "position": 4, "content": "hi", ... }
//! ```
//!
//! Frames travel as WebSocket text messages. The envelope is shared by the
//! server and the synchronization agent; payload structs ([`EditOp`],
//! [`CursorPos`], [`Comment`]) are reused by the in-memory components so
//! nothing is re-encoded between the socket and the session actor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Kind of resource a session edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Component,
    Theme,
}

impl ResourceKind {
    /// Parse the path segment used in connect URLs.
    pub fn from_segment(s: &str) -> Option<Self> {
        match s {
            "component" => Some(Self::Component),
            "theme" => Some(Self::Theme),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Component => "component",
            Self::Theme => "theme",
        }
    }
}

/// Identifies one collaboratively edited resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceKey {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into() }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.id)
    }
}

/// An authenticated editor identity, provided by the host platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// Roster entry sent in join snapshots and presence broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: String,
    pub username: String,
    pub color: String,
}

// ─── Edit operations ─────────────────────────────────────────────

/// Edit operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Delete,
    Retain,
}

/// One atomic edit, positioned against the document the author saw.
///
/// Positions and lengths are in characters, not bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOp {
    pub kind: OpKind,
    pub position: usize,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub length: usize,
}

impl EditOp {
    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            kind: OpKind::Insert,
            position,
            length: content.chars().count(),
            content,
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self {
            kind: OpKind::Delete,
            position,
            content: String::new(),
            length,
        }
    }

    pub fn retain(position: usize) -> Self {
        Self {
            kind: OpKind::Retain,
            position,
            content: String::new(),
            length: 0,
        }
    }

    /// Whether applying this op would leave the buffer unchanged.
    pub fn is_noop(&self) -> bool {
        match self.kind {
            OpKind::Insert => self.content.is_empty(),
            OpKind::Delete => self.length == 0,
            OpKind::Retain => true,
        }
    }
}

// ─── Cursors ─────────────────────────────────────────────────────

/// Ephemeral cursor position for one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPos {
    pub user_id: String,
    pub position: usize,
    pub line: u32,
    pub column: u32,
    pub color: String,
    /// Sender-side timestamp (millis); last-write-wins ordering key.
    pub timestamp: u64,
}

// ─── Comments ────────────────────────────────────────────────────

/// A threaded comment anchored to a document position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub text: String,
    pub author_user_id: String,
    pub position: usize,
    pub line_number: u32,
    pub resolved: bool,
    pub created_at: u64,
    #[serde(default)]
    pub reactions: BTreeMap<String, u32>,
    #[serde(default)]
    pub replies: Vec<Comment>,
}

impl Comment {
    pub fn new(author_user_id: impl Into<String>, text: impl Into<String>, position: usize, line_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            author_user_id: author_user_id.into(),
            position,
            line_number,
            resolved: false,
            created_at: now_millis(),
            reactions: BTreeMap::new(),
            replies: Vec::new(),
        }
    }
}

/// Mutation requested (client→server) or performed (server→client)
/// on a comment thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentAction {
    Create,
    Reply,
    Resolve,
    Unresolve,
    React,
}

// ─── Envelope ────────────────────────────────────────────────────

/// Machine-readable error reasons carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    StaleBase,
    MalformedMessage,
    NotAuthorized,
}

/// Top-level protocol frame.
///
/// `edit` carries `base_sequence` only client→server and
/// `sequence_number`/`user_id` only server→client; the unused side is
/// simply absent from the JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    SessionInfo {
        session_id: Uuid,
        sequence: u64,
    },
    UserJoined {
        user_id: String,
        username: String,
        color: String,
    },
    UserResumed {
        user_id: String,
        username: String,
        color: String,
    },
    UserLeft {
        user_id: String,
    },
    Edit {
        operation: OpKind,
        position: usize,
        #[serde(default)]
        content: String,
        #[serde(default)]
        length: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        base_sequence: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Cursor {
        user_id: String,
        position: usize,
        line: u32,
        column: u32,
        color: String,
        timestamp: u64,
    },
    Comment {
        action: CommentAction,
        comment: Comment,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        emoji: Option<String>,
    },
    Ping,
    Pong,
    Error {
        error: ErrorReason,
        #[serde(default)]
        detail: String,
    },
}

impl WireMessage {
    /// An `edit` frame as submitted by a client.
    pub fn edit_submit(op: &EditOp, base_sequence: u64) -> Self {
        Self::Edit {
            operation: op.kind,
            position: op.position,
            content: op.content.clone(),
            length: op.length,
            base_sequence: Some(base_sequence),
            sequence_number: None,
            user_id: None,
        }
    }

    /// A sequenced `edit` frame as fanned out by the server.
    pub fn edit_accepted(op: &EditOp, sequence_number: u64, author: &str) -> Self {
        Self::Edit {
            operation: op.kind,
            position: op.position,
            content: op.content.clone(),
            length: op.length,
            base_sequence: None,
            sequence_number: Some(sequence_number),
            user_id: Some(author.to_string()),
        }
    }

    pub fn cursor(pos: &CursorPos) -> Self {
        Self::Cursor {
            user_id: pos.user_id.clone(),
            position: pos.position,
            line: pos.line,
            column: pos.column,
            color: pos.color.clone(),
            timestamp: pos.timestamp,
        }
    }

    pub fn error(error: ErrorReason, detail: impl Into<String>) -> Self {
        Self::Error {
            error,
            detail: detail.into(),
        }
    }

    /// Serialize to the JSON text carried in a WebSocket frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Deserialize a received text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Errors from encoding or decoding wire frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
}
