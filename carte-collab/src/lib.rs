//! # carte-collab — real-time collaborative editing for Carte
//!
//! The synchronizer behind Carte's theme and component builder: multiple
//! editors of the same document see each other's cursors, converge on the
//! same content, and exchange threaded comments over one persistent
//! WebSocket per participant, surviving drops and reconnects.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON frames    ┌──────────────────────────────┐
//! │ CollabClient │ ◄──────────────► │ SyncServer                   │
//! │ (per editor) │    WebSocket     │  └─ connection task (1/conn) │
//! └──────┬───────┘                  └──────────────┬───────────────┘
//!        │ optimistic buffer                       │ SessionCommand
//!        │ + pending queue                         ▼
//! ┌──────┴───────┐                  ┌──────────────────────────────┐
//! │ SyncEvent    │                  │ session actor (1/resource)   │
//! │ stream → UI  │                  │  ├─ PresenceRegistry         │
//! └──────────────┘                  │  ├─ Sequencer (op transform) │
//!                                   │  └─ CursorTable              │
//!                                   └──────────────┬───────────────┘
//!                                                  │ shared
//!                                                  ▼
//!                                   ┌──────────────────────────────┐
//!                                   │ CommentStore (per resource,  │
//!                                   │ optional RocksDB)            │
//!                                   └──────────────────────────────┘
//! ```
//!
//! All state for one session is owned by that session's actor task;
//! connection tasks only pass messages. Different resources proceed fully
//! in parallel. Edits are totally ordered per session by the sequencer,
//! which transforms concurrent operations so every replica that applies
//! the sequenced stream converges byte-for-byte.
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire envelope and payload types
//! - [`sequencer`] — sequence numbers + operational transform
//! - [`presence`] — who is attached, colors, heartbeat eviction
//! - [`cursors`] — last-write-wins cursor table
//! - [`comments`] — cross-session comment gateway (optionally persistent)
//! - [`session`] — per-session coordinator actor and registry
//! - [`server`] — WebSocket accept loop and connection pump
//! - [`client`] — synchronization agent with reconnect/backoff
//! - [`document`] — seam to the platform's document-content store

pub mod client;
pub mod comments;
pub mod cursors;
pub mod document;
pub mod presence;
pub mod protocol;
pub mod sequencer;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use client::{
    Backoff, ClientConfig, CollabClient, CollabHandle, ConnectionState, SyncEvent,
};
pub use comments::{CommentStore, CommentStoreConfig, Resolution};
pub use cursors::CursorTable;
pub use document::{MemorySnapshots, Snapshot, SnapshotError, SnapshotStore};
pub use presence::{JoinOutcome, Participant, PresenceRegistry, COLOR_PALETTE};
pub use protocol::{
    Comment, CommentAction, CursorPos, EditOp, ErrorReason, Identity, OpKind, ParticipantInfo,
    ResourceKey, ResourceKind, WireMessage,
};
pub use sequencer::{apply, transform, SequencedOp, Sequencer, StaleBaseError, SubmitError};
pub use server::{
    AllowAll, AuthError, Authenticator, ConnectRequest, ServerConfig, ServerStats, SyncServer,
};
pub use session::{
    JoinAck, Lifecycle, SessionCommand, SessionConfig, SessionHandle, SessionRegistry,
};
