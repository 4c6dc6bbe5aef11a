//! Client synchronization agent.
//!
//! Pure protocol + reconnection, no rendering: the embedding UI drives the
//! agent through a [`CollabHandle`] and consumes a [`SyncEvent`] stream.
//! The agent keeps a shadow buffer of the document, applies local edits
//! optimistically, bridges remote operations over its pending (unacked)
//! edits, and survives connection drops with exponential backoff plus
//! jitter, resuming the same session so the server treats it as the same
//! participant.
//!
//! Edit discipline: at most one local operation is in flight; the author's
//! own echo (recognized by `user_id`) acknowledges it, carries the
//! assigned sequence number, and is never re-applied. When the server
//! answers `stale_base` the agent discards pending edits, pulls the
//! authoritative snapshot from the external document store, and resumes
//! from the snapshot's sequence number.

use crate::document::SnapshotStore;
use crate::protocol::{
    Comment, CommentAction, CursorPos, EditOp, ErrorReason, Identity, ParticipantInfo,
    ResourceKey, WireMessage,
};
use crate::sequencer::{apply, transform};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server root, e.g. `ws://127.0.0.1:9090`.
    pub server_url: String,
    pub resource: ResourceKey,
    pub identity: Identity,
    /// Opaque auth token forwarded to the server's authenticator.
    pub token: Option<String>,
    /// Heartbeat ping period (server evicts at 3× this).
    pub ping_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Event channel depth handed to the embedding UI.
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, resource: ResourceKey, identity: Identity) -> Self {
        Self {
            server_url: server_url.into(),
            resource,
            identity,
            token: None,
            ping_interval: Duration::from_secs(15),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

/// Connection lifecycle as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted to the embedding UI.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// First successful connection; the shadow buffer is initialized.
    Connected { session_id: Uuid },
    /// Reconnected into the same session as the same participant.
    Resumed { session_id: Uuid },
    /// Connection lost; the agent is backing off and will retry.
    Disconnected,
    ParticipantJoined(ParticipantInfo),
    ParticipantResumed(ParticipantInfo),
    ParticipantLeft { user_id: String },
    /// A remote operation was applied to the shadow buffer (already
    /// bridged over any pending local edits).
    RemoteEdit {
        sequence: u64,
        author: String,
        op: EditOp,
    },
    /// The server sequenced one of our own edits.
    EditAcknowledged { sequence: u64 },
    CursorMoved(CursorPos),
    CommentEvent {
        action: CommentAction,
        comment: Comment,
    },
    /// Local state was replaced by the authoritative snapshot.
    Resynced { sequence: u64 },
    ServerError { reason: ErrorReason, detail: String },
}

/// Exponential backoff with equal jitter: base·2ⁿ capped, then the upper
/// half randomized so reconnecting editors don't stampede the server.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        let half = exp / 2;
        let jitter = rand::thread_rng().gen_range(0..=half.as_millis().max(1) as u64);
        (half + Duration::from_millis(jitter)).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// ─── Handle ──────────────────────────────────────────────────────

enum AgentCommand {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
    Cursor { position: usize, line: u32, column: u32 },
    Comment {
        action: CommentAction,
        comment: Comment,
        parent_id: Option<Uuid>,
        emoji: Option<String>,
    },
    Close,
}

struct Shared {
    state: RwLock<ConnectionState>,
    session_id: RwLock<Option<Uuid>>,
    buffer: RwLock<String>,
    sequence: RwLock<u64>,
}

/// The agent's been shut down (or its task panicked).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("agent is closed")]
pub struct AgentClosed;

/// UI-facing handle to a running agent.
#[derive(Clone)]
pub struct CollabHandle {
    cmd_tx: mpsc::Sender<AgentCommand>,
    shared: Arc<Shared>,
}

impl CollabHandle {
    pub async fn insert(&self, position: usize, text: impl Into<String>) -> Result<(), AgentClosed> {
        self.send(AgentCommand::Insert {
            position,
            text: text.into(),
        })
        .await
    }

    pub async fn delete(&self, position: usize, length: usize) -> Result<(), AgentClosed> {
        self.send(AgentCommand::Delete { position, length }).await
    }

    pub async fn move_cursor(&self, position: usize, line: u32, column: u32) -> Result<(), AgentClosed> {
        self.send(AgentCommand::Cursor {
            position,
            line,
            column,
        })
        .await
    }

    pub async fn comment(
        &self,
        action: CommentAction,
        comment: Comment,
        parent_id: Option<Uuid>,
        emoji: Option<String>,
    ) -> Result<(), AgentClosed> {
        self.send(AgentCommand::Comment {
            action,
            comment,
            parent_id,
            emoji,
        })
        .await
    }

    /// Clean shutdown: sends a close frame and leaves the session.
    pub async fn close(&self) -> Result<(), AgentClosed> {
        self.send(AgentCommand::Close).await
    }

    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub async fn session_id(&self) -> Option<Uuid> {
        *self.shared.session_id.read().await
    }

    /// Current shadow buffer contents.
    pub async fn buffer(&self) -> String {
        self.shared.buffer.read().await.clone()
    }

    /// Highest sequence number applied or acknowledged.
    pub async fn sequence(&self) -> u64 {
        *self.shared.sequence.read().await
    }

    async fn send(&self, cmd: AgentCommand) -> Result<(), AgentClosed> {
        self.cmd_tx.send(cmd).await.map_err(|_| AgentClosed)
    }
}

// ─── Agent ───────────────────────────────────────────────────────

/// The synchronization agent. [`start`](Self::start) consumes it and runs
/// the connection loop on a background task.
pub struct CollabClient {
    config: ClientConfig,
    snapshots: Arc<dyn SnapshotStore>,
}

enum Exit {
    /// User asked to close; do not reconnect.
    Closed,
    /// Transport dropped; reconnect with backoff.
    Dropped,
}

impl CollabClient {
    pub fn new(config: ClientConfig, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self { config, snapshots }
    }

    /// Spawn the agent. Returns the control handle and the event stream.
    pub fn start(self) -> (CollabHandle, mpsc::Receiver<SyncEvent>) {
        let (event_tx, event_rx) = mpsc::channel(self.config.event_capacity);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let shared = Arc::new(Shared {
            state: RwLock::new(ConnectionState::Disconnected),
            session_id: RwLock::new(None),
            buffer: RwLock::new(String::new()),
            sequence: RwLock::new(0),
        });

        let handle = CollabHandle {
            cmd_tx,
            shared: shared.clone(),
        };
        tokio::spawn(run_agent(self.config, self.snapshots, shared, event_tx, cmd_rx));
        (handle, event_rx)
    }
}

struct AgentState {
    config: ClientConfig,
    snapshots: Arc<dyn SnapshotStore>,
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<SyncEvent>,
    /// Local edits applied to the buffer but not yet acknowledged. The
    /// front element is the one in flight (if any).
    pending: VecDeque<EditOp>,
    in_flight: bool,
    last_seen: u64,
    initialized: bool,
}

async fn run_agent(
    config: ClientConfig,
    snapshots: Arc<dyn SnapshotStore>,
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<SyncEvent>,
    mut cmd_rx: mpsc::Receiver<AgentCommand>,
) {
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_cap);
    let mut state = AgentState {
        config,
        snapshots,
        shared,
        event_tx,
        pending: VecDeque::new(),
        in_flight: false,
        last_seen: 0,
        initialized: false,
    };

    loop {
        let connecting = if state.initialized {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        };
        state.set_state(connecting).await;

        let url = state.connect_url().await;
        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => {
                backoff.reset();
                state.set_state(ConnectionState::Connected).await;
                let exit = state.run_connection(ws_stream, &mut cmd_rx).await;
                state.in_flight = false;
                match exit {
                    Exit::Closed => break,
                    Exit::Dropped => {
                        state.set_state(ConnectionState::Disconnected).await;
                        state.emit(SyncEvent::Disconnected).await;
                    }
                }
            }
            Err(err) => {
                log::debug!("connect to {url} failed: {err}");
            }
        }

        let delay = backoff.next_delay();
        log::debug!("reconnecting in {delay:?}");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let mut shutdown = false;
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(AgentCommand::Close) | None => {
                        shutdown = true;
                        break;
                    }
                    // Edits authored while offline apply optimistically
                    // and queue for replay on reconnect.
                    Some(AgentCommand::Insert { position, text }) => {
                        state.queue_offline(EditOp::insert(position, text)).await;
                    }
                    Some(AgentCommand::Delete { position, length }) => {
                        state.queue_offline(EditOp::delete(position, length)).await;
                    }
                    // Cursors are ephemeral and comments need the session;
                    // both are dropped while offline.
                    Some(_) => {}
                }
            }
        }
        if shutdown {
            break;
        }
    }
    state.set_state(ConnectionState::Disconnected).await;
}

impl AgentState {
    async fn connect_url(&self) -> String {
        let mut url = format!(
            "{}/collab/{}/{}?user={}&name={}",
            self.config.server_url,
            self.config.resource.kind.as_str(),
            self.config.resource.id,
            self.config.identity.user_id,
            self.config.identity.username,
        );
        if let Some(session) = *self.shared.session_id.read().await {
            url.push_str(&format!("&session={session}"));
        }
        if let Some(token) = &self.config.token {
            url.push_str(&format!("&token={token}"));
        }
        url
    }

    async fn run_connection(
        &mut self,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        cmd_rx: &mut mpsc::Receiver<AgentCommand>,
    ) -> Exit {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.reset(); // don't ping immediately

        // A fresh socket means any previous in-flight op was never acked;
        // it is still at the front of `pending` and will be resent.
        self.in_flight = false;
        self.flush_next(&mut ws_sender).await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(AgentCommand::Insert { position, text }) => {
                        let op = EditOp::insert(position, text);
                        self.author_edit(op, &mut ws_sender).await;
                    }
                    Some(AgentCommand::Delete { position, length }) => {
                        let op = EditOp::delete(position, length);
                        self.author_edit(op, &mut ws_sender).await;
                    }
                    Some(AgentCommand::Cursor { position, line, column }) => {
                        let frame = WireMessage::Cursor {
                            user_id: self.config.identity.user_id.clone(),
                            position,
                            line,
                            column,
                            color: String::new(), // server fills the assigned color
                            timestamp: crate::protocol::now_millis(),
                        };
                        let _ = self.send_frame(&mut ws_sender, &frame).await;
                    }
                    Some(AgentCommand::Comment { action, comment, parent_id, emoji }) => {
                        let frame = WireMessage::Comment { action, comment, parent_id, emoji };
                        let _ = self.send_frame(&mut ws_sender, &frame).await;
                    }
                    Some(AgentCommand::Close) | None => {
                        let _ = ws_sender.close().await;
                        return Exit::Closed;
                    }
                },

                frame = ws_receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match WireMessage::decode(text.as_ref()) {
                            Ok(msg) => {
                                if self.handle_frame(msg, &mut ws_sender).await.is_err() {
                                    return Exit::Dropped;
                                }
                            }
                            Err(err) => log::warn!("undecodable frame from server: {err}"),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if ws_sender.send(Message::Pong(payload)).await.is_err() {
                            return Exit::Dropped;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Exit::Dropped,
                    Some(Err(err)) => {
                        log::debug!("socket error: {err}");
                        return Exit::Dropped;
                    }
                    _ => {}
                },

                _ = ping.tick() => {
                    if self.send_frame(&mut ws_sender, &WireMessage::Ping).await.is_err() {
                        return Exit::Dropped;
                    }
                }
            }
        }
    }

    /// Apply a local edit optimistically and queue it for submission.
    async fn author_edit<S>(&mut self, op: EditOp, ws_sender: &mut S)
    where
        S: SinkExt<Message> + Unpin,
    {
        {
            let mut buffer = self.shared.buffer.write().await;
            apply(&mut buffer, &op);
        }
        self.pending.push_back(op);
        self.flush_next(ws_sender).await;
    }

    /// Optimistic apply + queue while no connection exists.
    async fn queue_offline(&mut self, op: EditOp) {
        let mut buffer = self.shared.buffer.write().await;
        apply(&mut buffer, &op);
        drop(buffer);
        self.pending.push_back(op);
    }

    /// Submit the next pending edit if nothing is in flight.
    async fn flush_next<S>(&mut self, ws_sender: &mut S)
    where
        S: SinkExt<Message> + Unpin,
    {
        if self.in_flight {
            return;
        }
        if let Some(head) = self.pending.front() {
            let frame = WireMessage::edit_submit(head, self.last_seen);
            if self.send_frame(ws_sender, &frame).await.is_ok() {
                self.in_flight = true;
            }
        }
    }

    async fn handle_frame<S>(&mut self, msg: WireMessage, ws_sender: &mut S) -> Result<(), ()>
    where
        S: SinkExt<Message> + Unpin,
    {
        match msg {
            WireMessage::SessionInfo { session_id, sequence } => {
                let resumed_same_session =
                    *self.shared.session_id.read().await == Some(session_id);
                *self.shared.session_id.write().await = Some(session_id);

                if !self.initialized {
                    // First connect: seed the shadow buffer from the
                    // authoritative document store.
                    self.initialized = true;
                    match self.snapshots.snapshot(&self.config.resource) {
                        Ok(snapshot) => {
                            self.set_buffer(snapshot.content, snapshot.sequence).await;
                        }
                        Err(err) => {
                            log::debug!("no snapshot for new resource: {err}");
                            self.set_buffer(String::new(), sequence).await;
                        }
                    }
                    self.emit(SyncEvent::Connected { session_id }).await;
                } else if resumed_same_session && sequence == self.last_seen {
                    self.emit(SyncEvent::Resumed { session_id }).await;
                } else {
                    // Missed operations while away (or the session was
                    // rebuilt): local history is unusable, resync.
                    self.resync().await;
                    self.emit(SyncEvent::Resumed { session_id }).await;
                }
                self.flush_next(ws_sender).await;
            }

            WireMessage::UserJoined { user_id, username, color } => {
                self.emit(SyncEvent::ParticipantJoined(ParticipantInfo {
                    user_id,
                    username,
                    color,
                }))
                .await;
            }
            WireMessage::UserResumed { user_id, username, color } => {
                self.emit(SyncEvent::ParticipantResumed(ParticipantInfo {
                    user_id,
                    username,
                    color,
                }))
                .await;
            }
            WireMessage::UserLeft { user_id } => {
                self.emit(SyncEvent::ParticipantLeft { user_id }).await;
            }

            WireMessage::Edit {
                operation,
                position,
                content,
                length,
                sequence_number,
                user_id,
                ..
            } => {
                let (Some(sequence), Some(author)) = (sequence_number, user_id) else {
                    log::warn!("server edit frame missing sequence/author");
                    return Ok(());
                };
                let op = EditOp {
                    kind: operation,
                    position,
                    content,
                    length,
                };

                if author == self.config.identity.user_id {
                    // Echo of our own op: acknowledgment only, never
                    // re-applied.
                    self.last_seen = sequence;
                    *self.shared.sequence.write().await = sequence;
                    self.pending.pop_front();
                    self.in_flight = false;
                    self.emit(SyncEvent::EditAcknowledged { sequence }).await;
                    self.flush_next(ws_sender).await;
                } else {
                    let applied = {
                        let mut buffer = self.shared.buffer.write().await;
                        incorporate_remote(
                            &mut self.pending,
                            &mut buffer,
                            op,
                            &author,
                            &self.config.identity.user_id,
                        )
                    };
                    self.last_seen = sequence;
                    *self.shared.sequence.write().await = sequence;
                    self.emit(SyncEvent::RemoteEdit {
                        sequence,
                        author,
                        op: applied,
                    })
                    .await;
                }
            }

            WireMessage::Cursor {
                user_id,
                position,
                line,
                column,
                color,
                timestamp,
            } => {
                self.emit(SyncEvent::CursorMoved(CursorPos {
                    user_id,
                    position,
                    line,
                    column,
                    color,
                    timestamp,
                }))
                .await;
            }

            WireMessage::Comment { action, comment, .. } => {
                self.emit(SyncEvent::CommentEvent { action, comment }).await;
            }

            WireMessage::Ping => {
                let _ = self.send_frame(ws_sender, &WireMessage::Pong).await;
            }
            WireMessage::Pong => {}

            WireMessage::Error { error, detail } => match error {
                ErrorReason::StaleBase => {
                    self.resync().await;
                    self.flush_next(ws_sender).await;
                }
                reason => {
                    self.emit(SyncEvent::ServerError {
                        reason,
                        detail,
                    })
                    .await;
                }
            },
        }
        Ok(())
    }

    /// Drop uncommitted local state and rebuild from the authoritative
    /// snapshot.
    async fn resync(&mut self) {
        self.pending.clear();
        self.in_flight = false;
        match self.snapshots.snapshot(&self.config.resource) {
            Ok(snapshot) => {
                let sequence = snapshot.sequence;
                self.set_buffer(snapshot.content, sequence).await;
                self.emit(SyncEvent::Resynced { sequence }).await;
            }
            Err(err) => {
                log::error!("resync failed, no snapshot available: {err}");
                self.emit(SyncEvent::ServerError {
                    reason: ErrorReason::StaleBase,
                    detail: format!("resync failed: {err}"),
                })
                .await;
            }
        }
    }

    async fn set_buffer(&mut self, content: String, sequence: u64) {
        *self.shared.buffer.write().await = content;
        self.last_seen = sequence;
        *self.shared.sequence.write().await = sequence;
    }

    async fn send_frame<S>(&self, ws_sender: &mut S, frame: &WireMessage) -> Result<(), ()>
    where
        S: SinkExt<Message> + Unpin,
    {
        let text = frame.encode().map_err(|_| ())?;
        ws_sender.send(Message::Text(text.into())).await.map_err(|_| ())
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.shared.state.write().await = state;
    }

    async fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

/// Bridge a remote sequenced operation over the local pending edits:
/// the remote op is transformed against each pending edit before being
/// applied, and each pending edit is rebased against the remote so later
/// remotes (and the server's own transform of the pending edit) line up.
/// Returns the operation as applied to the buffer.
fn incorporate_remote(
    pending: &mut VecDeque<EditOp>,
    buffer: &mut String,
    remote: EditOp,
    remote_author: &str,
    self_id: &str,
) -> EditOp {
    let mut remote_now = remote;
    for local in pending.iter_mut() {
        let local_before = local.clone();
        *local = transform(local, self_id, &remote_now, remote_author);
        remote_now = transform(&remote_now, remote_author, &local_before, self_id);
    }
    apply(buffer, &remote_now);
    remote_now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpKind;

    #[test]
    fn test_backoff_is_exponential_capped_and_jittered() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut previous_raw = Duration::ZERO;
        for attempt in 0..10 {
            let raw = Duration::from_secs(1)
                .saturating_mul(1 << attempt)
                .min(Duration::from_secs(30));
            let delay = backoff.next_delay();
            // Equal-jitter bounds: [raw/2, raw], never past the cap.
            assert!(delay >= raw / 2, "attempt {attempt}: {delay:?} < {:?}", raw / 2);
            assert!(delay <= Duration::from_secs(30));
            assert!(raw >= previous_raw);
            previous_raw = raw;
        }
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempt(), 5);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= Duration::from_secs(1));
    }

    #[test]
    fn test_incorporate_remote_without_pending() {
        let mut pending = VecDeque::new();
        let mut buffer = String::from("menu");
        let applied = incorporate_remote(
            &mut pending,
            &mut buffer,
            EditOp::insert(4, "!"),
            "remote",
            "me",
        );
        assert_eq!(buffer, "menu!");
        assert_eq!(applied.position, 4);
    }

    #[test]
    fn test_incorporate_remote_bridges_over_pending_insert() {
        // Base "lloXY" scenario: we authored ins@0 "he" (pending), the
        // remote (sequenced first) deleted 2 chars at 3 of the base.
        let mut buffer = String::from("hello"); // base "llo??"... keep it concrete:
        buffer.clear();
        buffer.push_str("heabcdef"); // base "abcdef" + our pending ins@0 "he"
        let mut pending = VecDeque::from([EditOp::insert(0, "he")]);

        let applied = incorporate_remote(
            &mut pending,
            &mut buffer,
            EditOp::delete(1, 2), // remote deleted "bc" from the base
            "remote",
            "me",
        );
        // The delete must shift past our pending insert.
        assert_eq!(applied, EditOp::delete(3, 2));
        assert_eq!(buffer, "headef");
        // Our pending insert is unaffected by a later-positioned delete.
        assert_eq!(pending[0], EditOp::insert(0, "he"));
    }

    #[test]
    fn test_incorporate_remote_rebases_pending() {
        // Base "abc": remote inserts "ZZ" at 0; our pending insert was at
        // position 1 of the base. After bridging, the pending op must sit
        // at position 3 so its eventual server transform matches.
        let mut buffer = String::from("aXbc"); // base + our pending ins@1 "X"
        let mut pending = VecDeque::from([EditOp::insert(1, "X")]);

        incorporate_remote(
            &mut pending,
            &mut buffer,
            EditOp::insert(0, "ZZ"),
            "remote",
            "me",
        );
        assert_eq!(buffer, "ZZaXbc");
        assert_eq!(pending[0], EditOp::insert(3, "X"));
    }

    #[test]
    fn test_incorporate_matches_server_transform_order() {
        // Convergence check for the client bridge: my buffer (local op
        // applied early + bridged remote) must equal the canonical
        // sequenced stream (remote first, my op transformed after).
        let base = "abcdefg";
        let mine = EditOp::insert(3, "XY");
        let remote = EditOp::delete(0, 2);

        // My replica: optimistic apply, then bridge the remote in.
        let mut my_buffer = String::from(base);
        apply(&mut my_buffer, &mine);
        let mut pending = VecDeque::from([mine.clone()]);
        incorporate_remote(&mut pending, &mut my_buffer, remote.clone(), "remote", "me");

        // Canonical stream: remote sequenced first, mine transformed.
        let mut canonical = String::from(base);
        apply(&mut canonical, &remote);
        apply(&mut canonical, &transform(&mine, "me", &remote, "remote"));

        assert_eq!(my_buffer, canonical);
        // And the rebased pending op equals what the server will produce.
        assert_eq!(pending[0], transform(&mine, "me", &remote, "remote"));
    }

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::new(
            "ws://127.0.0.1:9090",
            ResourceKey::new(crate::protocol::ResourceKind::Theme, "t-1"),
            Identity::new("u-1", "Rosa"),
        );
        assert_eq!(config.ping_interval, Duration::from_secs(15));
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert_eq!(config.backoff_cap, Duration::from_secs(30));
        assert!(config.token.is_none());
    }

    #[test]
    fn test_pending_queue_discipline() {
        // The in-flight head stays queued until its echo; a remote delete
        // overlapping a pending delete shrinks it rather than dropping it.
        let mut buffer = String::from("abgh"); // base "abcdefgh" + pending del(2,4)
        let mut pending = VecDeque::from([EditOp::delete(2, 4)]);
        let applied = incorporate_remote(
            &mut pending,
            &mut buffer,
            EditOp::delete(4, 2), // remote deleted "ef" from the base
            "remote",
            "me",
        );
        // Entirely inside our already-applied delete: nothing to re-apply.
        assert_eq!(applied.kind, OpKind::Delete);
        assert_eq!(applied.length, 0);
        assert_eq!(buffer, "abgh");
        assert_eq!(pending[0], EditOp::delete(2, 2));
    }
}
