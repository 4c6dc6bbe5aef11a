//! Per-session coordinator actor.
//!
//! Every live session is one tokio task that exclusively owns that
//! session's presence registry, operation sequencer, and cursor table.
//! Connection tasks never touch session state directly: they send
//! [`SessionCommand`]s down the actor's channel and receive fan-out frames
//! on their own outbound queue. That single serialized path is what makes
//! the sequencer's convergence guarantee straightforward: there is no
//! interleaving to reason about and no locks to take.
//!
//! Lifecycle: `Empty → Active → Draining → Destroyed`, where Draining
//! starts the idle-destroy timer and a join before it fires goes back to
//! Active. Different sessions run fully in parallel; the comment gateway
//! is the only state shared between them.

use crate::comments::{CommentError, CommentStore, Resolution};
use crate::cursors::CursorTable;
use crate::presence::{JoinOutcome, PresenceRegistry};
use crate::protocol::{
    now_millis, Comment, CommentAction, CursorPos, EditOp, ErrorReason, Identity, ResourceKey,
    WireMessage,
};
use crate::sequencer::{Sequencer, SubmitError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use uuid::Uuid;

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Evict a participant whose last heartbeat is older than this
    /// (3× the expected client ping interval).
    pub heartbeat_timeout: Duration,
    /// How often the eviction sweep runs.
    pub sweep_interval: Duration,
    /// Cursors untouched for this long disappear without a removal message.
    pub cursor_staleness: Duration,
    /// How often stale cursors are purged.
    pub cursor_purge_interval: Duration,
    /// Destroy a session this long after its last participant left.
    pub idle_destroy_after: Duration,
    /// Operations retained for transforming late submissions.
    pub history_window: usize,
    /// Outbound frame queue depth per participant.
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(45),
            sweep_interval: Duration::from_secs(5),
            cursor_staleness: Duration::from_secs(60),
            cursor_purge_interval: Duration::from_secs(10),
            idle_destroy_after: Duration::from_secs(300),
            history_window: crate::sequencer::DEFAULT_HISTORY_WINDOW,
            outbound_capacity: 256,
        }
    }
}

impl SessionConfig {
    /// Short timers for integration tests.
    pub fn for_testing() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(150),
            sweep_interval: Duration::from_millis(25),
            cursor_staleness: Duration::from_millis(200),
            cursor_purge_interval: Duration::from_millis(25),
            idle_destroy_after: Duration::from_millis(200),
            history_window: 32,
            outbound_capacity: 64,
        }
    }
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Empty,
    Active,
    Draining,
    Destroyed,
}

/// Everything a connection task can ask of its session actor.
pub enum SessionCommand {
    Join {
        identity: Identity,
        connection: mpsc::Sender<WireMessage>,
        reply: oneshot::Sender<JoinAck>,
    },
    /// Explicit leave: the participant is gone immediately. Carries the
    /// closing connection's sender so a replaced (zombie) connection
    /// cannot evict the participant's fresh one.
    Leave {
        user_id: String,
        connection: mpsc::Sender<WireMessage>,
    },
    /// The socket dropped without a leave; keep the entry through the
    /// grace window so a reconnect resumes instead of rejoining.
    Disconnected {
        user_id: String,
        connection: mpsc::Sender<WireMessage>,
    },
    Heartbeat { user_id: String },
    Edit {
        user_id: String,
        op: EditOp,
        base_sequence: u64,
    },
    Cursor { user_id: String, cursor: CursorPos },
    Comment {
        user_id: String,
        action: CommentAction,
        comment: Comment,
        parent_id: Option<Uuid>,
        emoji: Option<String>,
    },
}

/// Reply to a successful join.
#[derive(Debug)]
pub struct JoinAck {
    pub session_id: Uuid,
    pub sequence: u64,
}

/// Cheap cloneable address of a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub resource: ResourceKey,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Send a command; fails only if the session was destroyed.
    pub async fn send(&self, cmd: SessionCommand) -> Result<(), SessionClosed> {
        self.tx.send(cmd).await.map_err(|_| SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// The target session has been torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session is closed")]
pub struct SessionClosed;

// ─── Coordinator actor ───────────────────────────────────────────

struct SessionCoordinator {
    session_id: Uuid,
    resource: ResourceKey,
    config: SessionConfig,
    state: Lifecycle,
    presence: PresenceRegistry,
    sequencer: Sequencer,
    cursors: CursorTable,
    comments: Arc<CommentStore>,
    created_at: Instant,
    last_activity: Instant,
}

impl SessionCoordinator {
    fn new(resource: ResourceKey, config: SessionConfig, comments: Arc<CommentStore>) -> Self {
        let now = Instant::now();
        Self {
            session_id: Uuid::new_v4(),
            resource,
            presence: PresenceRegistry::new(config.heartbeat_timeout),
            sequencer: Sequencer::new(config.history_window),
            cursors: CursorTable::new(config.cursor_staleness),
            comments,
            config,
            state: Lifecycle::Empty,
            created_at: now,
            last_activity: now,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>, registry: Arc<SessionRegistry>) {
        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut purge = interval(self.config.cursor_purge_interval);
        purge.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // Armed only while Draining; parked far in the future otherwise.
        let idle = tokio::time::sleep(Duration::from_secs(86_400));
        tokio::pin!(idle);

        log::info!("session {} created for {}", self.session_id, self.resource);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        self.last_activity = Instant::now();
                        self.handle(cmd).await;
                    }
                    None => break,
                },
                _ = sweep.tick() => self.sweep_heartbeats(),
                _ = purge.tick() => self.purge_cursors(),
                _ = &mut idle, if self.state == Lifecycle::Draining => {
                    log::info!(
                        "session {} idle for {:?}, destroying",
                        self.session_id,
                        self.config.idle_destroy_after
                    );
                    break;
                }
            }

            // Lifecycle bookkeeping after every event. Empty covers the
            // created-but-never-joined case so it cannot linger forever.
            if self.presence.is_empty() {
                if self.state != Lifecycle::Draining {
                    self.state = Lifecycle::Draining;
                    idle.as_mut()
                        .reset(Instant::now() + self.config.idle_destroy_after);
                    log::debug!("session {} draining", self.session_id);
                }
            } else if self.state != Lifecycle::Active {
                self.state = Lifecycle::Active;
            }
        }

        self.state = Lifecycle::Destroyed;
        registry.remove(&self.resource, self.session_id).await;
        log::info!(
            "session {} destroyed after {:?} (idle {:?})",
            self.session_id,
            self.created_at.elapsed(),
            self.last_activity.elapsed()
        );
    }

    async fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Join {
                identity,
                connection,
                reply,
            } => self.handle_join(identity, connection, reply).await,
            SessionCommand::Leave {
                user_id,
                connection,
            } => {
                if self.connection_is_current(&user_id, &connection) {
                    self.handle_leave(&user_id);
                }
            }
            SessionCommand::Disconnected {
                user_id,
                connection,
            } => {
                if self.connection_is_current(&user_id, &connection) {
                    self.presence.mark_disconnected(&user_id);
                }
            }
            SessionCommand::Heartbeat { user_id } => {
                self.presence.heartbeat(&user_id);
            }
            SessionCommand::Edit {
                user_id,
                op,
                base_sequence,
            } => self.handle_edit(&user_id, op, base_sequence),
            SessionCommand::Cursor { user_id, cursor } => self.handle_cursor(&user_id, cursor),
            SessionCommand::Comment {
                user_id,
                action,
                comment,
                parent_id,
                emoji,
            } => {
                self.handle_comment(&user_id, action, comment, parent_id, emoji)
                    .await
            }
        }
    }

    async fn handle_join(
        &mut self,
        identity: Identity,
        connection: mpsc::Sender<WireMessage>,
        reply: oneshot::Sender<JoinAck>,
    ) {
        let (outcome, info) = self.presence.join(&identity, connection.clone());

        // Replay current state to the joining participant before anyone
        // else can race new frames onto its queue.
        let snapshot_err = async {
            connection
                .send(WireMessage::SessionInfo {
                    session_id: self.session_id,
                    sequence: self.sequencer.current_sequence(),
                })
                .await?;
            for other in self.presence.list_active() {
                if other.user_id != identity.user_id {
                    connection
                        .send(WireMessage::UserJoined {
                            user_id: other.user_id,
                            username: other.username,
                            color: other.color,
                        })
                        .await?;
                }
            }
            for cursor in self.cursors.snapshot() {
                connection.send(WireMessage::cursor(&cursor)).await?;
            }
            for thread in self.comments.unresolved(&self.resource).await {
                connection
                    .send(WireMessage::Comment {
                        action: CommentAction::Create,
                        comment: thread,
                        parent_id: None,
                        emoji: None,
                    })
                    .await?;
            }
            Ok::<(), mpsc::error::SendError<WireMessage>>(())
        }
        .await;
        if snapshot_err.is_err() {
            // The connection died mid-replay; the sweep will clean up.
            log::debug!("join replay aborted for {}", identity.user_id);
        }

        match outcome {
            JoinOutcome::Joined => {
                log::info!(
                    "{} ({}) joined session {}",
                    identity.username,
                    identity.user_id,
                    self.session_id
                );
                self.fan_out(
                    &WireMessage::UserJoined {
                        user_id: info.user_id,
                        username: info.username,
                        color: info.color,
                    },
                    Some(&identity.user_id),
                );
            }
            JoinOutcome::Resumed => {
                log::info!("{} resumed session {}", identity.user_id, self.session_id);
                self.fan_out(
                    &WireMessage::UserResumed {
                        user_id: info.user_id,
                        username: info.username,
                        color: info.color,
                    },
                    Some(&identity.user_id),
                );
            }
            // Rapid reconnect before the old connection was ever marked
            // gone: handle swap only, nothing to announce.
            JoinOutcome::Replaced => {}
        }

        let _ = reply.send(JoinAck {
            session_id: self.session_id,
            sequence: self.sequencer.current_sequence(),
        });
    }

    /// True when the given sender is still the participant's registered
    /// connection. A reconnect replaces the handle, so close notifications
    /// from the superseded socket must be ignored.
    fn connection_is_current(&self, user_id: &str, connection: &mpsc::Sender<WireMessage>) -> bool {
        self.presence
            .get(user_id)
            .map(|p| p.connection.same_channel(connection))
            .unwrap_or(false)
    }

    fn handle_leave(&mut self, user_id: &str) {
        if let Some(info) = self.presence.leave(user_id) {
            self.cursors.remove(user_id);
            self.fan_out(
                &WireMessage::UserLeft {
                    user_id: info.user_id,
                },
                Some(user_id),
            );
            log::info!("{user_id} left session {}", self.session_id);
        }
    }

    fn handle_edit(&mut self, user_id: &str, op: EditOp, base_sequence: u64) {
        if !self.presence.contains(user_id) {
            log::warn!("edit from unknown participant {user_id}, dropping");
            return;
        }
        match self
            .sequencer
            .submit(user_id, base_sequence, op, now_millis())
        {
            Ok(accepted) => {
                // Everyone gets the sequenced op, the author included: its
                // echo is the acknowledgment that carries the assigned
                // sequence number, and the author skips re-applying it.
                self.fan_out(
                    &WireMessage::edit_accepted(&accepted.op, accepted.sequence, &accepted.author),
                    None,
                );
            }
            Err(SubmitError::StaleBase(stale)) => {
                self.send_to(
                    user_id,
                    WireMessage::error(ErrorReason::StaleBase, stale.to_string()),
                );
            }
            Err(err @ SubmitError::FutureBase { .. }) => {
                self.send_to(
                    user_id,
                    WireMessage::error(ErrorReason::MalformedMessage, err.to_string()),
                );
            }
        }
    }

    fn handle_cursor(&mut self, user_id: &str, mut cursor: CursorPos) {
        let Some(participant) = self.presence.get(user_id) else {
            return;
        };
        // The session, not the client, is authoritative for identity and
        // color on fan-out.
        cursor.user_id = user_id.to_string();
        cursor.color = participant.color.clone();
        if self.cursors.update(cursor.clone()) {
            self.fan_out(&WireMessage::cursor(&cursor), Some(user_id));
        }
    }

    async fn handle_comment(
        &mut self,
        user_id: &str,
        action: CommentAction,
        comment: Comment,
        parent_id: Option<Uuid>,
        emoji: Option<String>,
    ) {
        let result: Result<Option<Comment>, CommentError> = match action {
            CommentAction::Create => {
                let mut comment = comment;
                comment.author_user_id = user_id.to_string();
                self.comments
                    .create(&self.resource, comment)
                    .await
                    .map(Some)
            }
            CommentAction::Reply => match parent_id {
                Some(parent) => {
                    let mut reply = comment;
                    reply.author_user_id = user_id.to_string();
                    self.comments
                        .reply(&self.resource, parent, reply)
                        .await
                        .map(Some)
                }
                None => {
                    self.send_to(
                        user_id,
                        WireMessage::error(ErrorReason::MalformedMessage, "reply without parent_id"),
                    );
                    return;
                }
            },
            CommentAction::Resolve => self
                .comments
                .resolve(&self.resource, comment.id)
                .await
                .map(resolution_to_broadcast),
            CommentAction::Unresolve => self
                .comments
                .unresolve(&self.resource, comment.id)
                .await
                .map(resolution_to_broadcast),
            CommentAction::React => match emoji {
                Some(emoji) => self
                    .comments
                    .react(&self.resource, comment.id, &emoji)
                    .await
                    .map(Some),
                None => {
                    self.send_to(
                        user_id,
                        WireMessage::error(ErrorReason::MalformedMessage, "react without emoji"),
                    );
                    return;
                }
            },
        };

        match result {
            Ok(Some(thread)) => {
                // Comment mutations echo to everyone, author included, so
                // every replica renders the gateway's authoritative thread.
                self.fan_out(
                    &WireMessage::Comment {
                        action,
                        comment: thread,
                        parent_id,
                        emoji: None,
                    },
                    None,
                );
            }
            // Idempotent resolve on an already-resolved comment: no
            // duplicate broadcast.
            Ok(None) => {}
            Err(err) => {
                self.send_to(
                    user_id,
                    WireMessage::error(ErrorReason::MalformedMessage, err.to_string()),
                );
            }
        }
    }

    fn sweep_heartbeats(&mut self) {
        for evicted in self.presence.sweep() {
            self.cursors.remove(&evicted.user_id);
            log::info!(
                "{} timed out of session {}",
                evicted.user_id,
                self.session_id
            );
            self.fan_out(
                &WireMessage::UserLeft {
                    user_id: evicted.user_id,
                },
                None,
            );
        }
    }

    fn purge_cursors(&mut self) {
        for user_id in self.cursors.purge_stale() {
            log::trace!("cursor for {user_id} went stale in {}", self.session_id);
        }
    }

    /// Queue a frame on every active participant's connection, optionally
    /// excluding one user. A full queue drops the frame for that
    /// participant only (it is lagging; edits will resync via stale base).
    fn fan_out(&self, msg: &WireMessage, exclude: Option<&str>) {
        for participant in self.presence.iter() {
            if !participant.is_active {
                continue;
            }
            if exclude == Some(participant.user_id.as_str()) {
                continue;
            }
            if let Err(err) = participant.connection.try_send(msg.clone()) {
                log::warn!(
                    "dropping frame for lagging participant {}: {err}",
                    participant.user_id
                );
            }
        }
    }

    fn send_to(&self, user_id: &str, msg: WireMessage) {
        if let Some(participant) = self.presence.get(user_id) {
            let _ = participant.connection.try_send(msg);
        }
    }
}

fn resolution_to_broadcast(resolution: Resolution) -> Option<Comment> {
    match resolution {
        Resolution::Changed(thread) => Some(thread),
        Resolution::Unchanged => None,
    }
}

// ─── Session registry ────────────────────────────────────────────

/// Maps resources to live session actors, creating them on first join.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ResourceKey, SessionHandle>>,
    comments: Arc<CommentStore>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, comments: Arc<CommentStore>) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            comments,
            config,
        })
    }

    /// Look up the live session for a resource, spawning one if needed.
    pub async fn get_or_create(self: &Arc<Self>, resource: &ResourceKey) -> SessionHandle {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(resource) {
                if !handle.is_closed() {
                    return handle.clone();
                }
            }
        }

        let mut sessions = self.sessions.write().await;
        // Double-check after the write lock; another task may have won.
        if let Some(handle) = sessions.get(resource) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let coordinator =
            SessionCoordinator::new(resource.clone(), self.config.clone(), self.comments.clone());
        let (tx, rx) = mpsc::channel(128);
        let handle = SessionHandle {
            session_id: coordinator.session_id,
            resource: resource.clone(),
            tx,
        };
        sessions.insert(resource.clone(), handle.clone());

        let registry = self.clone();
        tokio::spawn(coordinator.run(rx, registry));
        handle
    }

    pub async fn lookup(&self, resource: &ResourceKey) -> Option<SessionHandle> {
        self.sessions.read().await.get(resource).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Called by a coordinator as it shuts down. Ignores the call if the
    /// resource was already re-registered under a newer session id.
    async fn remove(&self, resource: &ResourceKey, session_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(resource)
            .map(|h| h.session_id == session_id)
            .unwrap_or(false)
        {
            sessions.remove(resource);
        }
    }

    pub fn comments(&self) -> &Arc<CommentStore> {
        &self.comments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResourceKind;
    use tokio::time::timeout;

    fn theme_key() -> ResourceKey {
        ResourceKey::new(ResourceKind::Theme, "t-1")
    }

    /// Default config for these tests: heartbeats effectively disabled so
    /// drain windows and sleeps can't race an eviction sweep.
    fn calm_config() -> SessionConfig {
        SessionConfig {
            heartbeat_timeout: Duration::from_secs(30),
            ..SessionConfig::for_testing()
        }
    }

    fn registry() -> Arc<SessionRegistry> {
        SessionRegistry::new(calm_config(), Arc::new(CommentStore::in_memory()))
    }

    /// Registry with the aggressive eviction timers, for the tests that
    /// exercise the sweep itself.
    fn registry_with_eviction() -> Arc<SessionRegistry> {
        SessionRegistry::new(
            SessionConfig::for_testing(),
            Arc::new(CommentStore::in_memory()),
        )
    }

    async fn join(
        handle: &SessionHandle,
        user: &str,
    ) -> (mpsc::Sender<WireMessage>, mpsc::Receiver<WireMessage>, JoinAck) {
        let (tx, rx) = mpsc::channel(64);
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .send(SessionCommand::Join {
                identity: Identity::new(user, user),
                connection: tx.clone(),
                reply: reply_tx,
            })
            .await
            .unwrap();
        let ack = reply_rx.await.unwrap();
        (tx, rx, ack)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<WireMessage>) -> WireMessage {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
    }

    #[tokio::test]
    async fn test_same_resource_shares_one_session() {
        let registry = registry();
        let a = registry.get_or_create(&theme_key()).await;
        let b = registry.get_or_create(&theme_key()).await;
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_snapshot_replays_state() {
        let registry = registry();
        let handle = registry.get_or_create(&theme_key()).await;

        let (_tx1, _rx1, ack1) = join(&handle, "u-1").await;

        let (_tx2, mut rx2, ack2) = join(&handle, "u-2").await;
        assert_eq!(ack1.session_id, ack2.session_id);

        match next_frame(&mut rx2).await {
            WireMessage::SessionInfo { session_id, sequence } => {
                assert_eq!(session_id, handle.session_id);
                assert_eq!(sequence, 0);
            }
            other => panic!("expected session_info first, got {other:?}"),
        }
        match next_frame(&mut rx2).await {
            WireMessage::UserJoined { user_id, .. } => assert_eq!(user_id, "u-1"),
            other => panic!("expected roster entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_edit_fans_out_with_sequence() {
        let registry = registry();
        let handle = registry.get_or_create(&theme_key()).await;
        let (_tx1, mut rx1, _) = join(&handle, "u-1").await;
        let (_tx2, mut rx2, _) = join(&handle, "u-2").await;

        // Drain u-1's snapshot + the user_joined for u-2.
        while let Ok(Some(_)) = timeout(Duration::from_millis(50), rx1.recv()).await {}
        while let Ok(Some(_)) = timeout(Duration::from_millis(50), rx2.recv()).await {}

        handle
            .send(SessionCommand::Edit {
                user_id: "u-1".into(),
                op: EditOp::insert(0, "hi"),
                base_sequence: 0,
            })
            .await
            .unwrap();

        // Both the other participant and the author receive it.
        for rx in [&mut rx2, &mut rx1] {
            match next_frame(rx).await {
                WireMessage::Edit {
                    sequence_number,
                    user_id,
                    content,
                    ..
                } => {
                    assert_eq!(sequence_number, Some(1));
                    assert_eq!(user_id.as_deref(), Some("u-1"));
                    assert_eq!(content, "hi");
                }
                other => panic!("expected edit frame, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_stale_base_errors_author_only() {
        let registry = registry();
        let handle = registry.get_or_create(&theme_key()).await;
        let (_tx1, mut rx1, _) = join(&handle, "u-1").await;
        let (_tx2, mut rx2, _) = join(&handle, "u-2").await;
        while let Ok(Some(_)) = timeout(Duration::from_millis(50), rx1.recv()).await {}
        while let Ok(Some(_)) = timeout(Duration::from_millis(50), rx2.recv()).await {}

        // Overflow the tiny test history window.
        for i in 0..40u64 {
            handle
                .send(SessionCommand::Edit {
                    user_id: "u-1".into(),
                    op: EditOp::insert(0, "x"),
                    base_sequence: i,
                })
                .await
                .unwrap();
        }
        while let Ok(Some(_)) = timeout(Duration::from_millis(50), rx1.recv()).await {}
        while let Ok(Some(_)) = timeout(Duration::from_millis(50), rx2.recv()).await {}

        handle
            .send(SessionCommand::Edit {
                user_id: "u-2".into(),
                op: EditOp::insert(0, "late"),
                base_sequence: 1,
            })
            .await
            .unwrap();

        match next_frame(&mut rx2).await {
            WireMessage::Error { error, .. } => assert_eq!(error, ErrorReason::StaleBase),
            other => panic!("expected stale_base error, got {other:?}"),
        }
        // The other participant saw nothing.
        assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_rapid_reconnects_emit_single_resume() {
        // Scenario: a user's connection flaps twice inside the grace
        // window; the observer sees one user_resumed and no joined/left.
        let registry = registry();
        let handle = registry.get_or_create(&theme_key()).await;
        let (_obs_tx, mut observer, _) = join(&handle, "observer").await;
        let (tx_a, _rx_a, _) = join(&handle, "flaky").await;
        // observer: snapshot + user_joined for flaky.
        while let Ok(Some(_)) = timeout(Duration::from_millis(50), observer.recv()).await {}

        handle
            .send(SessionCommand::Disconnected {
                user_id: "flaky".into(),
                connection: tx_a.clone(),
            })
            .await
            .unwrap();
        let (_tx_b, _rx_b, _) = join(&handle, "flaky").await; // reconnect #1
        let (_tx_c, _rx_c, _) = join(&handle, "flaky").await; // reconnect #2, still active

        let mut resumed = 0;
        let mut churn = 0;
        while let Ok(Some(frame)) = timeout(Duration::from_millis(100), observer.recv()).await {
            match frame {
                WireMessage::UserResumed { user_id, .. } if user_id == "flaky" => resumed += 1,
                WireMessage::UserJoined { .. } | WireMessage::UserLeft { .. } => churn += 1,
                _ => {}
            }
        }
        assert_eq!(resumed, 1);
        assert_eq!(churn, 0);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_emits_one_user_left() {
        let registry = registry_with_eviction();
        let handle = registry.get_or_create(&theme_key()).await;
        let (_obs_tx, mut observer, _) = join(&handle, "observer").await;
        let (_quiet_tx, _rx, _) = join(&handle, "quiet").await;
        while let Ok(Some(_)) = timeout(Duration::from_millis(50), observer.recv()).await {}

        // Keep the observer alive past the timeout; let "quiet" expire.
        let mut left = 0;
        for _ in 0..20 {
            handle
                .send(SessionCommand::Heartbeat {
                    user_id: "observer".into(),
                })
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(25)).await;
            while let Ok(Some(frame)) =
                timeout(Duration::from_millis(10), observer.recv()).await
            {
                if let WireMessage::UserLeft { user_id } = frame {
                    assert_eq!(user_id, "quiet");
                    left += 1;
                }
            }
        }
        assert_eq!(left, 1);
    }

    #[tokio::test]
    async fn test_idle_session_destroys_and_recreates() {
        let registry = registry();
        let handle = registry.get_or_create(&theme_key()).await;
        let (tx, _rx, _) = join(&handle, "u-1").await;
        handle
            .send(SessionCommand::Leave {
                user_id: "u-1".into(),
                connection: tx.clone(),
            })
            .await
            .unwrap();

        // Wait past the idle-destroy window.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(registry.session_count().await, 0);
        assert!(handle.is_closed());

        // A fresh join builds a brand-new session.
        let next = registry.get_or_create(&theme_key()).await;
        assert_ne!(next.session_id, handle.session_id);
    }

    #[tokio::test]
    async fn test_draining_session_revives_on_join() {
        let registry = registry();
        let handle = registry.get_or_create(&theme_key()).await;
        let (tx, _rx, _) = join(&handle, "u-1").await;
        handle
            .send(SessionCommand::Leave {
                user_id: "u-1".into(),
                connection: tx.clone(),
            })
            .await
            .unwrap();

        // Re-join inside the idle window keeps the same session alive.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_tx2, _rx2, ack) = join(&handle, "u-2").await;
        assert_eq!(ack.session_id, handle.session_id);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_resolve_broadcasts_once() {
        let registry = registry();
        let handle = registry.get_or_create(&theme_key()).await;
        let (_tx1, mut rx1, _) = join(&handle, "u-1").await;
        while let Ok(Some(_)) = timeout(Duration::from_millis(50), rx1.recv()).await {}

        let comment = Comment::new("u-1", "resolved twice?", 0, 0);
        handle
            .send(SessionCommand::Comment {
                user_id: "u-1".into(),
                action: CommentAction::Create,
                comment: comment.clone(),
                parent_id: None,
                emoji: None,
            })
            .await
            .unwrap();
        let _create_echo = next_frame(&mut rx1).await;

        for _ in 0..2 {
            handle
                .send(SessionCommand::Comment {
                    user_id: "u-1".into(),
                    action: CommentAction::Resolve,
                    comment: comment.clone(),
                    parent_id: None,
                    emoji: None,
                })
                .await
                .unwrap();
        }

        let first = next_frame(&mut rx1).await;
        match first {
            WireMessage::Comment { action, comment, .. } => {
                assert_eq!(action, CommentAction::Resolve);
                assert!(comment.resolved);
            }
            other => panic!("expected resolve broadcast, got {other:?}"),
        }
        // No second broadcast for the idempotent repeat.
        assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_err());
    }
}
