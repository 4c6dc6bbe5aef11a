//! WebSocket front end for session actors.
//!
//! One task per connection. The task authenticates the upgrade request,
//! resolves the target session from the request path
//! (`/collab/{component|theme}/{resource_id}`), then pumps frames both
//! ways: inbound text frames become [`SessionCommand`]s, and the
//! participant's outbound queue drains back over the socket. The task owns
//! no session state, so a malformed frame or a dead socket affects exactly
//! this participant.

use crate::protocol::{ErrorReason, Identity, ResourceKey, ResourceKind, WireMessage};
use crate::session::{JoinAck, SessionCommand, SessionConfig, SessionRegistry};
use crate::comments::{CommentStore, CommentStoreConfig};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Per-session timers and limits.
    pub session: SessionConfig,
    /// Comment gateway persistence.
    pub comments: CommentStoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            session: SessionConfig::default(),
            comments: CommentStoreConfig::default(),
        }
    }
}

/// Server-wide counters.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_connections: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("comment store failed to open: {0}")]
    Comments(#[from] crate::comments::CommentError),
}

// ─── Authentication seam ─────────────────────────────────────────

/// Connection refused by the [`Authenticator`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("not authorized: {0}")]
pub struct AuthError(pub String);

/// Maps an upgrade request to an authenticated identity.
///
/// The platform's real implementation validates the `token` query
/// parameter against its auth service; the synchronizer only needs the
/// resulting identity.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &ConnectRequest) -> Result<Identity, AuthError>;
}

/// Development/test authenticator: trusts the `user`/`name` parameters.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, request: &ConnectRequest) -> Result<Identity, AuthError> {
        let user_id = request
            .user
            .clone()
            .unwrap_or_else(|| format!("anon-{}", &Uuid::new_v4().to_string()[..8]));
        let username = request.name.clone().unwrap_or_else(|| user_id.clone());
        Ok(Identity::new(user_id, username))
    }
}

// ─── Connect request parsing ─────────────────────────────────────

/// Parsed upgrade-request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub resource: ResourceKey,
    /// Session id from a previous `session_info`, when resuming.
    pub session: Option<Uuid>,
    pub user: Option<String>,
    pub name: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectParseError {
    #[error("path must be /collab/{{component|theme}}/{{resource_id}}")]
    BadPath,

    #[error("unknown resource kind {0:?}")]
    BadKind(String),
}

impl ConnectRequest {
    /// Parse a request target like
    /// `/collab/theme/t-1?user=u-1&name=Rosa&session=<uuid>`.
    pub fn parse(target: &str) -> Result<Self, ConnectParseError> {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (target, None),
        };

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (kind, id) = match segments.as_slice() {
            ["collab", kind, id] => (*kind, *id),
            _ => return Err(ConnectParseError::BadPath),
        };
        let kind = ResourceKind::from_segment(kind)
            .ok_or_else(|| ConnectParseError::BadKind(kind.to_string()))?;

        let mut request = Self {
            resource: ResourceKey::new(kind, id),
            session: None,
            user: None,
            name: None,
            token: None,
        };
        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "session" => request.session = Uuid::parse_str(value).ok(),
                "user" => request.user = Some(value.to_string()),
                "name" => request.name = Some(value.to_string()),
                "token" => request.token = Some(value.to_string()),
                _ => {}
            }
        }
        Ok(request)
    }
}

// ─── Server ──────────────────────────────────────────────────────

pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        Self::with_authenticator(config, Arc::new(AllowAll))
    }

    pub fn with_authenticator(
        config: ServerConfig,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Self, ServerError> {
        let comments = Arc::new(CommentStore::open(&config.comments)?);
        let registry = SessionRegistry::new(config.session.clone(), comments);
        Ok(Self {
            config,
            registry,
            auth,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("tcp connection from {addr}");

            let registry = self.registry.clone();
            let auth = self.auth.clone();
            let stats = self.stats.clone();
            let outbound_capacity = self.config.session.outbound_capacity;

            tokio::spawn(async move {
                {
                    let mut s = stats.write().await;
                    s.total_connections += 1;
                    s.active_connections += 1;
                }
                if let Err(err) =
                    handle_connection(stream, addr, registry, auth, stats.clone(), outbound_capacity)
                        .await
                {
                    log::debug!("connection {addr} ended: {err}");
                }
                stats.write().await.active_connections -= 1;
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    auth: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
    outbound_capacity: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Capture the request target during the upgrade handshake.
    let mut target: Option<String> = None;
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        target = Some(req.uri().to_string());
        Ok(resp)
    })
    .await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let target = target.unwrap_or_default();
    let request = match ConnectRequest::parse(&target) {
        Ok(request) => request,
        Err(err) => {
            let frame = WireMessage::error(ErrorReason::MalformedMessage, err.to_string());
            let _ = ws_sender.send(Message::Text(frame.encode()?.into())).await;
            let _ = ws_sender.close().await;
            return Ok(());
        }
    };

    let identity = match auth.authenticate(&request) {
        Ok(identity) => identity,
        Err(err) => {
            stats.write().await.rejected_connections += 1;
            log::warn!("rejected connection from {addr}: {err}");
            let frame = WireMessage::error(ErrorReason::NotAuthorized, err.to_string());
            let _ = ws_sender.send(Message::Text(frame.encode()?.into())).await;
            let _ = ws_sender.close().await;
            return Ok(());
        }
    };

    // Join the session, retrying once if we raced its idle teardown.
    let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(outbound_capacity);
    let mut joined: Option<(crate::session::SessionHandle, JoinAck)> = None;
    for _ in 0..2 {
        let handle = registry.get_or_create(&request.resource).await;
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = handle
            .send(SessionCommand::Join {
                identity: identity.clone(),
                connection: out_tx.clone(),
                reply: reply_tx,
            })
            .await;
        if sent.is_ok() {
            if let Ok(ack) = reply_rx.await {
                joined = Some((handle, ack));
                break;
            }
        }
    }
    let Some((session, _ack)) = joined else {
        log::error!("could not join session for {} from {addr}", request.resource);
        return Ok(());
    };

    log::info!(
        "{} ({}) connected to {} from {addr}",
        identity.username,
        identity.user_id,
        request.resource
    );

    let user_id = identity.user_id.clone();
    let mut clean_close = false;

    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    stats.write().await.total_messages += 1;
                    match WireMessage::decode(text.as_ref()) {
                        Ok(msg) => {
                            if let Some(reply) =
                                route_inbound(&session, &user_id, msg).await
                            {
                                ws_sender
                                    .send(Message::Text(reply.encode()?.into()))
                                    .await?;
                            }
                        }
                        Err(err) => {
                            // Reject to this participant only; the session
                            // never hears about it.
                            log::debug!("malformed frame from {user_id}: {err}");
                            let frame = WireMessage::error(
                                ErrorReason::MalformedMessage,
                                err.to_string(),
                            );
                            ws_sender.send(Message::Text(frame.encode()?.into())).await?;
                        }
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    ws_sender.send(Message::Pong(payload)).await?;
                    let _ = session
                        .send(SessionCommand::Heartbeat { user_id: user_id.clone() })
                        .await;
                }
                Some(Ok(Message::Close(_))) => {
                    clean_close = true;
                    break;
                }
                None => break,
                Some(Err(err)) => {
                    log::debug!("socket error from {addr}: {err}");
                    break;
                }
                _ => {}
            },

            outbound = out_rx.recv() => match outbound {
                Some(msg) => {
                    ws_sender.send(Message::Text(msg.encode()?.into())).await?;
                }
                // The session replaced this connection (reconnect won) or
                // was destroyed; either way this socket is done.
                None => break,
            }
        }
    }

    if clean_close {
        let _ = session
            .send(SessionCommand::Leave {
                user_id: user_id.clone(),
                connection: out_tx.clone(),
            })
            .await;
    } else {
        // Abrupt drop: keep the participant through the grace window so a
        // quick reconnect resumes instead of rejoining.
        let _ = session
            .send(SessionCommand::Disconnected {
                user_id: user_id.clone(),
                connection: out_tx.clone(),
            })
            .await;
    }
    log::info!("{user_id} disconnected from {addr} (clean: {clean_close})");
    Ok(())
}

/// Translate an inbound frame into a session command. Returns a frame to
/// send straight back to the sender, if any.
async fn route_inbound(
    session: &crate::session::SessionHandle,
    user_id: &str,
    msg: WireMessage,
) -> Option<WireMessage> {
    match msg {
        WireMessage::Edit {
            operation,
            position,
            content,
            length,
            base_sequence,
            ..
        } => {
            let Some(base_sequence) = base_sequence else {
                return Some(WireMessage::error(
                    ErrorReason::MalformedMessage,
                    "edit without base_sequence",
                ));
            };
            let op = crate::protocol::EditOp {
                kind: operation,
                position,
                content,
                length,
            };
            let _ = session
                .send(SessionCommand::Edit {
                    user_id: user_id.to_string(),
                    op,
                    base_sequence,
                })
                .await;
            None
        }

        WireMessage::Cursor {
            position,
            line,
            column,
            color,
            timestamp,
            ..
        } => {
            let cursor = crate::protocol::CursorPos {
                user_id: user_id.to_string(),
                position,
                line,
                column,
                color,
                timestamp,
            };
            let _ = session
                .send(SessionCommand::Cursor {
                    user_id: user_id.to_string(),
                    cursor,
                })
                .await;
            None
        }

        WireMessage::Comment {
            action,
            comment,
            parent_id,
            emoji,
        } => {
            let _ = session
                .send(SessionCommand::Comment {
                    user_id: user_id.to_string(),
                    action,
                    comment,
                    parent_id,
                    emoji,
                })
                .await;
            None
        }

        WireMessage::Ping => {
            let _ = session
                .send(SessionCommand::Heartbeat {
                    user_id: user_id.to_string(),
                })
                .await;
            Some(WireMessage::Pong)
        }

        WireMessage::Pong => {
            let _ = session
                .send(SessionCommand::Heartbeat {
                    user_id: user_id.to_string(),
                })
                .await;
            None
        }

        // Server→client frame types have no business arriving inbound.
        other => {
            log::debug!("unexpected inbound frame from {user_id}: {other:?}");
            Some(WireMessage::error(
                ErrorReason::MalformedMessage,
                "unexpected message type",
            ))
        }
    }
}
