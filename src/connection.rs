//! The WebSocket connection manager.
//!
//! One background task exclusively owns the socket and all transport
//! state: the listener registry, the subscription table, and the
//! time-travel buffer. Handles:
//!
//! - A single multiplexed connection for all subscriptions
//! - Decoding inbound frames and dispatching by topic to all matching
//!   listeners
//! - Automatic reconnection on a fixed delay, with unbounded retries
//! - Re-subscription of all enabled patterns after reconnect
//! - The identity-token auth frame, re-sent on every reconnect
//!
//! The public [`Connection`] handle sends commands to the task; commands
//! that can fail carry a oneshot so registry misuse errors reach the
//! caller synchronously.

use crate::envelope::{EnvelopeCodec, RawMessage, SubscriptionAction};
use crate::error::{RobofleetLinkError, Result};
use crate::event_handlers::{ConnectionError, DisconnectReason, EventHandlers};
use crate::listeners::{ListenerId, ListenerRegistry, RawCallback, TopicCallback};
use crate::options::ConnectionOptions;
use crate::subscriptions::{SubscriptionInfo, SubscriptionTable, WireAction};
use crate::time_travel::TimeTravelBuffer;
use crate::topics::{TopicMatch, TopicPattern};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the command channel between the handle and the task.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Identity token carried in the auth frame.
#[derive(Debug, Clone)]
pub(crate) enum AuthToken {
    /// No token configured; no auth frame is sent.
    Unset,
    /// Send `{"id_token": "<token>"}` after every connect.
    Token(String),
    /// Explicitly de-authenticated; send `{"id_token": null}`.
    Cleared,
}

impl AuthToken {
    fn frame(&self) -> Option<String> {
        match self {
            AuthToken::Unset => None,
            AuthToken::Token(token) => {
                Some(serde_json::json!({ "id_token": token }).to_string())
            }
            AuthToken::Cleared => Some(serde_json::json!({ "id_token": null }).to_string()),
        }
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

/// Commands sent from the public API to the background connection task.
enum ConnCmd {
    /// Register a topic listener, acquiring a subscription for its pattern.
    AddTopicListener {
        pattern: TopicPattern,
        callback: TopicCallback,
        result_tx: oneshot::Sender<ListenerId>,
    },
    /// Register a listener for every decoded frame.
    AddRawListener {
        callback: RawCallback,
        result_tx: oneshot::Sender<ListenerId>,
    },
    /// Remove a listener, releasing its subscription refcount.
    /// `result_tx` is `None` for fire-and-forget removal from `Drop`.
    RemoveListener {
        id: ListenerId,
        result_tx: Option<oneshot::Sender<Result<()>>>,
    },
    /// Toggle dispatch to one listener.
    SetListenerEnabled {
        id: ListenerId,
        enabled: bool,
        result_tx: oneshot::Sender<Result<()>>,
    },
    /// Acquire a subscription entry without a listener.
    AcquireSubscription {
        source: String,
        result_tx: oneshot::Sender<()>,
    },
    /// Release a subscription entry. `result_tx` is `None` from `Drop`.
    ReleaseSubscription {
        source: String,
        result_tx: Option<oneshot::Sender<()>>,
    },
    /// Enable/disable a subscription entry, keeping its refcount.
    SetSubscriptionEnabled {
        source: String,
        enabled: bool,
        result_tx: oneshot::Sender<Result<()>>,
    },
    /// Send an application frame. Resolves `false` when not connected.
    Send {
        frame: Bytes,
        result_tx: oneshot::Sender<bool>,
    },
    /// Inject a frame through the normal decode + dispatch path.
    Dispatch { frame: Bytes },
    /// Re-dispatch a recorded frame from the time-travel buffer.
    Replay { steps_back: usize },
    /// Update the identity token; sends the auth frame immediately when
    /// connected and on every reconnect after.
    SetIdToken { token: Option<String> },
    /// Snapshot the subscription table.
    Subscriptions {
        result_tx: oneshot::Sender<Vec<SubscriptionInfo>>,
    },
    /// Gracefully shut down the connection.
    Shutdown,
}

// ── Connection (public handle) ──────────────────────────────────────────────

/// Configuration handed to the connection task.
pub(crate) struct ConnectConfig {
    pub(crate) url: String,
    pub(crate) codec: Arc<dyn EnvelopeCodec>,
    pub(crate) options: ConnectionOptions,
    pub(crate) event_handlers: EventHandlers,
    pub(crate) auth: AuthToken,
}

/// Handle to one Robofleet relay connection.
///
/// Created via [`RobofleetLinkClient::connect`](crate::RobofleetLinkClient::connect).
/// All transport state lives in a background task; dropping the last
/// handle shuts the connection down.
pub struct Connection {
    cmd_tx: mpsc::Sender<ConnCmd>,
    state_rx: watch::Receiver<ConnectionState>,
    _task: JoinHandle<()>,
}

impl Connection {
    /// Spawn the connection task and wait for the initial attempt.
    ///
    /// A failed initial attempt is logged and reported through `on_error`;
    /// the task keeps retrying on the fixed reconnect delay, so a handle
    /// is returned either way.
    pub(crate) async fn open(config: ConnectConfig) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let task = tokio::spawn(connection_task(cmd_rx, config, state_tx, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("Initial connection failed (auto-reconnect continues): {}", e);
            }
            Err(_) => {
                log::warn!("Connection task exited before signalling readiness");
            }
        }

        Ok(Self {
            cmd_tx,
            state_rx,
            _task: task,
        })
    }

    fn closed_err() -> RobofleetLinkError {
        RobofleetLinkError::ConnectionClosed("connection task is not running".to_string())
    }

    async fn command(&self, cmd: ConnCmd) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| Self::closed_err())
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Whether the socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// A watch receiver observing state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Register a listener for all messages matching `pattern`.
    ///
    /// Acquires a relay subscription for the pattern (subscribe sent on
    /// the 0→1 refcount transition). The returned guard removes the
    /// listener and releases the subscription on `close()` or drop.
    pub async fn listen(
        &self,
        pattern: TopicPattern,
        callback: impl Fn(&RawMessage, &TopicMatch) + Send + Sync + 'static,
    ) -> Result<ListenerGuard> {
        let source = pattern.source().to_string();
        let (sub_tx, sub_rx) = oneshot::channel();
        self.command(ConnCmd::AcquireSubscription {
            source,
            result_tx: sub_tx,
        })
        .await?;
        sub_rx.await.map_err(|_| Self::closed_err())?;

        let (result_tx, result_rx) = oneshot::channel();
        self.command(ConnCmd::AddTopicListener {
            pattern,
            callback: Arc::new(callback),
            result_tx,
        })
        .await?;
        let id = result_rx.await.map_err(|_| Self::closed_err())?;

        Ok(ListenerGuard {
            id,
            cmd_tx: self.cmd_tx.clone(),
            closed: false,
        })
    }

    /// Register a listener invoked for every decoded inbound frame,
    /// regardless of topic. Does not acquire any relay subscription.
    pub async fn listen_raw(
        &self,
        callback: impl Fn(&RawMessage) + Send + Sync + 'static,
    ) -> Result<ListenerGuard> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(ConnCmd::AddRawListener {
            callback: Arc::new(callback),
            result_tx,
        })
        .await?;
        let id = result_rx.await.map_err(|_| Self::closed_err())?;
        Ok(ListenerGuard {
            id,
            cmd_tx: self.cmd_tx.clone(),
            closed: false,
        })
    }

    /// Register relay-side interest in `pattern` without a local listener.
    ///
    /// Shares refcounts with [`listen`](Self::listen): the subscribe wire
    /// message goes out once per pattern source, however many guards and
    /// listeners hold it.
    pub async fn subscribe(&self, pattern: &TopicPattern) -> Result<Subscription> {
        let source = pattern.source().to_string();
        let (result_tx, result_rx) = oneshot::channel();
        self.command(ConnCmd::AcquireSubscription {
            source: source.clone(),
            result_tx,
        })
        .await?;
        result_rx.await.map_err(|_| Self::closed_err())?;
        Ok(Subscription {
            source,
            cmd_tx: self.cmd_tx.clone(),
            closed: false,
        })
    }

    /// Enable or disable the subscription entry for `pattern` without
    /// releasing it: disabling sends an unsubscribe but keeps the
    /// refcount bookkeeping for fast re-enable.
    pub async fn set_subscription_enabled(
        &self,
        pattern: &TopicPattern,
        enabled: bool,
    ) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(ConnCmd::SetSubscriptionEnabled {
            source: pattern.source().to_string(),
            enabled,
            result_tx,
        })
        .await?;
        result_rx.await.map_err(|_| Self::closed_err())?
    }

    /// Send a pre-encoded frame to the relay.
    ///
    /// Returns `false` without sending when the socket is not connected;
    /// there is no outbound queueing, so the caller re-sends after
    /// reconnection if the message still matters.
    pub async fn send(&self, frame: Bytes) -> Result<bool> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(ConnCmd::Send { frame, result_tx }).await?;
        result_rx.await.map_err(|_| Self::closed_err())
    }

    /// Inject a frame through the same decode + dispatch path an inbound
    /// message takes.
    pub async fn dispatch(&self, frame: Bytes) -> Result<()> {
        self.command(ConnCmd::Dispatch { frame }).await
    }

    /// Re-dispatch the message `steps_back` steps before the newest in
    /// the time-travel buffer (clamped to the retained range). A no-op
    /// when the buffer is empty.
    pub async fn replay(&self, steps_back: usize) -> Result<()> {
        self.command(ConnCmd::Replay { steps_back }).await
    }

    /// Update the identity token. `Some(token)` authenticates,
    /// `None` explicitly de-authenticates. The auth frame is sent
    /// immediately when connected and re-sent on every reconnect.
    pub async fn set_id_token(&self, token: Option<String>) -> Result<()> {
        self.command(ConnCmd::SetIdToken { token }).await
    }

    /// Snapshot of the current subscription table.
    pub async fn subscriptions(&self) -> Result<Vec<SubscriptionInfo>> {
        let (result_tx, result_rx) = oneshot::channel();
        self.command(ConnCmd::Subscriptions { result_tx }).await?;
        result_rx.await.map_err(|_| Self::closed_err())
    }

    /// Gracefully shut down the connection task.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(ConnCmd::Shutdown).await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Best-effort shutdown signal.
        let _ = self.cmd_tx.try_send(ConnCmd::Shutdown);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .finish()
    }
}

// ── Guards ──────────────────────────────────────────────────────────────────

/// Relay-side interest in one topic pattern, released on `close()`/drop.
pub struct Subscription {
    source: String,
    cmd_tx: mpsc::Sender<ConnCmd>,
    closed: bool,
}

impl Subscription {
    /// The pattern source string this subscription holds.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Release the subscription refcount. Safe to call multiple times.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCmd::ReleaseSubscription {
                source: self.source.clone(),
                result_tx: Some(result_tx),
            })
            .await
            .map_err(|_| Connection::closed_err())?;
        result_rx.await.map_err(|_| Connection::closed_err())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.cmd_tx.try_send(ConnCmd::ReleaseSubscription {
                source: self.source.clone(),
                result_tx: None,
            });
        }
    }
}

/// A registered listener, removed on `close()` or drop.
pub struct ListenerGuard {
    id: ListenerId,
    cmd_tx: mpsc::Sender<ConnCmd>,
    closed: bool,
}

impl ListenerGuard {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener and release its subscription refcount.
    ///
    /// Removing a listener twice is a lifecycle bug and fails with
    /// [`RobofleetLinkError::UnregisteredListener`].
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(RobofleetLinkError::UnregisteredListener(format!(
                "listener {:?} was already removed",
                self.id
            )));
        }
        self.closed = true;
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCmd::RemoveListener {
                id: self.id,
                result_tx: Some(result_tx),
            })
            .await
            .map_err(|_| Connection::closed_err())?;
        result_rx.await.map_err(|_| Connection::closed_err())?
    }

    /// Toggle dispatch to this listener without removing it. The
    /// subscription refcount is unaffected.
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        if self.closed {
            return Err(RobofleetLinkError::UnregisteredListener(format!(
                "listener {:?} was already removed",
                self.id
            )));
        }
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCmd::SetListenerEnabled {
                id: self.id,
                enabled,
                result_tx,
            })
            .await
            .map_err(|_| Connection::closed_err())?;
        result_rx.await.map_err(|_| Connection::closed_err())?
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.cmd_tx.try_send(ConnCmd::RemoveListener {
                id: self.id,
                result_tx: None,
            });
        }
    }
}

// ── Background connection task ──────────────────────────────────────────────

/// Establish the WebSocket connection.
async fn establish_ws(
    url: &str,
    options: &ConnectionOptions,
    event_handlers: &EventHandlers,
) -> Result<WsStream> {
    log::debug!("Connecting to {}", url);
    let timeout = options.connect_timeout();
    let connect_result = if timeout.is_zero() {
        Ok(connect_async(url).await)
    } else {
        tokio::time::timeout(timeout, connect_async(url)).await
    };

    match connect_result {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => {
            let msg = format!("Connection failed: {}", e);
            event_handlers.emit_error(ConnectionError::new(&msg, true));
            Err(RobofleetLinkError::Transport(msg))
        }
        Err(_) => {
            let msg = format!("Connection timeout ({:?})", timeout);
            event_handlers.emit_error(ConnectionError::new(&msg, true));
            Err(RobofleetLinkError::Transport(msg))
        }
    }
}

/// Send the identity-token auth frame, if one is configured.
async fn send_auth_frame(ws: &mut WsStream, auth: &AuthToken, event_handlers: &EventHandlers) {
    if let Some(payload) = auth.frame() {
        event_handlers.emit_send(payload.as_bytes());
        if let Err(e) = ws.send(Message::Text(payload.into())).await {
            log::warn!("Failed to send auth frame: {}", e);
        }
    }
}

/// Send one subscribe/unsubscribe control message.
async fn send_control(
    ws: &mut WsStream,
    codec: &dyn EnvelopeCodec,
    action: &WireAction,
    event_handlers: &EventHandlers,
) -> Result<()> {
    let (source, sub_action) = match action {
        WireAction::Subscribe(source) => (source, SubscriptionAction::Subscribe),
        WireAction::Unsubscribe(source) => (source, SubscriptionAction::Unsubscribe),
    };
    let frame = codec.encode_subscription(source, sub_action)?;
    event_handlers.emit_send(&frame);
    ws.send(Message::Binary(frame))
        .await
        .map_err(|e| RobofleetLinkError::Transport(format!("Failed to send {}: {}", sub_action, e)))?;
    log::debug!("Sent {} for '{}'", sub_action, source);
    Ok(())
}

/// Everything the connection task owns.
struct TaskState {
    codec: Arc<dyn EnvelopeCodec>,
    options: ConnectionOptions,
    event_handlers: EventHandlers,
    auth: AuthToken,
    registry: ListenerRegistry,
    table: SubscriptionTable,
    ring: TimeTravelBuffer,
    ws: Option<WsStream>,
    shutdown: bool,
}

impl TaskState {
    fn connected(&self) -> bool {
        self.ws.is_some()
    }

    /// Tear down the socket after an error or close, reverting every
    /// subscription to pending so the reconnect flush re-sends them.
    fn transition_disconnected(
        &mut self,
        state_tx: &watch::Sender<ConnectionState>,
        reason: DisconnectReason,
    ) {
        if self.ws.take().is_some() {
            log::info!("Disconnected: {}", reason);
            self.event_handlers.emit_disconnect(reason);
        }
        self.table.mark_disconnected();
        let _ = state_tx.send(ConnectionState::Disconnected);
    }

    /// Decode an inbound frame, record it, and dispatch to listeners.
    fn handle_inbound(&mut self, frame: Bytes) {
        let meta = match self.codec.decode_meta(&frame) {
            Ok(meta) => meta,
            Err(e) => {
                log::warn!("Dropping undecodable frame ({} bytes): {}", frame.len(), e);
                self.event_handlers
                    .emit_error(ConnectionError::new(e.to_string(), false));
                return;
            }
        };
        let message = RawMessage::new(frame, meta);
        self.ring.record(message.clone());
        self.dispatch_message(&message);
    }

    fn dispatch_message(&self, message: &RawMessage) {
        let matched = self.registry.dispatch(message);
        if matched == 0 {
            log::warn!("No listeners matched topic '{}'", message.topic());
        }
    }

    /// Apply a table-computed wire action, if the socket is up.
    async fn apply_wire(&mut self, action: Option<WireAction>) {
        let Some(action) = action else { return };
        let Some(ws) = self.ws.as_mut() else { return };
        if let Err(e) = send_control(ws, self.codec.as_ref(), &action, &self.event_handlers).await {
            log::warn!("{}", e);
        }
    }

    /// Process one command. Wire sends are skipped while disconnected;
    /// the bookkeeping still happens and is flushed on reconnect.
    async fn handle_cmd(&mut self, cmd: ConnCmd, state_tx: &watch::Sender<ConnectionState>) {
        match cmd {
            ConnCmd::AddTopicListener {
                pattern,
                callback,
                result_tx,
            } => {
                let id = self.registry.add_topic(pattern, callback);
                let _ = result_tx.send(id);
            }
            ConnCmd::AddRawListener {
                callback,
                result_tx,
            } => {
                let id = self.registry.add_raw(callback);
                let _ = result_tx.send(id);
            }
            ConnCmd::RemoveListener { id, result_tx } => {
                let removed = self.registry.remove(id);
                match removed {
                    Ok(Some(source)) => {
                        let connected = self.connected();
                        let action = self.table.release(&source, connected);
                        self.apply_wire(action).await;
                        if let Some(tx) = result_tx {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Ok(None) => {
                        if let Some(tx) = result_tx {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        if let Some(tx) = result_tx {
                            let _ = tx.send(Err(e));
                        } else {
                            log::warn!("Ignoring stale listener removal: {}", e);
                        }
                    }
                }
            }
            ConnCmd::SetListenerEnabled {
                id,
                enabled,
                result_tx,
            } => {
                let _ = result_tx.send(self.registry.set_enabled(id, enabled));
            }
            ConnCmd::AcquireSubscription { source, result_tx } => {
                let connected = self.connected();
                let action = self.table.acquire(&source, connected);
                self.apply_wire(action).await;
                let _ = result_tx.send(());
            }
            ConnCmd::ReleaseSubscription { source, result_tx } => {
                let connected = self.connected();
                let action = self.table.release(&source, connected);
                self.apply_wire(action).await;
                if let Some(tx) = result_tx {
                    let _ = tx.send(());
                }
            }
            ConnCmd::SetSubscriptionEnabled {
                source,
                enabled,
                result_tx,
            } => {
                if !self.table.contains(&source) {
                    let _ = result_tx.send(Err(RobofleetLinkError::Configuration(format!(
                        "no subscription entry for pattern '{}'",
                        source
                    ))));
                    return;
                }
                let connected = self.connected();
                let action = self.table.set_enabled(&source, enabled, connected);
                self.apply_wire(action).await;
                let _ = result_tx.send(Ok(()));
            }
            ConnCmd::Send { frame, result_tx } => {
                let send_result = if let Some(ws) = self.ws.as_mut() {
                    self.event_handlers.emit_send(&frame);
                    Some(ws.send(Message::Binary(frame)).await)
                } else {
                    log::debug!("Dropping outbound frame while disconnected");
                    None
                };
                let sent = match send_result {
                    Some(Ok(())) => true,
                    Some(Err(e)) => {
                        self.transition_disconnected(
                            state_tx,
                            DisconnectReason::new(format!("Send failed: {}", e)),
                        );
                        false
                    }
                    None => false,
                };
                let _ = result_tx.send(sent);
            }
            ConnCmd::Dispatch { frame } => {
                self.handle_inbound(frame);
            }
            ConnCmd::Replay { steps_back } => {
                if let Some(message) = self.ring.replay(steps_back).cloned() {
                    log::debug!(
                        "Replaying message on '{}' ({} buffered)",
                        message.topic(),
                        self.ring.len()
                    );
                    self.dispatch_message(&message);
                }
            }
            ConnCmd::SetIdToken { token } => {
                self.auth = match token {
                    Some(token) => AuthToken::Token(token),
                    None => AuthToken::Cleared,
                };
                if let Some(ws) = self.ws.as_mut() {
                    send_auth_frame(ws, &self.auth, &self.event_handlers).await;
                }
            }
            ConnCmd::Subscriptions { result_tx } => {
                let _ = result_tx.send(self.table.snapshot());
            }
            ConnCmd::Shutdown => {
                self.shutdown = true;
            }
        }
    }

    /// Handle one socket event.
    async fn handle_frame(
        &mut self,
        frame: Option<std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>,
        state_tx: &watch::Sender<ConnectionState>,
    ) {
        match frame {
            Some(Ok(Message::Binary(data))) => {
                self.event_handlers.emit_receive(&data);
                self.handle_inbound(data);
            }
            Some(Ok(Message::Text(text))) => {
                // The relay wire is binary; stray text frames are ignored.
                log::debug!("Ignoring text frame ({} bytes)", text.len());
            }
            Some(Ok(Message::Ping(payload))) => {
                if let Some(ws) = self.ws.as_mut() {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
            }
            Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Ok(Message::Close(close_frame))) => {
                let reason = match close_frame {
                    Some(f) => DisconnectReason::with_code(f.reason.to_string(), f.code.into()),
                    None => DisconnectReason::new("Server closed connection"),
                };
                self.transition_disconnected(state_tx, reason);
            }
            Some(Err(e)) => {
                let msg = e.to_string();
                self.event_handlers
                    .emit_error(ConnectionError::new(&msg, true));
                self.transition_disconnected(
                    state_tx,
                    DisconnectReason::new(format!("WebSocket error: {}", msg)),
                );
            }
            None => {
                self.transition_disconnected(
                    state_tx,
                    DisconnectReason::new("WebSocket stream ended"),
                );
            }
        }
    }
}

/// The main background task.
///
/// Lifecycle:
/// 1. Attempt the initial connection and send the auth frame
/// 2. While connected: select over commands and socket frames, dispatching
///    each inbound message to completion in receipt order
/// 3. On disconnect: wait the fixed reconnect delay (commands are still
///    processed and recorded during the wait), then retry; retries never
///    stop
/// 4. On reconnect: send the auth frame, then re-subscribe every enabled
///    pattern exactly once
async fn connection_task(
    mut cmd_rx: mpsc::Receiver<ConnCmd>,
    config: ConnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let ConnectConfig {
        url,
        codec,
        options,
        event_handlers,
        auth,
    } = config;

    let ring_capacity = options.time_travel_capacity;
    let mut state = TaskState {
        codec,
        options,
        event_handlers,
        auth,
        registry: ListenerRegistry::new(),
        table: SubscriptionTable::new(),
        ring: TimeTravelBuffer::new(ring_capacity),
        ws: None,
        shutdown: false,
    };

    // Initial connection attempt.
    match establish_ws(&url, &state.options, &state.event_handlers).await {
        Ok(mut ws) => {
            send_auth_frame(&mut ws, &state.auth, &state.event_handlers).await;
            state.ws = Some(ws);
            let _ = state_tx.send(ConnectionState::Connected);
            state.event_handlers.emit_connect();
            log::info!("Connected to {}", url);
            let _ = ready_tx.send(Ok(()));
        }
        Err(e) => {
            let _ = state_tx.send(ConnectionState::Disconnected);
            let _ = ready_tx.send(Err(e));
        }
    }

    loop {
        if state.shutdown {
            if let Some(mut ws) = state.ws.take() {
                let _ = ws.close(None).await;
            }
            let _ = state_tx.send(ConnectionState::Disconnected);
            state
                .event_handlers
                .emit_disconnect(DisconnectReason::new("Client disconnected"));
            return;
        }

        if state.ws.is_some() {
            // Polling the socket and the command queue together; each
            // inbound frame is processed to completion before the next.
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => state.handle_cmd(cmd, &state_tx).await,
                        None => state.shutdown = true,
                    }
                }
                frame = async {
                    match state.ws.as_mut() {
                        Some(ws) => ws.next().await,
                        None => std::future::pending().await,
                    }
                } => {
                    state.handle_frame(frame, &state_tx).await;
                }
            }
        } else {
            if !state.options.auto_reconnect {
                // Process commands without a connection; wire messages
                // stay deferred until the caller reconnects by other
                // means (there are none — this mode is for tests).
                match cmd_rx.recv().await {
                    Some(cmd) => state.handle_cmd(cmd, &state_tx).await,
                    None => state.shutdown = true,
                }
                continue;
            }

            // Fixed-delay reconnect wait. Commands arriving during the
            // wait are processed (bookkeeping only; sends are deferred).
            let sleep_fut = tokio::time::sleep(state.options.reconnect_delay());
            tokio::pin!(sleep_fut);
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(cmd) => state.handle_cmd(cmd, &state_tx).await,
                            None => {
                                state.shutdown = true;
                                break;
                            }
                        }
                        if state.shutdown {
                            break;
                        }
                    }
                    _ = &mut sleep_fut => break,
                }
            }
            if state.shutdown {
                continue;
            }

            let _ = state_tx.send(ConnectionState::Connecting);
            match establish_ws(&url, &state.options, &state.event_handlers).await {
                Ok(mut ws) => {
                    log::info!("Reconnected to {}", url);
                    send_auth_frame(&mut ws, &state.auth, &state.event_handlers).await;

                    // Re-subscribe every enabled pattern before anything
                    // else happens on this connection.
                    let batch = state.table.take_resubscribe_batch();
                    if !batch.is_empty() {
                        log::info!("Re-subscribing {} pattern(s) after reconnect", batch.len());
                    }
                    let mut healthy = true;
                    for source in batch {
                        let action = WireAction::Subscribe(source);
                        if let Err(e) = send_control(
                            &mut ws,
                            state.codec.as_ref(),
                            &action,
                            &state.event_handlers,
                        )
                        .await
                        {
                            log::warn!("{}", e);
                            healthy = false;
                            break;
                        }
                    }

                    if healthy {
                        state.ws = Some(ws);
                        let _ = state_tx.send(ConnectionState::Connected);
                        state.event_handlers.emit_connect();
                    } else {
                        // Socket died mid-flush; every entry reverts to
                        // pending and the next attempt re-sends the batch.
                        state.table.mark_disconnected();
                        let _ = state_tx.send(ConnectionState::Disconnected);
                    }
                }
                Err(e) => {
                    log::warn!("Reconnection attempt failed: {}", e);
                    let _ = state_tx.send(ConnectionState::Disconnected);
                }
            }
        }
    }
}
