//! Client sync binder: a local replica kept in step with the relay.
//!
//! Provides:
//! - Connection supervision with exponential backoff
//! - Resync on every (re)connect: accept the relay snapshot, then push the
//!   diff of the local replica against it (covers edits made offline)
//! - Delta send/receive with automatic replica integration
//! - Presence publishing and tracking of remote peers
//! - Idempotent attach/detach of rendering plugins on the editing surface
//!
//! ```text
//! apply_local ──► SharedDocument ──► link (mpsc) ──► session task ──► relay
//!                       ▲                                 │
//!                       └──────── apply_remote ◄──────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use quire_core::{
    AttachedPlugins, Block, DocumentError, Edit, PluginKind, RenderBinding, SharedDocument,
    FRAGMENT_NAME,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::presence::{
    AwarenessUpdate, CursorRange, PresenceChange, PresenceRoom, PresenceState, RemotePeer, UserMeta,
};
use crate::protocol::{DecodeError, FrameFormat, MessageKind, TransportError, WireMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the binder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Socket open, waiting for the snapshot
    Connected,
    /// Snapshot applied and local changes pushed
    Synced,
    /// Connection lost
    Disconnected,
    /// A remote delta was merged into the replica
    RemoteUpdate { bytes: usize },
    /// A remote peer's presence changed
    PresenceChanged { client_id: u64, change: PresenceChange },
}

/// Exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2,
        }
    }
}

impl Backoff {
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(self.factor.max(1)).min(self.max)
    }
}

/// Binder configuration.
#[derive(Debug, Clone)]
pub struct BinderConfig {
    /// Relay URL without the room segment
    pub url: String,
    pub room: String,
    pub user: UserMeta,
    /// Attach plugins as soon as a surface is provided
    pub auto_bind: bool,
    /// False forces [`RenderBinding::Static`] for every surface
    pub register_plugins: bool,
    pub reconnect: Backoff,
    /// Frames buffered towards the socket before a resync is forced
    pub outbound_capacity: usize,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:1234".to_string(),
            room: "default-room".to_string(),
            user: UserMeta::default(),
            auto_bind: true,
            register_plugins: true,
            reconnect: Backoff::default(),
            outbound_capacity: 256,
        }
    }
}

impl BinderConfig {
    /// Full WebSocket endpoint: `url/room`.
    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), self.room)
    }
}

/// Binder errors. Returned from local operations; session errors are
/// logged by the supervisor and lead to a reconnect.
#[derive(Debug, thiserror::Error)]
pub enum BinderError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// State shared between the binder handle and its supervisor task.
struct Shared {
    document: Mutex<SharedDocument>,
    presence: Mutex<PresenceRoom>,
    /// Outbound queue of the live session; `None` while not synced.
    link: Mutex<Option<mpsc::Sender<Message>>>,
    state: watch::Sender<ConnectionState>,
    connected: watch::Sender<bool>,
    events: mpsc::Sender<SyncEvent>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn emit(&self, event: SyncEvent) {
        let _ = self.events.try_send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
        self.connected.send_replace(state == ConnectionState::Connected);
    }

    /// Push a frame to the live session, if any. A full queue drops the
    /// link so the session ends and the next one resyncs.
    async fn send(&self, frame: Message) {
        let mut link = self.link.lock().await;
        let Some(tx) = link.as_ref() else {
            return;
        };
        if let Err(e) = tx.try_send(frame) {
            log::warn!("Outbound queue unavailable ({e}); forcing resync");
            *link = None;
        }
    }
}

/// How a synced session ended.
enum SessionEnd {
    Shutdown,
    Dropped,
    Resync,
}

/// Owns a local replica and keeps it synchronized with the relay.
pub struct SyncBinder {
    config: BinderConfig,
    client_id: u64,
    shared: Arc<Shared>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    plugins: std::sync::Mutex<Option<AttachedPlugins>>,
    destroyed: AtomicBool,
}

impl SyncBinder {
    /// Create a binder with an empty replica. Call [`connect`](Self::connect)
    /// to start syncing.
    pub fn new(config: BinderConfig) -> Self {
        Self::with_document(config, SharedDocument::new())
    }

    /// Create a binder around an existing replica.
    pub fn with_document(config: BinderConfig, document: SharedDocument) -> Self {
        let client_id = document.client_id();
        let mut presence = PresenceRoom::new(client_id);
        presence.set_local(PresenceState { user: config.user.resolve(), cursor: None });

        let (events, event_rx) = mpsc::channel(256);
        let shared = Arc::new(Shared {
            document: Mutex::new(document),
            presence: Mutex::new(presence),
            link: Mutex::new(None),
            state: watch::Sender::new(ConnectionState::Disconnected),
            connected: watch::Sender::new(false),
            events,
            shutdown: watch::Sender::new(false),
        });

        Self {
            config,
            client_id,
            shared,
            event_rx: Some(event_rx),
            supervisor: std::sync::Mutex::new(None),
            plugins: std::sync::Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BinderConfig {
        &self.config
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Spawn the connection supervisor. Repeated calls are no-ops.
    pub fn connect(&self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let mut supervisor = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner);
        if supervisor.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let config = self.config.clone();
        *supervisor = Some(tokio::spawn(supervise(shared, config)));
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Boolean connection signal for the UI.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the binder is synced. Returns false if it was destroyed.
    pub async fn wait_connected(&self) -> bool {
        let mut connected = self.shared.connected.subscribe();
        while !*connected.borrow_and_update() {
            if connected.changed().await.is_err() || self.destroyed.load(Ordering::Acquire) {
                return false;
            }
        }
        true
    }

    /// Apply a local edit and forward its delta to the relay.
    ///
    /// While disconnected the edit only lands in the replica; it reaches the
    /// relay through the resync diff of the next session.
    pub async fn apply_local(&self, edit: &Edit) -> Result<Vec<u8>, BinderError> {
        // Replica lock spans the send so deltas leave in replica order.
        let mut document = self.shared.document.lock().await;
        let update = document.apply_local(edit)?;
        let frame = WireMessage::update(update.clone()).to_frame(FrameFormat::Binary)?;
        self.shared.send(frame).await;
        Ok(update)
    }

    /// Publish the local cursor.
    pub async fn set_cursor(&self, cursor: Option<CursorRange>) -> Result<(), BinderError> {
        let update = self.shared.presence.lock().await.set_local_cursor(cursor);
        if let Some(update) = update {
            let frame = WireMessage::awareness(&update)?.to_frame(FrameFormat::Binary)?;
            self.shared.send(frame).await;
        }
        Ok(())
    }

    /// CRDT client id of the local replica.
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub async fn text(&self) -> String {
        self.shared.document.lock().await.text()
    }

    pub async fn xml(&self) -> String {
        self.shared.document.lock().await.xml()
    }

    pub async fn blocks(&self) -> Vec<Block> {
        self.shared.document.lock().await.blocks()
    }

    pub async fn remote_peers(&self) -> Vec<RemotePeer> {
        self.shared.presence.lock().await.peers()
    }

    pub async fn local_presence(&self) -> Option<PresenceState> {
        self.shared.presence.lock().await.local_state().cloned()
    }

    /// Hand the binder an editing surface. With `auto_bind` the rendering
    /// plugins are attached immediately. Returns the number of plugins
    /// registered.
    pub fn attach_surface(&self, binding: RenderBinding) -> usize {
        let binding = if self.config.register_plugins { binding } else { RenderBinding::Static };
        let mut plugins = self.plugins.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = plugins.as_mut() {
            previous.detach();
        }
        let attached = plugins.insert(AttachedPlugins::new(binding));
        if self.config.auto_bind {
            attached.attach(&self.plugin_kinds())
        } else {
            0
        }
    }

    /// Attach plugins to the current surface. No-op if already attached or
    /// no surface was given.
    pub fn bind(&self) -> usize {
        let kinds = self.plugin_kinds();
        let mut plugins = self.plugins.lock().unwrap_or_else(PoisonError::into_inner);
        plugins.as_mut().map_or(0, |p| p.attach(&kinds))
    }

    /// Detach every plugin this binder registered.
    pub fn unbind(&self) {
        let mut plugins = self.plugins.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(attached) = plugins.as_mut() {
            attached.detach();
        }
    }

    pub fn is_bound(&self) -> bool {
        let plugins = self.plugins.lock().unwrap_or_else(PoisonError::into_inner);
        plugins.as_ref().is_some_and(AttachedPlugins::is_attached)
    }

    fn plugin_kinds(&self) -> Vec<PluginKind> {
        vec![
            PluginKind::Sync { fragment: FRAGMENT_NAME.to_string() },
            PluginKind::Cursor { local_client_id: self.client_id },
            PluginKind::Undo,
        ]
    }

    /// Unbind, leave the room, and stop the supervisor.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.unbind();
        self.shared.shutdown.send_replace(true);

        let handle = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(2), &mut handle).await.is_err() {
                log::warn!("Sync supervisor did not stop in time; aborting");
                handle.abort();
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for SyncBinder {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
        self.unbind();
    }
}

/// Resolves once shutdown was requested.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn supervise(shared: Arc<Shared>, config: BinderConfig) {
    let mut stop = shared.shutdown.subscribe();
    let mut delay = config.reconnect.initial;
    shared.set_state(ConnectionState::Connecting);

    loop {
        let end = run_session(&shared, &config, &mut stop).await;

        let was_connected = *shared.connected.borrow();
        shared.link.lock().await.take();
        shared.presence.lock().await.clear_remote();
        if was_connected {
            shared.connected.send_replace(false);
            shared.emit(SyncEvent::Disconnected);
        }

        match end {
            Ok(SessionEnd::Shutdown) => break,
            Ok(SessionEnd::Resync) => {
                delay = config.reconnect.initial;
                shared.set_state(ConnectionState::Reconnecting);
                continue;
            }
            Ok(SessionEnd::Dropped) => {
                log::info!("Relay connection dropped; reconnecting");
                delay = config.reconnect.initial;
            }
            Err(e) => log::warn!("Sync session failed: {e}; retrying in {delay:?}"),
        }

        shared.set_state(ConnectionState::Reconnecting);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_requested(&mut stop) => break,
        }
        delay = config.reconnect.next(delay);
    }

    shared.set_state(ConnectionState::Disconnected);
    log::debug!("Sync supervisor stopped");
}

/// One connection from handshake to close. Errors before the snapshot is
/// applied are returned as `Err`; a synced session always ends in `Ok`.
async fn run_session(
    shared: &Shared,
    config: &BinderConfig,
    stop: &mut watch::Receiver<bool>,
) -> Result<SessionEnd, BinderError> {
    let endpoint = config.endpoint();
    let ws_stream = tokio::select! {
        connected = tokio_tungstenite::connect_async(endpoint.as_str()) => {
            connected.map_err(|e| TransportError::Connect(e.to_string()))?.0
        }
        _ = stop_requested(stop) => return Ok(SessionEnd::Shutdown),
    };
    let (mut sink, mut stream) = ws_stream.split();
    log::info!("Connected to {endpoint}");
    shared.emit(SyncEvent::Connected);

    // Fresh snapshot first; nothing is sent before it is applied. The relay
    // sends it as the first data frame, so an undecodable frame here ends
    // the session instead of leaving it unsynced.
    let snapshot = loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = stop_requested(stop) => return Ok(SessionEnd::Shutdown),
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(TransportError::Connect(e.to_string()).into()),
            None => return Err(TransportError::Closed.into()),
        };
        match WireMessage::from_frame(&frame) {
            Ok(Some((message, _))) if message.kind == MessageKind::Update => break message.payload,
            Ok(Some((message, _))) => apply_presence(shared, &message).await,
            Ok(None) => {
                if let Message::Close(_) = frame {
                    return Err(TransportError::Closed.into());
                }
            }
            Err(e) => {
                log::warn!("Relay snapshot could not be decoded: {e}");
                return Err(e.into());
            }
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel(config.outbound_capacity.max(1));
    {
        let mut document = shared.document.lock().await;
        document.apply_remote(&snapshot)?;
        let relay_state = SharedDocument::from_snapshot(&snapshot)?.state_vector();
        let missing = document.diff_since(&relay_state)?;
        let frame = WireMessage::update(missing).to_frame(FrameFormat::Binary)?;
        sink.send(frame)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        // Linked while the replica is locked: no local delta falls between
        // the diff and the live stream.
        *shared.link.lock().await = Some(out_tx);
    }
    if let Some(update) = shared.presence.lock().await.renew_local() {
        shared.send(WireMessage::awareness(&update)?.to_frame(FrameFormat::Binary)?).await;
    }
    shared.set_state(ConnectionState::Connected);
    shared.emit(SyncEvent::Synced);
    log::info!("Synced with {endpoint}");

    loop {
        tokio::select! {
            _ = stop_requested(stop) => {
                leave(shared, &mut sink, &mut out_rx).await;
                return Ok(SessionEnd::Shutdown);
            }
            outbound = out_rx.recv() => match outbound {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        log::warn!("Send to relay failed: {e}");
                        return Ok(SessionEnd::Dropped);
                    }
                }
                None => return Ok(SessionEnd::Resync),
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Dropped),
                Some(Ok(frame)) => handle_inbound(shared, &frame).await,
                Some(Err(e)) => {
                    log::warn!("Relay connection error: {e}");
                    return Ok(SessionEnd::Dropped);
                }
            },
        }
    }
}

async fn handle_inbound(shared: &Shared, frame: &Message) {
    let message = match WireMessage::from_frame(frame) {
        Ok(Some((message, _))) => message,
        Ok(None) => return,
        Err(e) => {
            log::warn!("Dropping message from relay: {e}");
            return;
        }
    };

    match message.kind {
        MessageKind::Update => {
            let result = shared.document.lock().await.apply_remote(&message.payload);
            match result {
                Ok(()) => shared.emit(SyncEvent::RemoteUpdate { bytes: message.payload.len() }),
                Err(DocumentError::MalformedUpdate(e)) => {
                    log::warn!("Dropping malformed update from relay: {e}");
                }
                Err(e) => log::error!("MERGE FAILURE applying relay update: {e}"),
            }
        }
        MessageKind::Awareness => apply_presence(shared, &message).await,
    }
}

async fn apply_presence(shared: &Shared, message: &WireMessage) {
    let update: AwarenessUpdate = match message.awareness_update() {
        Ok(update) => update,
        Err(e) => {
            log::warn!("Dropping awareness update: {e}");
            return;
        }
    };
    let change = shared.presence.lock().await.apply(&update);
    if change != PresenceChange::Ignored {
        shared.emit(SyncEvent::PresenceChanged { client_id: update.client_id, change });
    }
}

/// Announce departure, flush queued frames, and close the socket.
async fn leave<S>(shared: &Shared, sink: &mut S, out_rx: &mut mpsc::Receiver<Message>)
where
    S: futures_util::Sink<Message> + Unpin,
{
    shared.link.lock().await.take();
    while let Ok(frame) = out_rx.try_recv() {
        let _ = sink.send(frame).await;
    }
    let removal = shared.presence.lock().await.clear_local();
    if let Ok(frame) = WireMessage::awareness(&removal).and_then(|m| m.to_frame(FrameFormat::Binary)) {
        let _ = sink.send(frame).await;
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}
