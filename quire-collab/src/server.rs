//! WebSocket relay holding the single shared document.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌──► Client B
//!            ├── reader ── merge ───┤
//! Client C ──┘     │   SharedDocument└──► Client C
//!                  │
//!                  └── awareness ──► SessionRegistry::broadcast_except
//! ```
//!
//! Per connection:
//! 1. WebSocket handshake, split into a reader loop and a writer task that
//!    drains the session's outbound queue.
//! 2. Under the document lock: queue the full snapshot, then register the
//!    session. Updates are merged and fanned out under the same lock, so a
//!    new peer sees every update either in its snapshot or as a delta.
//! 3. Replay known presence, then read until close, error, or eviction.
//! 4. Remove the session and announce its presence removal.
//!
//! Nothing here is fatal to the process except binding the listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use quire_core::{DocumentError, SharedDocument};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::presence::AwarenessUpdate;
use crate::protocol::{FrameFormat, MessageKind, TransportError, WireMessage};
use crate::registry::{PeerSession, SessionId, SessionRegistry};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per session before it is evicted
    pub outbound_capacity: usize,
    /// Ping period; a session silent for a whole period is dropped.
    /// Zero disables the heartbeat.
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            outbound_capacity: 256,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub dropped_messages: u64,
    pub updates_applied: u64,
}

/// State shared by every connection task.
struct RelayState {
    document: Mutex<SharedDocument>,
    registry: SessionRegistry,
    /// Latest awareness update per client id, with the session that owns it.
    presence: Mutex<HashMap<u64, (SessionId, AwarenessUpdate)>>,
    stats: RwLock<RelayStats>,
    config: ServerConfig,
}

/// Cheap, cloneable view of a running relay.
#[derive(Clone)]
pub struct RelayHandle {
    state: Arc<RelayState>,
}

impl RelayHandle {
    pub async fn stats(&self) -> RelayStats {
        self.state.stats.read().await.clone()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.registry.len().await
    }

    pub async fn document_text(&self) -> String {
        self.state.document.lock().await.text()
    }

    pub async fn document_xml(&self) -> String {
        self.state.document.lock().await.xml()
    }

    pub async fn snapshot(&self) -> Vec<u8> {
        self.state.document.lock().await.snapshot()
    }

    /// Replace the document with an empty one and close every session.
    /// Reconnecting clients push their replicas back.
    pub async fn reset_document(&self) {
        reset_document(&self.state).await;
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The relay server.
pub struct RelayServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Bind the listener. This is the only fatal error path of the relay.
    pub async fn bind(config: ServerConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|source| TransportError::Bind { addr: config.bind_addr.clone(), source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr: config.bind_addr.clone(), source })?;
        log::info!("Relay listening on {local_addr}");

        let state = Arc::new(RelayState {
            document: Mutex::new(SharedDocument::new()),
            registry: SessionRegistry::new(),
            presence: Mutex::new(HashMap::new()),
            stats: RwLock::new(RelayStats::default()),
            config,
        });
        Ok(Self { listener, local_addr, state })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> RelayHandle {
        RelayHandle { state: self.state.clone() }
    }

    /// Accept connections until the future is dropped.
    pub async fn serve(self) {
        let _heartbeat = (!self.state.config.heartbeat_interval.is_zero())
            .then(|| AbortOnDrop(tokio::spawn(heartbeat(self.state.clone()))));

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, state).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Bind and serve.
    pub async fn run(config: ServerConfig) -> Result<(), TransportError> {
        Self::bind(config).await?.serve().await;
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RelayState>,
) -> Result<(), TransportError> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    let (mut sink, mut stream) = ws_stream.split();

    let (session, mut outbound) = PeerSession::new(addr, state.config.outbound_capacity);
    let writer_session = session.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let closing = matches!(frame, Message::Close(_));
            if let Err(e) = sink.send(frame).await {
                log::warn!("Write to {} failed: {e}", writer_session.addr());
                writer_session.close();
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    {
        let mut s = state.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    log::info!("Peer {} connected from {addr}", session.id());

    // Past this point every exit goes through `disconnect`.
    match join(&state, &session).await {
        Ok(()) => {
            replay_presence(&state, &session).await;
            read_loop(&state, &session, &mut stream, addr).await;
        }
        Err(e) => log::warn!("Could not sync peer {} ({addr}): {e}", session.id()),
    }

    disconnect(&state, &session).await;
    if tokio::time::timeout(Duration::from_secs(1), &mut writer).await.is_err() {
        writer.abort();
    }
    Ok(())
}

/// Queue the snapshot and register the session, atomically with respect to merges.
async fn join(state: &RelayState, session: &Arc<PeerSession>) -> Result<(), TransportError> {
    let document = state.document.lock().await;
    let snapshot = WireMessage::update(document.snapshot()).to_frame(FrameFormat::Binary)?;
    session.send(snapshot)?;
    state.registry.add(session.clone()).await;
    Ok(())
}

async fn read_loop(
    state: &RelayState,
    session: &Arc<PeerSession>,
    stream: &mut SplitStream<WebSocketStream<TcpStream>>,
    addr: SocketAddr,
) {
    loop {
        tokio::select! {
            _ = session.closed() => {
                log::debug!("Session {} closed by relay", session.id());
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    session.mark_alive();
                    match frame {
                        // tungstenite answers pings itself.
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                        Message::Close(_) => break,
                        data => handle_frame(state, session, data).await,
                    }
                }
                Some(Err(e)) => {
                    log::warn!("WebSocket error from {addr}: {e}");
                    break;
                }
                None => break,
            }
        }
    }
}

async fn handle_frame(state: &RelayState, session: &Arc<PeerSession>, frame: Message) {
    state.stats.write().await.total_messages += 1;

    let message = match WireMessage::from_frame(&frame) {
        Ok(Some((message, _))) => message,
        Ok(None) => return,
        Err(e) => {
            log::warn!("Dropping message from {}: {e}", session.addr());
            state.stats.write().await.dropped_messages += 1;
            return;
        }
    };

    match message.kind {
        MessageKind::Update => {
            let mut document = state.document.lock().await;
            match document.apply_remote(&message.payload) {
                Ok(()) => {
                    state.stats.write().await.updates_applied += 1;
                    // Relay the frame as received; peers decode the same bytes.
                    state.registry.broadcast_except(Some(&session.id()), &frame).await;
                }
                Err(DocumentError::MalformedUpdate(e)) => {
                    log::warn!("Dropping malformed update from {}: {e}", session.addr());
                    state.stats.write().await.dropped_messages += 1;
                }
                Err(e) => {
                    log::error!("MERGE FAILURE from {}: {e}; resetting shared document", session.addr());
                    drop(document);
                    reset_document(state).await;
                }
            }
        }
        MessageKind::Awareness => {
            let update = match message.awareness_update() {
                Ok(update) => update,
                Err(e) => {
                    log::warn!("Dropping awareness from {}: {e}", session.addr());
                    state.stats.write().await.dropped_messages += 1;
                    return;
                }
            };
            record_presence(state, session.id(), update).await;
            state.registry.broadcast_except(Some(&session.id()), &frame).await;
        }
    }
}

async fn record_presence(state: &RelayState, owner: SessionId, update: AwarenessUpdate) {
    let mut presence = state.presence.lock().await;
    let newer = presence
        .get(&update.client_id)
        .map_or(true, |(_, known)| update.clock > known.clock);
    if !newer {
        return;
    }
    if update.state.is_none() {
        presence.remove(&update.client_id);
    } else {
        log::trace!("Presence: client {} clock {}", update.client_id, update.clock);
        presence.insert(update.client_id, (owner, update));
    }
}

async fn replay_presence(state: &RelayState, session: &PeerSession) {
    let known: Vec<AwarenessUpdate> = {
        let presence = state.presence.lock().await;
        presence
            .values()
            .filter(|(owner, _)| *owner != session.id())
            .map(|(_, update)| update.clone())
            .collect()
    };
    for update in known {
        match WireMessage::awareness(&update).and_then(|m| m.to_frame(FrameFormat::Binary)) {
            Ok(frame) => {
                if let Err(e) = session.send(frame) {
                    log::warn!("Presence replay to {} failed: {e}", session.addr());
                    return;
                }
            }
            Err(e) => log::warn!("Presence replay encode failed: {e}"),
        }
    }
}

async fn disconnect(state: &RelayState, session: &Arc<PeerSession>) {
    state.registry.remove(&session.id()).await;
    session.close();

    let departed: Vec<AwarenessUpdate> = {
        let mut presence = state.presence.lock().await;
        let ids: Vec<u64> = presence
            .iter()
            .filter(|(_, (owner, _))| *owner == session.id())
            .map(|(client_id, _)| *client_id)
            .collect();
        ids.into_iter()
            .filter_map(|client_id| presence.remove(&client_id))
            .map(|(_, last)| AwarenessUpdate {
                client_id: last.client_id,
                clock: last.clock + 1,
                state: None,
            })
            .collect()
    };
    for removal in departed {
        if let Ok(frame) = WireMessage::awareness(&removal).and_then(|m| m.to_frame(FrameFormat::Binary)) {
            state.registry.broadcast_except(None, &frame).await;
        }
    }

    {
        let mut s = state.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    log::info!("Peer {} disconnected ({})", session.id(), session.addr());
}

async fn reset_document(state: &RelayState) {
    *state.document.lock().await = SharedDocument::new();
    state.presence.lock().await.clear();
    let closed = state.registry.close_all().await;
    log::warn!("Shared document reset; closed {closed} sessions");
}

/// Ping every session each period; drop sessions silent since the last tick.
async fn heartbeat(state: Arc<RelayState>) {
    let mut ticker = tokio::time::interval(state.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        for session in state.registry.sessions().await {
            if !session.take_alive() {
                log::warn!("Session {} ({}) missed heartbeat", session.id(), session.addr());
                state.registry.remove(&session.id()).await;
                session.close();
            } else if session.send(Message::Ping(Vec::new().into())).is_err() {
                state.registry.remove(&session.id()).await;
                session.close();
            }
        }
    }
}
