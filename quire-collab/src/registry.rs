//! Session registry: the set of connected peers and fan-out to N-1 of them.
//!
//! Each [`PeerSession`] owns a bounded outbound queue drained by its
//! connection's writer task. Broadcasting never awaits a socket: a message
//! is pushed with `try_send`, and a session whose queue is full or closed
//! is evicted on the spot while delivery to the others continues.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::TransportError;

pub type SessionId = Uuid;

/// Server-side handle for one connected socket.
#[derive(Debug)]
pub struct PeerSession {
    id: SessionId,
    addr: SocketAddr,
    outbound: mpsc::Sender<Message>,
    /// Set on any inbound frame, cleared by the heartbeat.
    alive: AtomicBool,
    shutdown: Notify,
}

impl PeerSession {
    /// Create a session and the receiver its writer task drains.
    pub fn new(addr: SocketAddr, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            addr,
            outbound,
            alive: AtomicBool::new(true),
            shutdown: Notify::new(),
        });
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue a frame for this peer without waiting.
    pub fn send(&self, frame: Message) -> Result<(), TransportError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Read and clear the liveness flag.
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Ask the connection to close. The reader loop observes this even if
    /// it is not waiting yet.
    pub fn close(&self) {
        let _ = self.outbound.try_send(Message::Close(None));
        self.shutdown.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.shutdown.notified().await
    }
}

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub failed: usize,
}

/// All currently connected sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<PeerSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, session: Arc<PeerSession>) {
        self.sessions.write().await.insert(session.id(), session);
    }

    pub async fn remove(&self, id: &SessionId) -> Option<Arc<PeerSession>> {
        self.sessions.write().await.remove(id)
    }

    pub async fn get(&self, id: &SessionId) -> Option<Arc<PeerSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Deliver `frame` to every session except `origin`.
    ///
    /// A session that cannot accept the frame is removed and closed; the
    /// remaining sessions still receive it.
    pub async fn broadcast_except(
        &self,
        origin: Option<&SessionId>,
        frame: &Message,
    ) -> BroadcastOutcome {
        let targets: Vec<Arc<PeerSession>> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| Some(&s.id()) != origin)
                .cloned()
                .collect()
        };

        let mut outcome = BroadcastOutcome::default();
        let mut failed = Vec::new();
        for session in targets {
            match session.send(frame.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(e) => {
                    log::warn!("Dropping session {} ({}): {e}", session.id(), session.addr());
                    failed.push(session);
                }
            }
        }

        if !failed.is_empty() {
            outcome.failed = failed.len();
            let mut sessions = self.sessions.write().await;
            for session in failed {
                sessions.remove(&session.id());
                session.close();
            }
        }
        outcome
    }

    /// Close every session and empty the registry.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        drained.len()
    }
}
