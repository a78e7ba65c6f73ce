//! Presence (awareness) side channel.
//!
//! Each client owns one [`PresenceState`] (who it is, where its cursor sits)
//! and publishes it as an [`AwarenessUpdate`] stamped with a per-client
//! clock. Presence is never part of document content.
//!
//! ```text
//! set_local()/set_cursor()
//!       │  clock += 1
//!       ▼
//! AwarenessUpdate ──► relay ──► PresenceRoom::apply() on every other peer
//!                        │
//!                        └── on disconnect: AwarenessUpdate { state: None }
//! ```
//!
//! A peer disappears when its owner announces `state: None`, or when the
//! relay synthesises that removal because the owning connection dropped.

use std::collections::HashMap;
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_NAME: &str = "Anonymous";
pub const DEFAULT_USER_COLOR: &str = "#ffa500";

/// User metadata supplied by the application. Missing fields get defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserMeta {
    pub name: Option<String>,
    pub color: Option<String>,
    pub id: Option<u64>,
}

impl UserMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), ..Self::default() }
    }

    /// Fill in defaults; the identity token is random when not given.
    pub fn resolve(&self) -> PresenceUser {
        PresenceUser {
            name: self.name.clone().unwrap_or_else(|| DEFAULT_USER_NAME.to_string()),
            color: self.color.clone().unwrap_or_else(|| DEFAULT_USER_COLOR.to_string()),
            id: self.id.unwrap_or_else(|| rand::thread_rng().gen_range(0..1_000_000_000)),
        }
    }
}

/// Display identity shown next to a remote cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub name: String,
    /// CSS color string
    pub color: String,
    /// Random identity token
    pub id: u64,
}

/// Selection in plain-text offsets; `anchor == head` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: u32,
    pub head: u32,
}

/// Everything one client shares about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user: PresenceUser,
    #[serde(default)]
    pub cursor: Option<CursorRange>,
}

/// Presence change as sent over the wire. `state == None` means "gone".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub client_id: u64,
    pub clock: u64,
    pub state: Option<PresenceState>,
}

/// Label data for rendering a remote cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorLabel {
    pub text: String,
    pub background: String,
}

/// A remote client as tracked locally.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub client_id: u64,
    pub clock: u64,
    pub state: PresenceState,
    pub last_seen: Instant,
}

impl RemotePeer {
    pub fn label(&self) -> CursorLabel {
        CursorLabel {
            text: self.state.user.name.clone(),
            background: self.state.user.color.clone(),
        }
    }
}

/// Outcome of applying a remote update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceChange {
    Added,
    Updated,
    Removed,
    /// Stale clock, own echo, or removal of an unknown peer.
    Ignored,
}

/// Local view of every client's presence in the room.
#[derive(Debug)]
pub struct PresenceRoom {
    local_client_id: u64,
    local: Option<PresenceState>,
    clock: u64,
    peers: HashMap<u64, RemotePeer>,
}

impl PresenceRoom {
    pub fn new(local_client_id: u64) -> Self {
        Self { local_client_id, local: None, clock: 0, peers: HashMap::new() }
    }

    pub fn local_client_id(&self) -> u64 {
        self.local_client_id
    }

    pub fn local_state(&self) -> Option<&PresenceState> {
        self.local.as_ref()
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Replace the local state and return the update to publish.
    pub fn set_local(&mut self, state: PresenceState) -> AwarenessUpdate {
        self.local = Some(state);
        self.local_update()
    }

    /// Move the local cursor. `None` if no local state was set yet.
    pub fn set_local_cursor(&mut self, cursor: Option<CursorRange>) -> Option<AwarenessUpdate> {
        let local = self.local.as_mut()?;
        local.cursor = cursor;
        Some(self.local_update())
    }

    /// Withdraw the local state (clean leave).
    pub fn clear_local(&mut self) -> AwarenessUpdate {
        self.local = None;
        self.local_update()
    }

    /// Re-announce the local state with a fresh clock, e.g. after reconnecting.
    pub fn renew_local(&mut self) -> Option<AwarenessUpdate> {
        self.local.as_ref()?;
        Some(self.local_update())
    }

    fn local_update(&mut self) -> AwarenessUpdate {
        self.clock += 1;
        AwarenessUpdate {
            client_id: self.local_client_id,
            clock: self.clock,
            state: self.local.clone(),
        }
    }

    /// Merge a remote update. Only strictly newer clocks are accepted.
    pub fn apply(&mut self, update: &AwarenessUpdate) -> PresenceChange {
        if update.client_id == self.local_client_id {
            return PresenceChange::Ignored;
        }
        let known_clock = self.peers.get(&update.client_id).map(|p| p.clock);
        if known_clock.is_some_and(|clock| update.clock <= clock) {
            return PresenceChange::Ignored;
        }

        match &update.state {
            None => {
                if self.peers.remove(&update.client_id).is_some() {
                    log::debug!("Presence: client {} left", update.client_id);
                    PresenceChange::Removed
                } else {
                    PresenceChange::Ignored
                }
            }
            Some(state) => {
                let peer = RemotePeer {
                    client_id: update.client_id,
                    clock: update.clock,
                    state: state.clone(),
                    last_seen: Instant::now(),
                };
                match self.peers.insert(update.client_id, peer) {
                    Some(_) => PresenceChange::Updated,
                    None => {
                        log::debug!("Presence: {} joined as client {}", state.user.name, update.client_id);
                        PresenceChange::Added
                    }
                }
            }
        }
    }

    /// Forget every remote peer (our connection dropped).
    pub fn clear_remote(&mut self) -> usize {
        let count = self.peers.len();
        self.peers.clear();
        count
    }

    pub fn peer(&self, client_id: u64) -> Option<&RemotePeer> {
        self.peers.get(&client_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Remote peers ordered by client id.
    pub fn peers(&self) -> Vec<RemotePeer> {
        let mut peers: Vec<_> = self.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.client_id);
        peers
    }
}
