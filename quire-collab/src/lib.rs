//! # quire-collab — real-time sync relay and client binder for Quire
//!
//! WebSocket document synchronization over a CRDT replica.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncBinder  │ ◄─────────────────► │ RelayServer  │
//! │ (per user)  │   JSON or bincode   │ (one room)   │
//! └──────┬──────┘                     └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │SharedDocument│                    │SharedDocument│
//! │ (replica)    │                    │ (merged)     │
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                    ┌───────┴────────┐
//!                                    │SessionRegistry │
//!                                    │ (fan-out N-1)  │
//!                                    └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire message codec and transport errors
//! - [`presence`]: awareness state and remote-peer tracking
//! - [`registry`]: connected sessions, broadcast-except-origin
//! - [`server`]: the relay
//! - [`client`]: the sync binder with reconnect and resync

pub mod client;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::{Backoff, BinderConfig, BinderError, ConnectionState, SyncBinder, SyncEvent};
pub use presence::{
    AwarenessUpdate, CursorLabel, CursorRange, PresenceChange, PresenceRoom, PresenceState,
    PresenceUser, RemotePeer, UserMeta,
};
pub use protocol::{DecodeError, FrameFormat, MessageKind, TransportError, WireMessage};
pub use registry::{BroadcastOutcome, PeerSession, SessionId, SessionRegistry};
pub use server::{RelayHandle, RelayServer, RelayStats, ServerConfig};
