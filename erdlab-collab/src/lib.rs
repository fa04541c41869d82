//! Real-time synchronization engine for collaborative schema-diagram
//! editing.
//!
//! One [`CollabClient`] per editing session. It keeps a shared
//! [`erdlab_core::Document`] converged with every other participant in
//! the same diagram, tracks who else is present, and measures round-trip
//! latency — all over a single frame-based WebSocket session.
//!
//! ```text
//!             ┌────────────────────────────────────────────┐
//!             │                CollabClient                │
//!             │                                            │
//!  Document ──┤ SyncTranslator      PresenceAggregator     │
//!  (mutations)│   │     ▲                  ▲               │
//!             │   ▼     │                  │               │
//!             │  ┌──────┴──────────────────┴────┐          │
//!             │  │          Connection          │ LatencyProber
//!             │  └──────────────┬───────────────┘          │
//!             └─────────────────┼──────────────────────────┘
//!                               ▼
//!                        FrameTransport
//!                      (WebSocket / memory)
//! ```
//!
//! Local mutations flow out as typed wire events; remote events flow in
//! through a FIFO apply queue guarded against echo, so a change applied
//! from a peer is never published back. Presence and latency are exposed
//! as `watch` channels the UI can observe.

pub mod client;
pub mod connection;
pub mod event;
pub mod latency;
pub mod presence;
pub mod router;
pub mod sync;
pub mod transport;

pub use client::{ClientConfig, CollabClient, LocalUser};
pub use connection::{
    ConnEvent, Connection, ConnectionState, SharedToken, StaticToken, TokenProvider,
};
pub use event::{CollabError, EventKind, WireEvent};
pub use latency::LatencyProber;
pub use presence::{PresenceAggregator, PresenceSnapshot, UserPresence};
pub use router::{EventFilter, EventRouter, ListenerId};
pub use sync::SyncTranslator;
pub use transport::{memory_pair, Frame, FrameCommand, FrameLink, FrameTransport, WsTransport};
