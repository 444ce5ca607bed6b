//! # logos-mesh — Connection layer for Logos shared workspaces
//!
//! Keeps one participant's copy of a workspace in sync with everyone else,
//! through a central relay, direct peer links, or both.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!   application ─►│ MeshClient                   │─► MeshEvent listeners
//!                 │  lifecycle · routing · queue │
//!                 └──┬───────────┬───────────┬───┘
//!                    │           │           │
//!          ┌─────────▼──┐ ┌──────▼─────┐ ┌───▼──────────────┐
//!          │ Link       │ │ Signaling  │ │ ConnectionManager│
//!          │ (relay)    │ │ Client     │ │ (direct links)   │
//!          └─────┬──────┘ └─────┬──────┘ └────────┬─────────┘
//!                │ WebSocket    │ WebSocket       │ data channels
//!                ▼              ▼                 ▼
//!            relay server   signaling server    peers
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire codec, peer frames and text control messages
//! - [`queue`] / [`storage`] — Bounded offline queue and its persistence
//! - [`transport`] — Reconnecting WebSocket link
//! - [`signaling`] — Out-of-band channel for direct link bootstrap
//! - [`peer`] — Direct link lifecycle and handshakes
//! - [`client`] — The orchestrator tying everything together
//!
//! ## Topologies
//!
//! | Topology | Data path | Falls back to |
//! |----------|-----------|---------------|
//! | Star | relay only | — |
//! | Mesh | direct links, relay for signals | star |
//! | Hybrid | direct where usable, relay otherwise | star |

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod peer;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod signaling;
pub mod storage;
pub mod sync_core;
pub mod testing;
pub mod timer;
pub mod transport;

// Re-exports for convenience
pub use client::{ClientBuilder, ConnectionStatus, MeshClient, PeerInfo};
pub use config::{MeshConfig, MeshConfigBuilder, ReconnectPolicy, Topology};
pub use error::{ErrorKind, MeshError};
pub use events::{EventHub, MeshEvent, Subscription};
pub use metrics::{MeshMetrics, PeerMetrics, PeerStatus, RTT_UNKNOWN};
pub use peer::{PeerConnector, PeerEventSink, PeerLink, PeerLinkEvent};
pub use protocol::{DecodeError, FrameClass, MsgType, SignalEnvelope, SignalMessage, WirePacket};
pub use queue::{OfflineQueue, QueueEntry};
pub use storage::{MemoryStorage, RocksStorage, StorageAdapter};
pub use sync_core::{Delta, LwwMap, SyncCore};
pub use transport::{Connector, WsConnector};
