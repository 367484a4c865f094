//! # pinroom-hub — PIN-addressed WebSocket rooms
//!
//! Clients attach to a room named by a short PIN; every message one client
//! sends is fanned out to everyone attached to the same room.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ RoomClient  │ ◄────────────────► │  HubServer   │
//! │ (per user)  │   text / binary    │(/ws, /health)│
//! └─────────────┘                    └──────┬───────┘
//!                                           │ OriginPolicy
//!                                           ▼
//!                                    ┌──────────────┐
//!                                    │ RoomRegistry │
//!                                    │ (PIN → Room) │
//!                                    └──────┬───────┘
//!                                           │
//!                         ┌─────────────────┼─────────────────┐
//!                         ▼                 ▼                 ▼
//!                   ┌──────────┐      ┌──────────┐      ┌──────────┐
//!                   │   Room   │      │   Room   │      │   Room   │
//!                   │ (fan-out)│      │ (fan-out)│      │ (fan-out)│
//!                   └────┬─────┘      └──────────┘      └──────────┘
//!                        │ bounded queue per peer
//!                        ▼
//!                 read pump / write pump
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — payloads, frames, system messages, errors
//! - [`config`] — queue, heartbeat and echo tuning
//! - [`room`] — per-room command loop with non-blocking fan-out
//! - [`registry`] — lazy room creation, reclamation and shutdown
//! - [`peer`] — read/write pumps and heartbeat
//! - [`transport`] — axum / tungstenite sockets as frame streams
//! - [`origin`] — upgrade origin allow-list
//! - [`server`] — HTTP surface
//! - [`client`] — room client

pub mod protocol;
pub mod config;
pub mod room;
pub mod registry;
pub mod peer;
pub mod transport;
pub mod origin;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    CloseReason, Frame, HubError, Payload, PayloadKind, PeerId, SystemMessage,
};
pub use config::{EchoPolicy, HubConfig};
pub use room::{Room, RoomExit, RoomHandle, RoomSnapshot};
pub use registry::RoomRegistry;
pub use transport::TransportError;
pub use origin::{OriginError, OriginPattern, OriginPolicy, PatternError};
pub use server::{HubServer, ServerConfig};
pub use client::{ClientEvent, ConnectionState, RoomClient};
