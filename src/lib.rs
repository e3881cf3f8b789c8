//! Room-based WebSocket Chat Hub Library
//!
//! Clients connect to a named room over WebSocket and exchange text
//! messages with everyone else currently in that room.
//!
//! # Features
//! - Room and identity admitted from the upgrade request
//! - Rooms created on first join and removed on last leave
//! - Join, leave, chat and system envelopes with RFC3339 timestamps
//! - Bounded per-client queues: a slow client loses messages, it never
//!   stalls the hub or other clients
//! - Ping/idle-timeout liveness checks
//! - Membership snapshots for status queries
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `Hub` is the central actor owning every room and client
//! - Each connection runs an inbound and an outbound pump
//! - No locks needed - all state access goes through message passing
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use movie_chat::{handle_connection, AdapterConfig, HubConfig, HubHandle};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let (hub, handle) = HubHandle::channel(256, HubConfig::default());
//!
//!     tokio::spawn(hub.run());
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         let handle = handle.clone();
//!         tokio::spawn(handle_connection(stream, handle, AdapterConfig::default()));
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod hub;
pub mod message;
pub mod room;
pub mod types;

// Re-export main types for convenience
pub use client::Client;
pub use config::{AdapterConfig, Config};
pub use error::{AdmissionError, AppError, ConfigError, DecodeError, SendError};
pub use handler::{handle_connection, serve};
pub use hub::{Hub, HubCommand, HubConfig, HubHandle, Registration};
pub use message::{Envelope, EnvelopeKind, InboundFrame, MemberInfo};
pub use room::{Room, RoomSummary};
pub use types::{ClientId, ClientIdentity, RoomId};
