//! # cyfr-server
//!
//! Rendezvous relay for cyfr peers.
//!
//! - **Peer registry** of live peers, owned by a single hub task
//! - **Relay hub** that assigns ids, announces joins/leaves/renames,
//!   broadcasts chat and forwards offer/answer/candidate envelopes
//!   between two named peers without looking inside them
//! - **HTTP surface** (axum): the relay WebSocket, health and info routes,
//!   and an optional static directory

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod names;
pub mod registry;

pub use config::ServerConfig;
pub use hub::{spawn_hub, HubHandle, RelayHub};
