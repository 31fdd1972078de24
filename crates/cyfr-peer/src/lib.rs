//! # cyfr-peer
//!
//! Peer-side core: negotiates direct channels through the relay and moves
//! chat and chunked files over them.
//!
//! - [`negotiator`]: per-remote-peer offer/answer/candidate state machine
//! - [`transfer`]: chunking, paced fan-out sending and index-based reassembly
//! - [`transport`]: the seam to whatever actually opens direct channels
//! - [`relay_link`]: WebSocket link to the relay with a reconnect supervisor
//! - [`node`]: the task tying relay, negotiator, transport and transfers together

pub mod backoff;
pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod negotiator;
pub mod node;
pub mod relay_link;
pub mod roster;
pub mod transfer;
pub mod transport;

pub use config::PeerConfig;
pub use error::PeerError;
pub use events::PeerEvent;
pub use node::{spawn_node, NodeCommand, NodeHandle};
pub use transport::{DirectChannel, PeerConnector, TransportEvent};
