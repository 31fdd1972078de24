//! # cyfr-shared
//!
//! Wire vocabulary shared by the relay hub and the peers: identifiers,
//! control-plane envelopes carried over the relay, and the records that
//! travel over an established direct channel.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use types::{PeerId, TransferId};
