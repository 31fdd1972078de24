use thiserror::Error;

use cyfr_shared::ProtocolError;

use crate::transfer::TransferError;
use crate::transport::TransportError;

/// Errors surfaced to users of a peer node.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Peer node has stopped")]
    NodeStopped,

    #[error("No direct channel to {0}")]
    NoDirectChannel(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
