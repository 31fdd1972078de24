//! Events a running node hands to whatever presents it (CLI, UI, tests).

use chrono::{DateTime, Utc};

use cyfr_shared::{PeerId, TransferId};

use crate::negotiator::NegotiationState;
use crate::relay_link::LinkState;
use crate::transfer::ReceivedFile;

/// How a chat message travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatVia {
    Relay,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender_id: PeerId,
    pub sender_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub via: ChatVia,
    /// Set for messages this node sent itself.
    pub own: bool,
}

/// One remote peer as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    pub peer_id: PeerId,
    pub username: Option<String>,
    /// A usable direct channel exists.
    pub direct: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The relay assigned this node an id.
    Welcome { peer_id: PeerId },

    /// Snapshot of the known remote peers, sorted by id.
    Roster(Vec<PeerView>),

    Chat(ChatMessage),

    SessionState {
        peer: PeerId,
        state: NegotiationState,
    },

    TransferStarted {
        transfer_id: TransferId,
        direction: TransferDirection,
        peers: Vec<PeerId>,
        file_name: String,
        size: u64,
    },

    TransferProgress {
        transfer_id: TransferId,
        direction: TransferDirection,
        done: u32,
        total: u32,
    },

    FileReceived(ReceivedFile),

    TransferFailed {
        transfer_id: TransferId,
        direction: TransferDirection,
        peer: PeerId,
        reason: String,
    },

    /// An outbound transfer finished for every destination.
    TransferSent {
        transfer_id: TransferId,
        file_name: String,
        delivered: Vec<PeerId>,
    },

    RelayStatus(LinkState),
}
