//! Seam between the negotiator and whatever actually opens direct channels.
//!
//! A [`PeerConnector`] turns session descriptions and candidates into a
//! reliable, ordered [`DirectChannel`]. Everything the connector observes
//! asynchronously (locally gathered candidates, channel establishment,
//! inbound data, closure) comes back to the node as a [`TransportEvent`]
//! tagged with the [`SessionId`] it belongs to.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::negotiator::{Candidate, Description, SessionId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Direct channel is closed")]
    ChannelClosed,

    #[error("Message of {size} bytes exceeds channel limit of {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Unknown transport session {0}")]
    UnknownSession(String),

    #[error("Transport rejected the request: {0}")]
    Rejected(String),
}

/// A reliable, ordered message channel to one remote peer.
#[async_trait]
pub trait DirectChannel: Send + Sync + std::fmt::Debug {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Close the channel. The remote side observes [`TransportEvent::Closed`].
    async fn close(&self);

    /// Largest message the channel delivers reliably, in bytes.
    fn max_message_size(&self) -> usize;
}

/// Opens direct channels from exchanged descriptions.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Produce the local offer for an initiator session.
    async fn create_offer(&self, session: &SessionId) -> Result<Description, TransportError>;

    /// Apply a remote offer and produce the local answer.
    async fn accept_offer(
        &self,
        session: &SessionId,
        offer: &Description,
    ) -> Result<Description, TransportError>;

    async fn apply_answer(
        &self,
        session: &SessionId,
        answer: &Description,
    ) -> Result<(), TransportError>;

    async fn add_candidate(
        &self,
        session: &SessionId,
        candidate: &Candidate,
    ) -> Result<(), TransportError>;

    /// Tear the session down. Unknown sessions are ignored.
    async fn close(&self, session: &SessionId);
}

#[derive(Debug)]
pub enum TransportEvent {
    /// A candidate gathered locally, to be signalled to the remote peer.
    LocalCandidate {
        session: SessionId,
        candidate: Candidate,
    },
    Established {
        session: SessionId,
        channel: Arc<dyn DirectChannel>,
    },
    Message {
        session: SessionId,
        data: Vec<u8>,
    },
    /// The remote side closed the channel or the transport lost it.
    Closed { session: SessionId },
}

impl TransportEvent {
    pub fn session(&self) -> &SessionId {
        match self {
            TransportEvent::LocalCandidate { session, .. }
            | TransportEvent::Established { session, .. }
            | TransportEvent::Message { session, .. }
            | TransportEvent::Closed { session } => session,
        }
    }
}
