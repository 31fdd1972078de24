//! Live peer table.
//!
//! Owned exclusively by the hub task; nothing else mutates it. Each entry
//! carries the peer's outbound relay link, a bounded queue drained by the
//! peer's WebSocket writer.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use cyfr_shared::protocol::{PeerSummary, ServerEnvelope};
use cyfr_shared::PeerId;

/// Outcome of pushing one envelope onto a relay link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The link's queue is full; the envelope was dropped.
    Congested,
    /// The link's receiving side is gone.
    Closed,
}

/// Sending half of a peer's relay link.
#[derive(Debug, Clone)]
pub struct RelayLink {
    tx: mpsc::Sender<ServerEnvelope>,
}

impl RelayLink {
    pub fn new(tx: mpsc::Sender<ServerEnvelope>) -> Self {
        Self { tx }
    }

    /// Create a link together with the receiver its writer drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue an envelope without waiting.
    pub fn deliver(&self, envelope: ServerEnvelope) -> Delivery {
        match self.tx.try_send(envelope) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Congested,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// One registered peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    /// Display name; unset until the peer announces one.
    pub username: Option<String>,
    pub link: RelayLink,
    pub connected_at: DateTime<Utc>,
}

impl PeerEntry {
    pub fn new(peer_id: PeerId, link: RelayLink) -> Self {
        Self {
            peer_id,
            username: None,
            link,
            connected_at: Utc::now(),
        }
    }

    /// Name shown to other peers: the display name, falling back to the id.
    pub fn display_name(&self) -> String {
        self.username
            .clone()
            .unwrap_or_else(|| self.peer_id.to_string())
    }
}

/// Table of currently live peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Insert a new entry. Returns `false` (and leaves the table untouched)
    /// if the id is already live.
    pub fn insert(&mut self, entry: PeerEntry) -> bool {
        if self.peers.contains_key(&entry.peer_id) {
            return false;
        }
        self.peers.insert(entry.peer_id.clone(), entry);
        true
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerEntry> {
        self.peers.remove(peer_id)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerEntry> {
        self.peers.get_mut(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerEntry> {
        self.peers.values()
    }

    /// Ids of every live peer except `exclude`.
    pub fn ids_except(&self, exclude: &PeerId) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .keys()
            .filter(|id| *id != exclude)
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// `peer-list` snapshot for everyone except `exclude`.
    pub fn summaries_except(&self, exclude: &PeerId) -> Vec<PeerSummary> {
        let mut peers: Vec<PeerSummary> = self
            .peers
            .values()
            .filter(|entry| &entry.peer_id != exclude)
            .map(|entry| PeerSummary {
                peer_id: entry.peer_id.clone(),
                username: entry.username.clone(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> (PeerEntry, mpsc::Receiver<ServerEnvelope>) {
        let (link, rx) = RelayLink::channel(4);
        (PeerEntry::new(PeerId::from(id), link), rx)
    }

    #[test]
    fn test_insert_rejects_live_duplicate() {
        let mut registry = PeerRegistry::new();
        let (first, _rx1) = entry("a");
        let (second, _rx2) = entry("a");

        assert!(registry.insert(first));
        assert!(!registry.insert(second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshots_exclude_requester() {
        let mut registry = PeerRegistry::new();
        let (a, _ra) = entry("a");
        let (mut b, _rb) = entry("b");
        b.username = Some("bob".into());
        registry.insert(a);
        registry.insert(b);

        assert_eq!(registry.ids_except(&PeerId::from("a")), vec![PeerId::from("b")]);
        assert_eq!(
            registry.summaries_except(&PeerId::from("a")),
            vec![PeerSummary {
                peer_id: PeerId::from("b"),
                username: Some("bob".into()),
            }]
        );
    }

    #[test]
    fn test_display_name_falls_back_to_id() {
        let (mut e, _rx) = entry("ghost_core_1");
        assert_eq!(e.display_name(), "ghost_core_1");
        e.username = Some("ada".into());
        assert_eq!(e.display_name(), "ada");
    }

    #[test]
    fn test_link_reports_congestion_and_closure() {
        let (link, rx) = RelayLink::channel(1);
        let env = ServerEnvelope::PeerLeft {
            peer_id: PeerId::from("x"),
        };

        assert_eq!(link.deliver(env.clone()), Delivery::Delivered);
        assert_eq!(link.deliver(env.clone()), Delivery::Congested);

        drop(rx);
        assert!(!link.is_open());
        assert_eq!(link.deliver(env), Delivery::Closed);
    }
}
