//! Client-side view of the other peers on the relay.

use std::collections::BTreeMap;

use cyfr_shared::protocol::PeerSummary;
use cyfr_shared::PeerId;

use crate::events::PeerView;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RosterEntry {
    username: Option<String>,
    direct: bool,
}

#[derive(Debug, Default)]
pub struct Roster {
    peers: BTreeMap<PeerId, RosterEntry>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole roster with the ids listed in a `welcome`.
    pub fn reset(&mut self, peers: &[PeerId]) {
        self.peers = peers
            .iter()
            .map(|id| (id.clone(), RosterEntry::default()))
            .collect();
    }

    /// Returns `false` if the peer was already known.
    pub fn join(&mut self, peer: PeerId) -> bool {
        if self.peers.contains_key(&peer) {
            return false;
        }
        self.peers.insert(peer, RosterEntry::default());
        true
    }

    pub fn leave(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer).is_some()
    }

    pub fn rename(&mut self, peer: &PeerId, username: String) {
        self.peers.entry(peer.clone()).or_default().username = Some(username);
    }

    /// Adopt a `peer-list` snapshot: unknown peers are added, absent ones
    /// removed, names refreshed. Direct-channel flags survive.
    pub fn apply_list(&mut self, list: &[PeerSummary]) {
        let mut next = BTreeMap::new();
        for summary in list {
            let mut entry = self.peers.remove(&summary.peer_id).unwrap_or_default();
            if summary.username.is_some() {
                entry.username = summary.username.clone();
            }
            next.insert(summary.peer_id.clone(), entry);
        }
        self.peers = next;
    }

    pub fn set_direct(&mut self, peer: &PeerId, direct: bool) -> bool {
        match self.peers.get_mut(peer) {
            Some(entry) if entry.direct != direct => {
                entry.direct = direct;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Username if announced, otherwise the peer id.
    pub fn display_name(&self, peer: &PeerId) -> String {
        self.peers
            .get(peer)
            .and_then(|entry| entry.username.clone())
            .unwrap_or_else(|| peer.to_string())
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    pub fn views(&self) -> Vec<PeerView> {
        self.peers
            .iter()
            .map(|(peer_id, entry)| PeerView {
                peer_id: peer_id.clone(),
                username: entry.username.clone(),
                direct: entry.direct,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
