//! Relay hub: identity assignment, membership broadcast, chat relay and
//! blind forwarding of negotiation envelopes.
//!
//! [`RelayHub`] holds the logic and the [`PeerRegistry`]. [`spawn_hub`] moves
//! it into a dedicated tokio task so that every registry mutation is
//! serialized; connection tasks talk to it through a [`HubHandle`].

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use cyfr_shared::protocol::{ClientEnvelope, PeerSummary, ServerEnvelope, SignalKind};
use cyfr_shared::PeerId;

use crate::error::HubError;
use crate::names::{random_peer_id, ID_SPACE};
use crate::registry::{Delivery, PeerEntry, PeerRegistry, RelayLink};

/// Source of candidate peer ids; the hub re-rolls until one is free.
pub type IdSource = Box<dyn FnMut() -> PeerId + Send>;

/// Capacity of the command channel between connection tasks and the hub.
const HUB_COMMAND_BUFFER: usize = 1024;

pub struct RelayHub {
    registry: PeerRegistry,
    id_source: IdSource,
    max_peers: usize,
}

impl RelayHub {
    /// Create a hub rolling ids from the adjective/noun/number vocabulary.
    /// `max_peers == 0` means no configured limit.
    pub fn new(max_peers: usize) -> Self {
        let mut rng = StdRng::from_entropy();
        Self::with_id_source(max_peers, Box::new(move || random_peer_id(&mut rng)))
    }

    pub fn with_id_source(max_peers: usize, id_source: IdSource) -> Self {
        Self {
            registry: PeerRegistry::new(),
            id_source,
            max_peers,
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    fn capacity(&self) -> usize {
        if self.max_peers == 0 {
            ID_SPACE
        } else {
            self.max_peers.min(ID_SPACE)
        }
    }

    /// Register a new peer behind `link`.
    ///
    /// The peer's `welcome` is queued on its own link before the join is
    /// announced to anyone else.
    pub fn register(&mut self, link: RelayLink) -> Result<PeerId, HubError> {
        if self.registry.len() >= self.capacity() {
            warn!(peers = self.registry.len(), "Registration refused: relay full");
            return Err(HubError::Full {
                max: self.capacity(),
            });
        }

        let peer_id = loop {
            let candidate = (self.id_source)();
            if !self.registry.contains(&candidate) {
                break candidate;
            }
            debug!(id = %candidate, "Peer id collision, re-rolling");
        };

        let peers = self.registry.ids_except(&peer_id);
        let welcome = ServerEnvelope::Welcome {
            peer_id: peer_id.clone(),
            peers,
        };
        if link.deliver(welcome) != Delivery::Delivered {
            warn!(peer = %peer_id, "Welcome could not be queued");
        }

        self.registry.insert(PeerEntry::new(peer_id.clone(), link));

        self.broadcast(
            ServerEnvelope::PeerJoined {
                peer_id: peer_id.clone(),
            },
            Some(&peer_id),
        );

        info!(peer = %peer_id, total = self.registry.len(), "Peer connected");
        Ok(peer_id)
    }

    /// Store a display name and announce it to the other peers.
    ///
    /// The name is trimmed; empty names and renames after the first accepted
    /// name are ignored. Returns whether the name was accepted.
    pub fn set_display_name(&mut self, peer_id: &PeerId, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            debug!(peer = %peer_id, "Ignoring empty display name");
            return false;
        }

        let Some(entry) = self.registry.get_mut(peer_id) else {
            return false;
        };
        if let Some(existing) = &entry.username {
            warn!(peer = %peer_id, name = %existing, "Display name already set, ignoring rename");
            return false;
        }
        entry.username = Some(name.to_string());

        debug!(peer = %peer_id, name = %name, "Display name set");
        self.broadcast(
            ServerEnvelope::PeerUpdated {
                peer_id: peer_id.clone(),
                username: name.to_string(),
            },
            Some(peer_id),
        );
        true
    }

    /// Forward a negotiation envelope to `to`, attaching `from`.
    ///
    /// The payload is passed through untouched. Unknown or closed
    /// destinations drop the envelope silently.
    pub fn forward(&mut self, kind: SignalKind, from: &PeerId, to: &PeerId, payload: Value) -> bool {
        let Some(target) = self.registry.get(to) else {
            debug!(kind = %kind, from = %from, to = %to, "Dropping envelope for unknown peer");
            return false;
        };
        if !target.link.is_open() {
            debug!(kind = %kind, from = %from, to = %to, "Dropping envelope for closed link");
            return false;
        }

        let envelope = ServerEnvelope::forwarded(kind, from.clone(), to.clone(), payload);
        match target.link.deliver(envelope) {
            Delivery::Delivered => {
                debug!(kind = %kind, from = %from, to = %to, "Forwarded envelope");
                true
            }
            Delivery::Congested => {
                warn!(kind = %kind, to = %to, "Dropping envelope for slow peer");
                false
            }
            Delivery::Closed => false,
        }
    }

    /// Relay a chat message to every other live peer.
    pub fn broadcast_chat(&mut self, from: &PeerId, text: &str) {
        let Some(sender) = self.registry.get(from) else {
            return;
        };
        if text.trim().is_empty() {
            return;
        }

        let envelope = ServerEnvelope::Chat {
            from_peer_id: from.clone(),
            username: sender.display_name(),
            message: text.to_string(),
            timestamp: chrono::Utc::now(),
        };
        self.broadcast(envelope, Some(from));
    }

    /// Answer a `get-peers` request on the requester's own link.
    pub fn send_peer_list(&mut self, requester: &PeerId) {
        let peers = self.registry.summaries_except(requester);
        if let Some(entry) = self.registry.get(requester) {
            entry.link.deliver(ServerEnvelope::PeerList { peers });
        }
    }

    /// Remove a peer and announce its departure. Idempotent.
    pub fn unregister(&mut self, peer_id: &PeerId) -> bool {
        if self.registry.remove(peer_id).is_none() {
            return false;
        }

        info!(peer = %peer_id, total = self.registry.len(), "Peer disconnected");
        self.broadcast(
            ServerEnvelope::PeerLeft {
                peer_id: peer_id.clone(),
            },
            None,
        );
        true
    }

    /// Dispatch one envelope received from `from`.
    pub fn handle_envelope(&mut self, from: &PeerId, envelope: ClientEnvelope) {
        if !self.registry.contains(from) {
            debug!(peer = %from, "Envelope from unregistered peer ignored");
            return;
        }

        match envelope {
            ClientEnvelope::SetUsername { username } => {
                self.set_display_name(from, &username);
            }
            ClientEnvelope::Chat { message } => self.broadcast_chat(from, &message),
            ClientEnvelope::GetPeers => self.send_peer_list(from),
            signal @ (ClientEnvelope::Offer { .. }
            | ClientEnvelope::Answer { .. }
            | ClientEnvelope::IceCandidate { .. }) => {
                if let Ok((kind, to, payload)) = signal.into_signal() {
                    self.forward(kind, from, &to, payload);
                }
            }
        }
    }

    fn broadcast(&self, envelope: ServerEnvelope, exclude: Option<&PeerId>) {
        for entry in self.registry.iter() {
            if Some(&entry.peer_id) == exclude {
                continue;
            }
            if entry.link.deliver(envelope.clone()) == Delivery::Congested {
                warn!(peer = %entry.peer_id, "Dropping broadcast for slow peer");
            }
        }
    }

    /// Process commands until every [`HubHandle`] has been dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<HubCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                HubCommand::Register { link, reply } => {
                    let result = self.register(link);
                    if let (Err(_), Ok(peer_id)) = (reply.send(result.clone()), result) {
                        // The connection went away before learning its id.
                        self.unregister(&peer_id);
                    }
                }
                HubCommand::Envelope { from, envelope } => self.handle_envelope(&from, envelope),
                HubCommand::Unregister { peer_id } => {
                    self.unregister(&peer_id);
                }
                HubCommand::PeerCount { reply } => {
                    let _ = reply.send(self.registry.len());
                }
                HubCommand::Snapshot { reply } => {
                    let mut peers: Vec<PeerSummary> = self
                        .registry
                        .iter()
                        .map(|entry| PeerSummary {
                            peer_id: entry.peer_id.clone(),
                            username: entry.username.clone(),
                        })
                        .collect();
                    peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
                    let _ = reply.send(peers);
                }
            }
        }
        debug!("Hub command channel closed, stopping");
    }
}

// ---------------------------------------------------------------------------
// Task handle
// ---------------------------------------------------------------------------

/// Commands sent *into* the hub task.
#[derive(Debug)]
pub enum HubCommand {
    Register {
        link: RelayLink,
        reply: oneshot::Sender<Result<PeerId, HubError>>,
    },
    Envelope {
        from: PeerId,
        envelope: ClientEnvelope,
    },
    Unregister {
        peer_id: PeerId,
    },
    PeerCount {
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<PeerSummary>>,
    },
}

/// Cloneable handle to a running hub task.
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    max_peers: usize,
}

impl HubHandle {
    pub async fn register(&self, link: RelayLink) -> Result<PeerId, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Register { link, reply })
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    pub async fn submit(&self, from: PeerId, envelope: ClientEnvelope) -> Result<(), HubError> {
        self.tx
            .send(HubCommand::Envelope { from, envelope })
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn unregister(&self, peer_id: PeerId) -> Result<(), HubError> {
        self.tx
            .send(HubCommand::Unregister { peer_id })
            .await
            .map_err(|_| HubError::Closed)
    }

    pub async fn peer_count(&self) -> Result<usize, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::PeerCount { reply })
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn snapshot(&self) -> Result<Vec<PeerSummary>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HubCommand::Snapshot { reply })
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Configured peer limit (0 = unlimited).
    pub fn max_peers(&self) -> usize {
        self.max_peers
    }
}

/// Spawn the hub in a background tokio task and return its handle.
pub fn spawn_hub(hub: RelayHub) -> HubHandle {
    let (tx, rx) = mpsc::channel(HUB_COMMAND_BUFFER);
    let max_peers = hub.max_peers;
    tokio::spawn(hub.run(rx));
    HubHandle { tx, max_peers }
}
