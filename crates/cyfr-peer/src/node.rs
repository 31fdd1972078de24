//! The peer node task.
//!
//! One tokio task owns the roster, the negotiator and the inbound transfer
//! table. It reacts to three sources: relay envelopes from the relay link,
//! transport events from the connector, and [`NodeCommand`]s from the
//! application. Outbound transfers run in their own tasks so a slow
//! destination never holds up negotiation or other peers.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cyfr_shared::constants::DEFAULT_CONTENT_TYPE;
use cyfr_shared::protocol::{ChannelMessage, ClientEnvelope, DirectMessage, ServerEnvelope};
use cyfr_shared::{PeerId, TransferId};

use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::events::{ChatMessage, ChatVia, PeerEvent, TransferDirection};
use crate::negotiator::{NegotiationState, Negotiator, SessionId};
use crate::relay_link::{spawn_relay_link, LinkState, RelayEvent, RelayLinkHandle};
use crate::roster::Roster;
use crate::transfer::{
    AbandonedTransfer, AnnounceOutcome, ChunkOutcome, Destination, FileMetadata, InboundTransfers,
    OutboundTransfer,
};
use crate::transport::{PeerConnector, TransportEvent};

/// Byte source of an outbound file.
pub type FileSource = Box<dyn AsyncRead + Send + Unpin>;

/// Commands sent *into* the node task.
pub enum NodeCommand {
    /// Broadcast chat through the relay.
    Chat { text: String },
    /// Chat straight over the direct channel to `peer`.
    DirectMessage {
        peer: PeerId,
        text: String,
        reply: oneshot::Sender<Result<(), PeerError>>,
    },
    /// Send a file to `peers`, or to every directly connected peer if empty.
    SendFile {
        metadata: FileMetadata,
        source: FileSource,
        peers: Vec<PeerId>,
        reply: oneshot::Sender<Result<TransferId, PeerError>>,
    },
    /// Tear down the direct session with `peer`.
    Disconnect { peer: PeerId },
    /// Ask the relay for a fresh peer list.
    GetPeers,
    Shutdown,
}

/// Application-side handle to a running node.
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
    relay_state: watch::Receiver<LinkState>,
    task: JoinHandle<()>,
}

impl NodeHandle {
    async fn send(&self, command: NodeCommand) -> Result<(), PeerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PeerError::NodeStopped)
    }

    pub async fn chat(&self, text: impl Into<String>) -> Result<(), PeerError> {
        self.send(NodeCommand::Chat { text: text.into() }).await
    }

    pub async fn direct_message(
        &self,
        peer: PeerId,
        text: impl Into<String>,
    ) -> Result<(), PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::DirectMessage {
            peer,
            text: text.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| PeerError::NodeStopped)?
    }

    pub async fn send_file(
        &self,
        metadata: FileMetadata,
        source: FileSource,
        peers: Vec<PeerId>,
    ) -> Result<TransferId, PeerError> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::SendFile {
            metadata,
            source,
            peers,
            reply,
        })
        .await?;
        rx.await.map_err(|_| PeerError::NodeStopped)?
    }

    /// Send a file from disk, announced under its file name.
    pub async fn send_path(
        &self,
        path: impl AsRef<Path>,
        peers: Vec<PeerId>,
    ) -> Result<TransferId, PeerError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let metadata = FileMetadata {
            name,
            size,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        };
        self.send_file(metadata, Box::new(file), peers).await
    }

    pub async fn disconnect(&self, peer: PeerId) -> Result<(), PeerError> {
        self.send(NodeCommand::Disconnect { peer }).await
    }

    pub async fn request_peers(&self) -> Result<(), PeerError> {
        self.send(NodeCommand::GetPeers).await
    }

    pub fn relay_state(&self) -> LinkState {
        *self.relay_state.borrow()
    }

    /// Stop the node and wait for it to wind down.
    pub async fn shutdown(self) {
        let _ = self.commands.send(NodeCommand::Shutdown).await;
        let _ = self.task.await;
    }
}

/// Spawn a node talking to the relay at `config.relay_url` and opening direct
/// channels through `connector`, whose events arrive on `transport_events`.
///
/// Returns the command handle and the event stream for presentation.
pub fn spawn_node(
    config: PeerConfig,
    connector: Arc<dyn PeerConnector>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
) -> (NodeHandle, mpsc::Receiver<PeerEvent>) {
    let (command_tx, command_rx) = mpsc::channel::<NodeCommand>(256);
    let (event_tx, event_rx) = mpsc::channel::<PeerEvent>(1024);
    let (relay_tx, relay_rx) = mpsc::channel::<RelayEvent>(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let RelayLinkHandle {
        outbox,
        state: link_state,
        task: link_task,
    } = spawn_relay_link(
        config.relay_url.clone(),
        config.reconnect.clone(),
        relay_tx,
        shutdown_rx,
    );
    let relay_state = link_state.clone();

    let node = PeerNode {
        config,
        roster: Roster::new(),
        negotiator: Negotiator::new(connector),
        inbound: InboundTransfers::new(),
        relay: outbox,
        events: event_tx,
    };

    let task = tokio::spawn(async move {
        node.run(command_rx, relay_rx, transport_events, link_state)
            .await;
        let _ = shutdown_tx.send(true);
        let _ = link_task.await;
    });

    (
        NodeHandle {
            commands: command_tx,
            relay_state,
            task,
        },
        event_rx,
    )
}

struct PeerNode {
    config: PeerConfig,
    roster: Roster,
    negotiator: Negotiator,
    inbound: InboundTransfers,
    relay: mpsc::Sender<ClientEnvelope>,
    events: mpsc::Sender<PeerEvent>,
}

impl PeerNode {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<NodeCommand>,
        mut relay_events: mpsc::Receiver<RelayEvent>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut link_state: watch::Receiver<LinkState>,
    ) {
        info!(relay = %self.config.relay_url, "Peer node started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },

                Some(event) = relay_events.recv() => self.handle_relay_event(event).await,

                Some(event) = transport_events.recv() => self.handle_transport_event(event).await,

                Ok(()) = link_state.changed() => {
                    let state = *link_state.borrow_and_update();
                    self.emit(PeerEvent::RelayStatus(state)).await;
                }

                else => break,
            }
        }

        for remote in self.negotiator.close_all().await {
            debug!(peer = %remote, "Closed session on shutdown");
        }
        let abandoned = self.inbound.fail_all();
        self.report_abandoned(abandoned, "node shut down").await;
        info!("Peer node stopped");
    }

    async fn emit(&self, event: PeerEvent) {
        if self.events.send(event).await.is_err() {
            debug!("No event listener, dropping event");
        }
    }

    async fn to_relay(&self, envelope: ClientEnvelope) {
        if self.relay.send(envelope).await.is_err() {
            warn!("Relay link stopped, dropping envelope");
        }
    }

    async fn emit_roster(&self) {
        self.emit(PeerEvent::Roster(self.roster.views())).await;
    }

    async fn emit_session(&self, peer: &PeerId, state: NegotiationState) {
        self.emit(PeerEvent::SessionState {
            peer: peer.clone(),
            state,
        })
        .await;
    }

    async fn report_abandoned(&self, abandoned: Vec<AbandonedTransfer>, reason: &str) {
        for transfer in abandoned {
            warn!(
                peer = %transfer.from,
                transfer = %transfer.transfer_id,
                received = transfer.received,
                reason,
                "Inbound transfer failed"
            );
            self.emit(PeerEvent::TransferFailed {
                transfer_id: transfer.transfer_id,
                direction: TransferDirection::Inbound,
                peer: transfer.from,
                reason: reason.to_string(),
            })
            .await;
        }
    }

    // -----------------------------------------------------------------------
    // Relay
    // -----------------------------------------------------------------------

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected => debug!("Relay connected, awaiting welcome"),
            RelayEvent::Disconnected => debug!("Relay disconnected"),
            RelayEvent::Envelope(envelope) => self.handle_envelope(envelope).await,
        }
    }

    async fn handle_envelope(&mut self, envelope: ServerEnvelope) {
        let envelope = match envelope.into_signal() {
            Ok((kind, from, payload)) => {
                if self.roster.join(from.clone()) {
                    self.emit_roster().await;
                }
                let before = self.negotiator.state(&from);
                match self.negotiator.handle_signal(kind, from.clone(), payload).await {
                    Ok(Some(reply)) => self.to_relay(reply).await,
                    Ok(None) => {}
                    Err(e) => warn!(peer = %from, kind = %kind, error = %e, "Negotiation step failed"),
                }
                let after = self.negotiator.state(&from);
                if let Some(state) = after.filter(|state| Some(*state) != before) {
                    self.emit_session(&from, state).await;
                }
                return;
            }
            Err(other) => other,
        };

        match envelope {
            ServerEnvelope::Welcome { peer_id, peers } => self.on_welcome(peer_id, peers).await,

            ServerEnvelope::PeerJoined { peer_id } => {
                info!(peer = %peer_id, "Peer joined");
                self.roster.join(peer_id.clone());
                if let Err(e) = self.negotiator.expect_offer(peer_id.clone()) {
                    warn!(peer = %peer_id, error = %e, "Cannot prepare session");
                }
                self.emit_roster().await;
                if let Some(state) = self.negotiator.state(&peer_id) {
                    self.emit_session(&peer_id, state).await;
                }
            }

            ServerEnvelope::PeerUpdated { peer_id, username } => {
                debug!(peer = %peer_id, username = %username, "Peer renamed");
                self.roster.rename(&peer_id, username);
                self.emit_roster().await;
            }

            ServerEnvelope::PeerLeft { peer_id } => {
                info!(peer = %peer_id, "Peer left");
                self.roster.leave(&peer_id);
                if self.negotiator.forget(&peer_id).await {
                    self.emit_session(&peer_id, NegotiationState::Closed).await;
                }
                let abandoned = self.inbound.fail_from(&peer_id);
                self.report_abandoned(abandoned, "peer left").await;
                self.emit_roster().await;
            }

            ServerEnvelope::Chat {
                from_peer_id,
                username,
                message,
                timestamp,
            } => {
                self.emit(PeerEvent::Chat(ChatMessage {
                    sender_id: from_peer_id,
                    sender_name: username,
                    text: message,
                    timestamp,
                    via: ChatVia::Relay,
                    own: false,
                }))
                .await;
            }

            ServerEnvelope::PeerList { peers } => {
                self.roster.apply_list(&peers);
                for (peer, _) in self.negotiator.usable_channels() {
                    self.roster.set_direct(&peer, true);
                }
                self.emit_roster().await;
            }

            ServerEnvelope::Offer { .. }
            | ServerEnvelope::Answer { .. }
            | ServerEnvelope::IceCandidate { .. } => {}
        }
    }

    /// A (re)connection: adopt the new id, drop everything tied to the old
    /// one, announce ourselves and start negotiating with every listed peer.
    async fn on_welcome(&mut self, peer_id: PeerId, peers: Vec<PeerId>) {
        info!(peer_id = %peer_id, peers = peers.len(), "Welcomed by relay");

        let closed = self.negotiator.reset(peer_id.clone()).await;
        for remote in &closed {
            self.emit_session(remote, NegotiationState::Closed).await;
        }
        let abandoned = self.inbound.fail_all();
        self.report_abandoned(abandoned, "relay reconnected").await;

        self.roster.reset(&peers);
        self.emit(PeerEvent::Welcome {
            peer_id: peer_id.clone(),
        })
        .await;
        self.emit_roster().await;

        self.to_relay(ClientEnvelope::SetUsername {
            username: self.config.username.clone(),
        })
        .await;

        for remote in peers {
            match self.negotiator.initiate(remote.clone()).await {
                Ok(offer) => {
                    self.to_relay(offer).await;
                    if let Some(state) = self.negotiator.state(&remote) {
                        self.emit_session(&remote, state).await;
                    }
                }
                Err(e) => warn!(peer = %remote, error = %e, "Could not start negotiation"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate { session, candidate } => {
                if let Some(envelope) = self.negotiator.local_candidate(&session, candidate) {
                    self.to_relay(envelope).await;
                }
            }

            TransportEvent::Established { session, channel } => {
                if !self.negotiator.on_established(&session, channel.clone()) {
                    debug!(session = %session, "Channel for stale session, closing it");
                    channel.close().await;
                    return;
                }
                info!(session = %session, "Direct channel established");
                let remote = session.remote;
                if let Some(state) = self.negotiator.state(&remote) {
                    self.emit_session(&remote, state).await;
                }
                if self.roster.set_direct(&remote, true) {
                    self.emit_roster().await;
                }
            }

            TransportEvent::Message { session, data } => {
                self.handle_channel_data(session, data).await;
            }

            TransportEvent::Closed { session } => {
                if !self.negotiator.on_channel_closed(&session).await {
                    return;
                }
                info!(session = %session, "Direct channel closed");
                let remote = session.remote;
                self.emit_session(&remote, NegotiationState::Closed).await;
                let abandoned = self.inbound.fail_from(&remote);
                self.report_abandoned(abandoned, "direct channel closed").await;
                if self.roster.set_direct(&remote, false) {
                    self.emit_roster().await;
                }
            }
        }
    }

    async fn handle_channel_data(&mut self, session: SessionId, data: Vec<u8>) {
        let Some(from) = self.negotiator.remote_of(&session).cloned() else {
            debug!(session = %session, "Data for stale session dropped");
            return;
        };

        let message = match ChannelMessage::from_slice(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %from, error = %e, "Rejected direct channel record");
                return;
            }
        };

        match message {
            ChannelMessage::FileInfo(info) => {
                self.emit(PeerEvent::TransferStarted {
                    transfer_id: info.file_id.clone(),
                    direction: TransferDirection::Inbound,
                    peers: vec![from.clone()],
                    file_name: info.file_name.clone(),
                    size: info.file_size,
                })
                .await;
                if let AnnounceOutcome::Complete(file) = self.inbound.on_announcement(&from, &info) {
                    self.emit(PeerEvent::FileReceived(file)).await;
                }
            }

            ChannelMessage::FileChunk(chunk) => {
                let transfer_id = chunk.file_id.clone();
                match self.inbound.on_chunk(&from, chunk) {
                    ChunkOutcome::Dropped => {}
                    ChunkOutcome::Progress { received, total } => {
                        self.emit(PeerEvent::TransferProgress {
                            transfer_id,
                            direction: TransferDirection::Inbound,
                            done: received,
                            total,
                        })
                        .await;
                    }
                    ChunkOutcome::Complete(file) => {
                        debug!(peer = %from, transfer = %transfer_id, bytes = file.data.len(), "Inbound transfer complete");
                        self.emit(PeerEvent::FileReceived(file)).await;
                    }
                }
            }

            ChannelMessage::DirectMessage(DirectMessage { content, timestamp }) => {
                self.emit(PeerEvent::Chat(ChatMessage {
                    sender_name: self.roster.display_name(&from),
                    sender_id: from,
                    text: content,
                    timestamp: timestamp.unwrap_or_else(Utc::now),
                    via: ChatVia::Direct,
                    own: false,
                }))
                .await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn own_chat(&self, text: String, via: ChatVia) -> Option<PeerEvent> {
        let local = self.negotiator.local_id()?.clone();
        Some(PeerEvent::Chat(ChatMessage {
            sender_id: local,
            sender_name: self.config.username.clone(),
            text,
            timestamp: Utc::now(),
            via,
            own: true,
        }))
    }

    async fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::Chat { text } => {
                if self.negotiator.local_id().is_none() {
                    warn!("Not connected to the relay, chat dropped");
                    return;
                }
                self.to_relay(ClientEnvelope::Chat {
                    message: text.clone(),
                })
                .await;
                if let Some(echo) = self.own_chat(text, ChatVia::Relay) {
                    self.emit(echo).await;
                }
            }

            NodeCommand::DirectMessage { peer, text, reply } => {
                let result = self.direct_message(&peer, &text).await;
                if result.is_ok() {
                    if let Some(echo) = self.own_chat(text, ChatVia::Direct) {
                        self.emit(echo).await;
                    }
                }
                let _ = reply.send(result);
            }

            NodeCommand::SendFile {
                metadata,
                source,
                peers,
                reply,
            } => {
                let _ = reply.send(self.start_transfer(metadata, source, peers).await);
            }

            NodeCommand::Disconnect { peer } => {
                if self.negotiator.close(&peer).await {
                    info!(peer = %peer, "Direct session closed locally");
                    self.emit_session(&peer, NegotiationState::Closed).await;
                    let abandoned = self.inbound.fail_from(&peer);
                    self.report_abandoned(abandoned, "disconnected").await;
                    if self.roster.set_direct(&peer, false) {
                        self.emit_roster().await;
                    }
                }
            }

            NodeCommand::GetPeers => self.to_relay(ClientEnvelope::GetPeers).await,

            NodeCommand::Shutdown => {}
        }
    }

    async fn direct_message(&self, peer: &PeerId, text: &str) -> Result<(), PeerError> {
        let channel = self
            .negotiator
            .channel(peer)
            .ok_or_else(|| PeerError::NoDirectChannel(peer.to_string()))?;
        let record = ChannelMessage::DirectMessage(DirectMessage {
            content: text.to_string(),
            timestamp: Some(Utc::now()),
        })
        .to_bytes()?;
        channel.send(record).await?;
        Ok(())
    }

    async fn start_transfer(
        &self,
        metadata: FileMetadata,
        source: FileSource,
        peers: Vec<PeerId>,
    ) -> Result<TransferId, PeerError> {
        let destinations = if peers.is_empty() {
            self.negotiator
                .usable_channels()
                .into_iter()
                .map(|(peer, channel)| Destination { peer, channel })
                .collect()
        } else {
            peers
                .into_iter()
                .map(|peer| {
                    let channel = self
                        .negotiator
                        .channel(&peer)
                        .ok_or_else(|| PeerError::NoDirectChannel(peer.to_string()))?;
                    Ok(Destination { peer, channel })
                })
                .collect::<Result<Vec<_>, PeerError>>()?
        };

        let transfer = OutboundTransfer::new(
            metadata,
            destinations,
            self.config.chunk_size,
            self.config.chunk_pacing,
        )?;
        let transfer_id = transfer.id().clone();
        let file_name = transfer.metadata().name.clone();
        let peers = transfer.peers();

        self.emit(PeerEvent::TransferStarted {
            transfer_id: transfer_id.clone(),
            direction: TransferDirection::Outbound,
            peers: peers.clone(),
            file_name: file_name.clone(),
            size: transfer.metadata().size,
        })
        .await;

        let events = self.events.clone();
        let id = transfer_id.clone();
        tokio::spawn(async move {
            let progress_events = events.clone();
            let progress_id = id.clone();
            let result = transfer
                .run(source, move |done, total| {
                    // Progress is advisory; a full event queue skips an update.
                    let _ = progress_events.try_send(PeerEvent::TransferProgress {
                        transfer_id: progress_id.clone(),
                        direction: TransferDirection::Outbound,
                        done,
                        total,
                    });
                })
                .await;

            match result {
                Ok(report) => {
                    for (peer, error) in report.failed {
                        let _ = events
                            .send(PeerEvent::TransferFailed {
                                transfer_id: id.clone(),
                                direction: TransferDirection::Outbound,
                                peer,
                                reason: error.to_string(),
                            })
                            .await;
                    }
                    let _ = events
                        .send(PeerEvent::TransferSent {
                            transfer_id: id,
                            file_name,
                            delivered: report.delivered,
                        })
                        .await;
                }
                Err(e) => {
                    warn!(transfer = %id, error = %e, "Outbound transfer aborted");
                    for peer in peers {
                        let _ = events
                            .send(PeerEvent::TransferFailed {
                                transfer_id: id.clone(),
                                direction: TransferDirection::Outbound,
                                peer,
                                reason: e.to_string(),
                            })
                            .await;
                    }
                }
            }
        });

        Ok(transfer_id)
    }
}
