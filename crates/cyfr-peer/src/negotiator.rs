//! Per-remote-peer negotiation of direct channels.
//!
//! Every remote peer has at most one live [`NegotiationSession`]. A session
//! is identified by a [`SessionId`] carrying a generation counter, so events
//! from a torn-down session can never be mistaken for events of a fresh
//! negotiation with the same peer.
//!
//! ```text
//! initiator:  Idle -> OfferCreated -> AnswerAwaited -> Connected
//! responder:  ResponderAwaitingOffer -> AnswerCreated -> Connected
//! any state:  -> Closed
//! ```
//!
//! The [`Negotiator`] drives those sessions from relay signals and talks to
//! the transport through a [`PeerConnector`]. It never panics on a bad
//! envelope: malformed payloads and out-of-state signals come back as
//! [`NegotiationError`] with the session left as it was.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use cyfr_shared::protocol::{ClientEnvelope, SignalKind};
use cyfr_shared::PeerId;

use crate::transport::{DirectChannel, PeerConnector, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    OfferCreated,
    AnswerAwaited,
    ResponderAwaitingOffer,
    AnswerCreated,
    Connected,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferCreated => "offer-created",
            NegotiationState::AnswerAwaited => "answer-awaited",
            NegotiationState::ResponderAwaitingOffer => "responder-awaiting-offer",
            NegotiationState::AnswerCreated => "answer-created",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Identity of one negotiation attempt between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub local: PeerId,
    pub remote: PeerId,
    pub generation: u64,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}#{}", self.local, self.remote, self.generation)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NegotiationError {
    #[error("Malformed session description: {0}")]
    MalformedDescription(&'static str),

    #[error("Malformed candidate: {0}")]
    MalformedCandidate(&'static str),

    #[error("Unexpected {kind} while {state}")]
    UnexpectedSignal {
        state: NegotiationState,
        kind: SignalKind,
    },

    #[error("No relay-assigned id yet")]
    NotRegistered,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// An opaque session description (offer or answer).
///
/// Only the shape is checked: a JSON object with a string `sdp` field.
/// The rest of the payload is carried untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Description(Value);

impl Description {
    pub fn parse(value: Value) -> Result<Self, NegotiationError> {
        match value.get("sdp") {
            Some(Value::String(_)) => Ok(Self(value)),
            Some(_) => Err(NegotiationError::MalformedDescription("`sdp` is not a string")),
            None => Err(NegotiationError::MalformedDescription(
                "expected an object with an `sdp` field",
            )),
        }
    }

    pub fn sdp(&self) -> &str {
        self.0.get("sdp").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// An opaque transport routing hint: a JSON object with a string `candidate`.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate(Value);

impl Candidate {
    pub fn parse(value: Value) -> Result<Self, NegotiationError> {
        match value.get("candidate") {
            Some(Value::String(_)) => Ok(Self(value)),
            Some(_) => Err(NegotiationError::MalformedCandidate(
                "`candidate` is not a string",
            )),
            None => Err(NegotiationError::MalformedCandidate(
                "expected an object with a `candidate` field",
            )),
        }
    }

    pub fn candidate(&self) -> &str {
        self.0
            .get("candidate")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// What to do with a candidate that just arrived for a session.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateDisposition {
    Apply(Candidate),
    Queued,
    Dropped,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct NegotiationSession {
    id: SessionId,
    role: Role,
    state: NegotiationState,
    has_local_description: bool,
    pending_candidates: VecDeque<Candidate>,
    channel: Option<Arc<dyn DirectChannel>>,
}

impl NegotiationSession {
    fn new(id: SessionId, role: Role) -> Self {
        let state = match role {
            Role::Initiator => NegotiationState::Idle,
            Role::Responder => NegotiationState::ResponderAwaitingOffer,
        };
        Self {
            id,
            role,
            state,
            has_local_description: false,
            pending_candidates: VecDeque::new(),
            channel: None,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn has_local_description(&self) -> bool {
        self.has_local_description
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn channel(&self) -> Option<&Arc<dyn DirectChannel>> {
        self.channel.as_ref()
    }

    /// Connected, holding a channel, and that channel is still open.
    pub fn is_usable(&self) -> bool {
        self.state == NegotiationState::Connected
            && self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    fn require(&self, expected: NegotiationState, kind: SignalKind) -> Result<(), NegotiationError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(NegotiationError::UnexpectedSignal {
                state: self.state,
                kind,
            })
        }
    }

    /// The local offer exists: `Idle -> OfferCreated`.
    pub fn record_offer(&mut self) -> Result<(), NegotiationError> {
        self.require(NegotiationState::Idle, SignalKind::Offer)?;
        self.state = NegotiationState::OfferCreated;
        self.has_local_description = true;
        Ok(())
    }

    /// The offer went out through the relay: `OfferCreated -> AnswerAwaited`.
    pub fn mark_offer_sent(&mut self) -> Result<(), NegotiationError> {
        self.require(NegotiationState::OfferCreated, SignalKind::Offer)?;
        self.state = NegotiationState::AnswerAwaited;
        Ok(())
    }

    /// Remote offer applied and local answer produced.
    pub fn record_answer(&mut self) -> Result<(), NegotiationError> {
        self.require(NegotiationState::ResponderAwaitingOffer, SignalKind::Offer)?;
        self.state = NegotiationState::AnswerCreated;
        self.has_local_description = true;
        Ok(())
    }

    /// Remote answer applied: `AnswerAwaited -> Connected`.
    pub fn answer_applied(&mut self) -> Result<(), NegotiationError> {
        self.require(NegotiationState::AnswerAwaited, SignalKind::Answer)?;
        self.state = NegotiationState::Connected;
        Ok(())
    }

    /// The transport reports the channel open. Returns `false` if the session
    /// can no longer take a channel.
    pub fn transport_established(&mut self, channel: Arc<dyn DirectChannel>) -> bool {
        match self.state {
            NegotiationState::Closed | NegotiationState::Idle => false,
            NegotiationState::AnswerCreated => {
                self.state = NegotiationState::Connected;
                self.channel = Some(channel);
                true
            }
            _ => {
                self.channel = Some(channel);
                true
            }
        }
    }

    pub fn receive_candidate(&mut self, candidate: Candidate) -> CandidateDisposition {
        if self.state == NegotiationState::Closed {
            CandidateDisposition::Dropped
        } else if !self.has_local_description {
            self.pending_candidates.push_back(candidate);
            CandidateDisposition::Queued
        } else {
            CandidateDisposition::Apply(candidate)
        }
    }

    /// Queued candidates in arrival order.
    pub fn take_pending_candidates(&mut self) -> Vec<Candidate> {
        self.pending_candidates.drain(..).collect()
    }

    /// Enter `Closed`, purge queued candidates and hand back the channel.
    pub fn close(&mut self) -> Option<Arc<dyn DirectChannel>> {
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();
        self.channel.take()
    }
}

// ---------------------------------------------------------------------------
// Session table
// ---------------------------------------------------------------------------

/// All sessions of one local node, keyed by remote peer.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<PeerId, NegotiationSession>,
    next_generation: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a brand-new session with `remote`, returning the one it replaces.
    pub fn start(
        &mut self,
        local: PeerId,
        remote: PeerId,
        role: Role,
    ) -> (SessionId, Option<NegotiationSession>) {
        let session = self.prepare(local, remote, role);
        let id = session.id.clone();
        (id, self.install(session))
    }

    /// Allocate the next generation for `remote` without making it current.
    pub fn prepare(&mut self, local: PeerId, remote: PeerId, role: Role) -> NegotiationSession {
        self.next_generation += 1;
        let id = SessionId {
            local,
            remote,
            generation: self.next_generation,
        };
        NegotiationSession::new(id, role)
    }

    /// Make `session` current for its remote, returning the one it replaces.
    pub fn install(&mut self, session: NegotiationSession) -> Option<NegotiationSession> {
        self.sessions.insert(session.id.remote.clone(), session)
    }

    pub fn get(&self, remote: &PeerId) -> Option<&NegotiationSession> {
        self.sessions.get(remote)
    }

    pub fn get_mut(&mut self, remote: &PeerId) -> Option<&mut NegotiationSession> {
        self.sessions.get_mut(remote)
    }

    /// The session only if `id` is still its current generation.
    pub fn current_mut(&mut self, id: &SessionId) -> Option<&mut NegotiationSession> {
        self.sessions
            .get_mut(&id.remote)
            .filter(|session| session.id == *id)
    }

    pub fn is_current(&self, id: &SessionId) -> bool {
        self.sessions
            .get(&id.remote)
            .is_some_and(|session| session.id == *id)
    }

    pub fn remove(&mut self, remote: &PeerId) -> Option<NegotiationSession> {
        self.sessions.remove(remote)
    }

    pub fn drain(&mut self) -> Vec<NegotiationSession> {
        self.sessions.drain().map(|(_, session)| session).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NegotiationSession> {
        self.sessions.values()
    }
}

/// Offer collision rule: the peer with the lexicographically smaller id yields.
pub fn is_polite(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}

// ---------------------------------------------------------------------------
// Negotiator
// ---------------------------------------------------------------------------

pub struct Negotiator {
    local: Option<PeerId>,
    sessions: SessionTable,
    connector: Arc<dyn PeerConnector>,
}

impl Negotiator {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            local: None,
            sessions: SessionTable::new(),
            connector,
        }
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local.as_ref()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn state(&self, remote: &PeerId) -> Option<NegotiationState> {
        self.sessions.get(remote).map(NegotiationSession::state)
    }

    /// Open channel to `remote`, if the session is usable.
    pub fn channel(&self, remote: &PeerId) -> Option<Arc<dyn DirectChannel>> {
        self.sessions
            .get(remote)
            .filter(|session| session.is_usable())
            .and_then(|session| session.channel.clone())
    }

    pub fn usable_channels(&self) -> Vec<(PeerId, Arc<dyn DirectChannel>)> {
        let mut channels: Vec<_> = self
            .sessions
            .iter()
            .filter(|session| session.is_usable())
            .filter_map(|session| {
                session
                    .channel
                    .clone()
                    .map(|channel| (session.id.remote.clone(), channel))
            })
            .collect();
        channels.sort_by(|a, b| a.0.cmp(&b.0));
        channels
    }

    /// Adopt a fresh relay-assigned id. Every session of the previous id is
    /// closed; their remotes are returned.
    pub async fn reset(&mut self, local: PeerId) -> Vec<PeerId> {
        let closed = self.close_all().await;
        self.local = Some(local);
        closed
    }

    pub async fn close_all(&mut self) -> Vec<PeerId> {
        let mut remotes = Vec::new();
        for mut session in self.sessions.drain() {
            if session.state() != NegotiationState::Closed {
                remotes.push(session.id.remote.clone());
            }
            self.teardown(&mut session).await;
        }
        remotes.sort();
        remotes
    }

    async fn teardown(&self, session: &mut NegotiationSession) {
        if let Some(channel) = session.close() {
            channel.close().await;
        }
        self.connector.close(&session.id).await;
    }

    /// Start negotiating as initiator and return the offer envelope to relay.
    pub async fn initiate(&mut self, remote: PeerId) -> Result<ClientEnvelope, NegotiationError> {
        let local = self.local.clone().ok_or(NegotiationError::NotRegistered)?;
        let (id, stale) = self.sessions.start(local, remote.clone(), Role::Initiator);
        if let Some(mut stale) = stale {
            self.teardown(&mut stale).await;
        }

        let offer = match self.connector.create_offer(&id).await {
            Ok(offer) => offer,
            Err(e) => {
                if let Some(mut session) = self.sessions.remove(&remote) {
                    self.teardown(&mut session).await;
                }
                return Err(e.into());
            }
        };

        let session = self.current_mut(&id)?;
        session.record_offer()?;
        session.mark_offer_sent()?;
        info!(session = %id, "Offer created");

        Ok(ClientEnvelope::signal(
            SignalKind::Offer,
            remote,
            offer.into_value(),
        ))
    }

    /// Prepare a responder session for a peer that is expected to offer.
    pub fn expect_offer(&mut self, remote: PeerId) -> Result<(), NegotiationError> {
        let local = self.local.clone().ok_or(NegotiationError::NotRegistered)?;
        let live = self
            .sessions
            .get(&remote)
            .is_some_and(|session| session.state() != NegotiationState::Closed);
        if !live {
            let (id, _) = self.sessions.start(local, remote, Role::Responder);
            debug!(session = %id, "Awaiting offer");
        }
        Ok(())
    }

    /// Handle a negotiation envelope relayed from `from`. Returns the envelope
    /// to send back, if any.
    pub async fn handle_signal(
        &mut self,
        kind: SignalKind,
        from: PeerId,
        payload: Value,
    ) -> Result<Option<ClientEnvelope>, NegotiationError> {
        match kind {
            SignalKind::Offer => self.on_offer(from, payload).await,
            SignalKind::Answer => self.on_answer(from, payload).await.map(|()| None),
            SignalKind::IceCandidate => self.on_candidate(from, payload).await.map(|()| None),
        }
    }

    async fn on_offer(
        &mut self,
        from: PeerId,
        payload: Value,
    ) -> Result<Option<ClientEnvelope>, NegotiationError> {
        let offer = Description::parse(payload)?;
        let local = self.local.clone().ok_or(NegotiationError::NotRegistered)?;

        let reusable = match self.sessions.get(&from) {
            None => None,
            Some(session) => match (session.role(), session.state()) {
                (_, NegotiationState::ResponderAwaitingOffer) => Some(session.id.clone()),
                (_, NegotiationState::Closed) => None,
                (Role::Initiator, NegotiationState::Idle)
                | (Role::Initiator, NegotiationState::OfferCreated)
                | (Role::Initiator, NegotiationState::AnswerAwaited) => {
                    if !is_polite(&local, &from) {
                        debug!(peer = %from, "Offer collision, keeping our own offer");
                        return Ok(None);
                    }
                    debug!(peer = %from, "Offer collision, yielding to remote offer");
                    None
                }
                (_, state) => {
                    debug!(peer = %from, %state, "Remote restarted negotiation");
                    None
                }
            },
        };

        // A replacement session only becomes current once the transport has
        // accepted the offer; a rejected offer leaves the existing one alone.
        let (id, replacement) = match reusable {
            Some(id) => (id, None),
            None => {
                let session = self.sessions.prepare(local, from.clone(), Role::Responder);
                (session.id.clone(), Some(session))
            }
        };

        let answer = match self.connector.accept_offer(&id, &offer).await {
            Ok(answer) => answer,
            Err(e) => {
                if replacement.is_some() {
                    self.connector.close(&id).await;
                }
                return Err(e.into());
            }
        };

        if let Some(session) = replacement {
            if let Some(mut stale) = self.sessions.install(session) {
                self.teardown(&mut stale).await;
            }
        }

        let pending = {
            let session = self.current_mut(&id)?;
            session.record_answer()?;
            session.take_pending_candidates()
        };
        self.apply_candidates(&id, pending).await;
        info!(session = %id, "Answer created");

        Ok(Some(ClientEnvelope::signal(
            SignalKind::Answer,
            from,
            answer.into_value(),
        )))
    }

    async fn on_answer(&mut self, from: PeerId, payload: Value) -> Result<(), NegotiationError> {
        let answer = Description::parse(payload)?;
        let id = match self.sessions.get(&from) {
            Some(session) if session.state() == NegotiationState::AnswerAwaited => {
                session.id.clone()
            }
            Some(session) => {
                return Err(NegotiationError::UnexpectedSignal {
                    state: session.state(),
                    kind: SignalKind::Answer,
                })
            }
            None => {
                return Err(NegotiationError::UnexpectedSignal {
                    state: NegotiationState::Idle,
                    kind: SignalKind::Answer,
                })
            }
        };

        self.connector.apply_answer(&id, &answer).await?;
        self.current_mut(&id)?.answer_applied()?;
        info!(session = %id, "Answer applied, session connected");
        Ok(())
    }

    async fn on_candidate(&mut self, from: PeerId, payload: Value) -> Result<(), NegotiationError> {
        let candidate = Candidate::parse(payload)?;
        let local = self.local.clone().ok_or(NegotiationError::NotRegistered)?;

        if self.sessions.get(&from).is_none() {
            self.sessions.start(local, from.clone(), Role::Responder);
        }
        let Some(session) = self.sessions.get_mut(&from) else {
            return Ok(());
        };
        let id = session.id.clone();

        match session.receive_candidate(candidate) {
            CandidateDisposition::Apply(candidate) => {
                self.connector.add_candidate(&id, &candidate).await?;
            }
            CandidateDisposition::Queued => {
                debug!(session = %id, "Queued candidate until a local description exists");
            }
            CandidateDisposition::Dropped => {
                debug!(session = %id, "Dropped candidate for closed session");
            }
        }
        Ok(())
    }

    async fn apply_candidates(&self, id: &SessionId, candidates: Vec<Candidate>) {
        for candidate in candidates {
            if let Err(e) = self.connector.add_candidate(id, &candidate).await {
                warn!(session = %id, error = %e, "Failed to apply queued candidate");
            }
        }
    }

    fn current_mut(&mut self, id: &SessionId) -> Result<&mut NegotiationSession, NegotiationError> {
        self.sessions
            .current_mut(id)
            .ok_or_else(|| TransportError::UnknownSession(id.to_string()).into())
    }

    /// Wrap a locally gathered candidate for the relay, unless its session is stale.
    pub fn local_candidate(&self, id: &SessionId, candidate: Candidate) -> Option<ClientEnvelope> {
        self.sessions.is_current(id).then(|| {
            ClientEnvelope::signal(
                SignalKind::IceCandidate,
                id.remote.clone(),
                candidate.into_value(),
            )
        })
    }

    /// Attach an established channel. `false` means the session is stale or
    /// closed and the caller should close the channel.
    pub fn on_established(&mut self, id: &SessionId, channel: Arc<dyn DirectChannel>) -> bool {
        match self.sessions.current_mut(id) {
            Some(session) => session.transport_established(channel),
            None => false,
        }
    }

    /// The transport lost the channel of `id`. Returns `true` if a live
    /// session was closed by it.
    pub async fn on_channel_closed(&mut self, id: &SessionId) -> bool {
        let live = self
            .sessions
            .current_mut(id)
            .filter(|session| session.state() != NegotiationState::Closed)
            .map(|session| {
                session.close();
            })
            .is_some();
        if live {
            self.connector.close(id).await;
        }
        live
    }

    /// Local teardown. The closed session stays in the table so late
    /// candidates for it are dropped.
    pub async fn close(&mut self, remote: &PeerId) -> bool {
        let Some(mut session) = self.sessions.remove(remote) else {
            return false;
        };
        let was_live = session.state() != NegotiationState::Closed;
        self.teardown(&mut session).await;
        self.sessions.sessions.insert(remote.clone(), session);
        was_live
    }

    /// The remote peer left the relay: close and forget its session.
    pub async fn forget(&mut self, remote: &PeerId) -> bool {
        let Some(mut session) = self.sessions.remove(remote) else {
            return false;
        };
        let was_live = session.state() != NegotiationState::Closed;
        self.teardown(&mut session).await;
        was_live
    }

    /// Remote peer of `id`, if it is the current session for that peer.
    pub fn remote_of<'a>(&self, id: &'a SessionId) -> Option<&'a PeerId> {
        self.sessions.is_current(id).then_some(&id.remote)
    }
}
