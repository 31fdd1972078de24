//! In-process transport: every node of a [`MemoryNetwork`] can open direct
//! channels to every other node through tokio channels.
//!
//! Used for tests and local demos. Channels are reliable and ordered, like
//! the data channels the negotiator is designed for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use cyfr_shared::constants::MAX_CHANNEL_MESSAGE_SIZE;
use cyfr_shared::PeerId;

use crate::negotiator::{Candidate, Description, SessionId};
use crate::transport::{DirectChannel, PeerConnector, TransportError, TransportEvent};

/// Ordered pair `(initiator, responder)`.
type PairKey = (PeerId, PeerId);

#[derive(Debug)]
struct Link {
    initiator: SessionId,
    responder: Option<SessionId>,
    open: Arc<AtomicBool>,
    initiator_channel: Option<Arc<MemoryChannel>>,
}

#[derive(Debug, Default)]
struct NetworkState {
    endpoints: HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
    links: HashMap<PairKey, Link>,
    applied: HashMap<SessionId, Vec<Candidate>>,
}

/// Shared switchboard of one in-process network.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    max_message_size: usize,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_max_message_size(MAX_CHANNEL_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState::default())),
            max_message_size,
        }
    }

    /// A connector whose transport events are delivered to `events`.
    pub fn connector(&self, events: mpsc::UnboundedSender<TransportEvent>) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            events,
        }
    }

    /// Candidates applied to `session`, in application order.
    pub fn applied_candidates(&self, session: &SessionId) -> Vec<Candidate> {
        self.lock().applied.get(session).cloned().unwrap_or_default()
    }

    /// Number of links currently open.
    pub fn open_links(&self) -> usize {
        self.lock()
            .links
            .values()
            .filter(|link| link.open.load(Ordering::SeqCst))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        // A poisoned lock only means another test thread panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn notify(endpoint: Option<&mpsc::UnboundedSender<TransportEvent>>, event: TransportEvent) {
    if let Some(endpoint) = endpoint {
        if endpoint.send(event).is_err() {
            debug!("Memory endpoint gone, dropping transport event");
        }
    }
}

pub struct MemoryConnector {
    network: MemoryNetwork,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryConnector {
    fn attach(&self, state: &mut NetworkState, local: &PeerId) {
        state.endpoints.insert(local.clone(), self.events.clone());
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn create_offer(&self, session: &SessionId) -> Result<Description, TransportError> {
        {
            let mut state = self.network.lock();
            self.attach(&mut state, &session.local);
            let key = (session.local.clone(), session.remote.clone());
            if let Some(old) = state.links.remove(&key) {
                old.open.store(false, Ordering::SeqCst);
            }
            state.links.insert(
                key,
                Link {
                    initiator: session.clone(),
                    responder: None,
                    open: Arc::new(AtomicBool::new(false)),
                    initiator_channel: None,
                },
            );
        }

        let candidate = Candidate::parse(json!({
            "candidate": format!("memory {} generation {}", session.local, session.generation),
            "sdpMid": "0",
        }))
        .map_err(|e| TransportError::Rejected(e.to_string()))?;
        notify(
            Some(&self.events),
            TransportEvent::LocalCandidate {
                session: session.clone(),
                candidate,
            },
        );

        Description::parse(json!({
            "type": "offer",
            "sdp": format!("memory-offer {session}"),
        }))
        .map_err(|e| TransportError::Rejected(e.to_string()))
    }

    async fn accept_offer(
        &self,
        session: &SessionId,
        _offer: &Description,
    ) -> Result<Description, TransportError> {
        let responder_channel = {
            let mut state = self.network.lock();
            self.attach(&mut state, &session.local);
            let initiator_events = state.endpoints.get(&session.remote).cloned();
            let own_events = self.events.clone();
            let max = self.network.max_message_size;

            let key = (session.remote.clone(), session.local.clone());
            let link = state
                .links
                .get_mut(&key)
                .filter(|link| link.responder.is_none())
                .ok_or_else(|| TransportError::Rejected(format!("no pending offer for {session}")))?;
            let initiator_events = initiator_events
                .ok_or_else(|| TransportError::UnknownSession(link.initiator.to_string()))?;

            link.responder = Some(session.clone());
            link.open.store(true, Ordering::SeqCst);

            link.initiator_channel = Some(Arc::new(MemoryChannel {
                open: link.open.clone(),
                peer_events: own_events,
                peer_session: session.clone(),
                max_message_size: max,
            }));
            Arc::new(MemoryChannel {
                open: link.open.clone(),
                peer_events: initiator_events,
                peer_session: link.initiator.clone(),
                max_message_size: max,
            })
        };

        notify(
            Some(&self.events),
            TransportEvent::Established {
                session: session.clone(),
                channel: responder_channel,
            },
        );

        Description::parse(json!({
            "type": "answer",
            "sdp": format!("memory-answer {session}"),
        }))
        .map_err(|e| TransportError::Rejected(e.to_string()))
    }

    async fn apply_answer(
        &self,
        session: &SessionId,
        _answer: &Description,
    ) -> Result<(), TransportError> {
        let channel = {
            let mut state = self.network.lock();
            let key = (session.local.clone(), session.remote.clone());
            let link = state
                .links
                .get_mut(&key)
                .filter(|link| link.initiator == *session)
                .ok_or_else(|| TransportError::UnknownSession(session.to_string()))?;
            link.initiator_channel
                .take()
                .ok_or_else(|| TransportError::Rejected("answer before offer was accepted".into()))?
        };

        notify(
            Some(&self.events),
            TransportEvent::Established {
                session: session.clone(),
                channel,
            },
        );
        Ok(())
    }

    async fn add_candidate(
        &self,
        session: &SessionId,
        candidate: &Candidate,
    ) -> Result<(), TransportError> {
        self.network
            .lock()
            .applied
            .entry(session.clone())
            .or_default()
            .push(candidate.clone());
        Ok(())
    }

    async fn close(&self, session: &SessionId) {
        let notice = {
            let mut state = self.network.lock();
            let as_initiator = (session.local.clone(), session.remote.clone());
            let as_responder = (session.remote.clone(), session.local.clone());

            let key = [as_initiator, as_responder].into_iter().find(|key| {
                state.links.get(key).is_some_and(|link| {
                    link.initiator == *session || link.responder.as_ref() == Some(session)
                })
            });
            let Some(key) = key else {
                return;
            };
            let Some(link) = state.links.remove(&key) else {
                return;
            };

            let was_open = link.open.swap(false, Ordering::SeqCst);
            let other = if link.initiator == *session {
                link.responder
            } else {
                Some(link.initiator)
            };
            match other {
                Some(other) if was_open => {
                    let endpoint = state.endpoints.get(&other.local).cloned();
                    Some((endpoint, other))
                }
                _ => None,
            }
        };

        if let Some((endpoint, other)) = notice {
            notify(endpoint.as_ref(), TransportEvent::Closed { session: other });
        }
    }
}

/// One end of an in-process link.
#[derive(Debug)]
pub struct MemoryChannel {
    open: Arc<AtomicBool>,
    peer_events: mpsc::UnboundedSender<TransportEvent>,
    peer_session: SessionId,
    max_message_size: usize,
}

#[async_trait]
impl DirectChannel for MemoryChannel {
    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        if data.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }
        self.peer_events
            .send(TransportEvent::Message {
                session: self.peer_session.clone(),
                data,
            })
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            notify(
                Some(&self.peer_events),
                TransportEvent::Closed {
                    session: self.peer_session.clone(),
                },
            );
        }
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(local: &str, remote: &str, generation: u64) -> SessionId {
        SessionId {
            local: PeerId::from(local),
            remote: PeerId::from(remote),
            generation,
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out")
            .expect("endpoint closed")
    }

    async fn established(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Arc<dyn DirectChannel> {
        loop {
            if let TransportEvent::Established { channel, .. } = next_event(rx).await {
                return channel;
            }
        }
    }

    #[tokio::test]
    async fn test_offer_answer_opens_a_channel_pair() {
        let network = MemoryNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network.connector(a_tx);
        let b = network.connector(b_tx);
        let a_session = session("a", "b", 1);
        let b_session = session("b", "a", 7);

        let offer = a.create_offer(&a_session).await.unwrap();
        assert!(matches!(
            next_event(&mut a_rx).await,
            TransportEvent::LocalCandidate { .. }
        ));

        let answer = b.accept_offer(&b_session, &offer).await.unwrap();
        let b_channel = established(&mut b_rx).await;
        a.apply_answer(&a_session, &answer).await.unwrap();
        let a_channel = established(&mut a_rx).await;
        assert_eq!(network.open_links(), 1);

        a_channel.send(b"ping".to_vec()).await.unwrap();
        match next_event(&mut b_rx).await {
            TransportEvent::Message { session, data } => {
                assert_eq!(session, b_session);
                assert_eq!(data, b"ping");
            }
            other => panic!("expected message, got {other:?}"),
        }

        b_channel.close().await;
        assert!(!a_channel.is_open());
        assert!(matches!(
            next_event(&mut a_rx).await,
            TransportEvent::Closed { session } if session == a_session
        ));
        assert_eq!(
            a_channel.send(b"late".to_vec()).await,
            Err(TransportError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_accept_without_offer_is_rejected() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = network.connector(tx);
        let offer = Description::parse(json!({"type": "offer", "sdp": "x"})).unwrap();

        let result = connector.accept_offer(&session("b", "a", 1), &offer).await;
        assert!(matches!(result, Err(TransportError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_oversized_message_is_refused() {
        let network = MemoryNetwork::with_max_message_size(8);
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network.connector(a_tx);
        let b = network.connector(b_tx);

        let offer = a.create_offer(&session("a", "b", 1)).await.unwrap();
        b.accept_offer(&session("b", "a", 1), &offer).await.unwrap();
        let channel = established(&mut b_rx).await;
        assert_eq!(channel.max_message_size(), 8);
        assert_eq!(
            channel.send(vec![0; 9]).await,
            Err(TransportError::MessageTooLarge { size: 9, max: 8 })
        );
    }

    #[tokio::test]
    async fn test_connector_close_notifies_remote_once() {
        let network = MemoryNetwork::new();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let a = network.connector(a_tx);
        let b = network.connector(b_tx);
        let a_session = session("a", "b", 1);

        let offer = a.create_offer(&a_session).await.unwrap();
        let answer = b.accept_offer(&session("b", "a", 2), &offer).await.unwrap();
        a.apply_answer(&a_session, &answer).await.unwrap();
        let _ = established(&mut b_rx).await;
        let _ = established(&mut a_rx).await;

        a.close(&a_session).await;
        a.close(&a_session).await;
        assert!(matches!(
            next_event(&mut b_rx).await,
            TransportEvent::Closed { .. }
        ));
        assert!(b_rx.try_recv().is_err());
        assert_eq!(network.open_links(), 0);
    }

    #[tokio::test]
    async fn test_candidates_are_recorded_per_session() {
        let network = MemoryNetwork::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connector = network.connector(tx);
        let id = session("a", "b", 3);

        for n in 0..3 {
            let c = Candidate::parse(json!({"candidate": format!("c{n}")})).unwrap();
            connector.add_candidate(&id, &c).await.unwrap();
        }
        let applied: Vec<_> = network
            .applied_candidates(&id)
            .iter()
            .map(|c| c.candidate().to_string())
            .collect();
        assert_eq!(applied, vec!["c0", "c1", "c2"]);
    }
}
