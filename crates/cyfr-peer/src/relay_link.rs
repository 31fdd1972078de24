//! WebSocket link from a peer node to the relay hub.
//!
//! A supervisor task owns the socket. It publishes its [`LinkState`] through
//! a watch channel, forwards decoded [`ServerEnvelope`]s to the node, and
//! writes whatever the node queues on the outbox. When the socket drops it
//! waits out an exponential backoff and dials again; a shutdown signal ends
//! it from any state.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use cyfr_shared::protocol::{ClientEnvelope, ServerEnvelope};
use cyfr_shared::ProtocolError;

use crate::backoff::ExponentialBackoff;
use crate::config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Backoff { attempt: u32, delay: Duration },
    Stopped,
}

/// What the supervisor reports to the node.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connected,
    Envelope(ServerEnvelope),
    Disconnected,
}

/// Handle to a running relay link.
pub struct RelayLinkHandle {
    pub outbox: mpsc::Sender<ClientEnvelope>,
    pub state: watch::Receiver<LinkState>,
    pub task: JoinHandle<()>,
}

enum SessionEnd {
    Lost,
    Shutdown,
}

/// Spawn the supervisor for `url`. Events go to `events`; the task stops
/// once `shutdown` turns `true` (or its sender is dropped) or the node stops
/// listening.
pub fn spawn_relay_link(
    url: String,
    reconnect: ReconnectConfig,
    events: mpsc::Sender<RelayEvent>,
    shutdown: watch::Receiver<bool>,
) -> RelayLinkHandle {
    let (outbox_tx, outbox_rx) = mpsc::channel::<ClientEnvelope>(256);
    let (state_tx, state_rx) = watch::channel(LinkState::Connecting);

    let task = tokio::spawn(supervise(
        url,
        ExponentialBackoff::from_config(&reconnect),
        events,
        outbox_rx,
        state_tx,
        shutdown,
    ));

    RelayLinkHandle {
        outbox: outbox_tx,
        state: state_rx,
        task,
    }
}

async fn supervise(
    url: String,
    mut backoff: ExponentialBackoff,
    events: mpsc::Sender<RelayEvent>,
    mut outbox: mpsc::Receiver<ClientEnvelope>,
    state: watch::Sender<LinkState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        state.send_replace(LinkState::Connecting);
        debug!(url = %url, "Connecting to relay");

        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = shutdown_requested(&mut shutdown) => break,
        };

        match connected {
            Ok((socket, _)) => {
                backoff.reset();

                let mut stale = 0usize;
                while outbox.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    debug!(count = stale, "Discarded envelopes queued while disconnected");
                }

                info!(url = %url, "Relay link connected");
                state.send_replace(LinkState::Connected);
                if events.send(RelayEvent::Connected).await.is_err() {
                    break;
                }

                let end = run_session(socket, &events, &mut outbox, &mut shutdown).await;

                let _ = events.send(RelayEvent::Disconnected).await;
                if matches!(end, SessionEnd::Shutdown) {
                    break;
                }
                warn!(url = %url, "Relay link lost");
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Relay connection failed");
            }
        }

        let delay = backoff.next_delay();
        state.send_replace(LinkState::Backoff {
            attempt: backoff.attempt(),
            delay,
        });
        debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnecting");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }
    }

    info!("Relay link stopped");
    state.send_replace(LinkState::Stopped);
}

/// Pump one connected socket until it drops or shutdown is requested.
///
/// The writer and the reader are polled side by side: the reader waiting on a
/// full event queue never stops the outbox from draining, so the node can
/// always finish handing envelopes over.
async fn run_session<S>(
    socket: S,
    events: &mpsc::Sender<RelayEvent>,
    outbox: &mut mpsc::Receiver<ClientEnvelope>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut ws_tx, mut ws_rx) = socket.split();

    let end = {
        let writer = async {
            while let Some(envelope) = outbox.recv().await {
                let text = match envelope.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode envelope");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    debug!(error = %e, "Relay write failed");
                    return SessionEnd::Lost;
                }
            }
            SessionEnd::Shutdown
        };

        let reader = async {
            loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => match ServerEnvelope::from_json(&text) {
                        Ok(envelope) => {
                            if events.send(RelayEvent::Envelope(envelope)).await.is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Err(ProtocolError::UnknownKind(kind)) => {
                            warn!(kind = %kind, "Ignoring relay envelope of unknown kind");
                        }
                        Err(e) => {
                            warn!(error = %e, "Ignoring malformed relay envelope");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Lost,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "Relay read error");
                        return SessionEnd::Lost;
                    }
                }
            }
        };

        tokio::select! {
            end = writer => end,
            end = reader => end,
            _ = shutdown_requested(shutdown) => SessionEnd::Shutdown,
        }
    };

    if matches!(end, SessionEnd::Shutdown) {
        let _ = ws_tx.close().await;
    }
    end
}

/// Resolves once shutdown is signalled or its sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
