//! Per-peer WebSocket task.
//!
//! Registers the peer with the hub, then runs two halves: a writer that
//! drains the peer's relay link onto the socket, and a reader that decodes
//! client envelopes and submits them to the hub. A bad envelope is logged
//! and skipped; only socket closure ends the task, and it always ends with
//! the peer unregistered.

use std::borrow::Cow;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use cyfr_shared::protocol::ClientEnvelope;
use cyfr_shared::ProtocolError;

use crate::error::HubError;
use crate::hub::HubHandle;
use crate::registry::RelayLink;

/// WebSocket close code "try again later".
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

pub async fn serve_link(mut socket: WebSocket, hub: HubHandle, link_buffer: usize) {
    let (link, mut outbound) = RelayLink::channel(link_buffer);

    let peer_id = match hub.register(link).await {
        Ok(peer_id) => peer_id,
        Err(e) => {
            warn!(error = %e, "Closing link: registration failed");
            let reason = match e {
                HubError::Full { .. } => "relay full",
                HubError::Closed => "relay unavailable",
            };
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_TRY_AGAIN_LATER,
                    reason: Cow::Borrowed(reason),
                })))
                .await;
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_peer = peer_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let text = match envelope.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(peer = %writer_peer, error = %e, "Failed to encode envelope");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                debug!(peer = %writer_peer, "Socket write failed, stopping writer");
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match ClientEnvelope::from_json(&text) {
                Ok(envelope) => {
                    if hub.submit(peer_id.clone(), envelope).await.is_err() {
                        warn!(peer = %peer_id, "Hub stopped, closing link");
                        break;
                    }
                }
                Err(ProtocolError::UnknownKind(kind)) => {
                    warn!(peer = %peer_id, kind = %kind, "Rejected envelope of unknown kind");
                }
                Err(e) => {
                    warn!(peer = %peer_id, error = %e, "Rejected malformed envelope");
                }
            },
            Ok(Message::Binary(data)) => {
                warn!(peer = %peer_id, len = data.len(), "Rejected binary frame");
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                debug!(peer = %peer_id, error = %e, "Socket read error");
                break;
            }
        }
    }

    info!(peer = %peer_id, "Relay link closed");
    let _ = hub.unregister(peer_id).await;
    writer.abort();
}
