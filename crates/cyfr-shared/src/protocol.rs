use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::{PeerId, TransferId};

// ---------------------------------------------------------------------------
// Control plane: peer -> relay
// ---------------------------------------------------------------------------

/// Envelopes a peer sends to the relay hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEnvelope {
    /// Announce the display name for this session
    SetUsername { username: String },

    /// Session description offer, forwarded to `target_peer_id`
    #[serde(rename_all = "camelCase")]
    Offer { target_peer_id: PeerId, offer: Value },

    /// Session description answer, forwarded to `target_peer_id`
    #[serde(rename_all = "camelCase")]
    Answer { target_peer_id: PeerId, answer: Value },

    /// Transport routing hint, forwarded to `target_peer_id`
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target_peer_id: PeerId,
        candidate: Value,
    },

    /// Chat text to broadcast through the relay
    Chat { message: String },

    /// Ask for a snapshot of the other live peers
    GetPeers,
}

impl ClientEnvelope {
    pub const KINDS: &'static [&'static str] = &[
        "set-username",
        "offer",
        "answer",
        "ice-candidate",
        "chat",
        "get-peers",
    ];

    /// Build the negotiation envelope of `kind` addressed to `target`.
    pub fn signal(kind: SignalKind, target: PeerId, payload: Value) -> Self {
        match kind {
            SignalKind::Offer => Self::Offer {
                target_peer_id: target,
                offer: payload,
            },
            SignalKind::Answer => Self::Answer {
                target_peer_id: target,
                answer: payload,
            },
            SignalKind::IceCandidate => Self::IceCandidate {
                target_peer_id: target,
                candidate: payload,
            },
        }
    }

    /// Split a negotiation envelope into kind, target and untouched payload.
    pub fn into_signal(self) -> Result<(SignalKind, PeerId, Value), Self> {
        match self {
            Self::Offer {
                target_peer_id,
                offer,
            } => Ok((SignalKind::Offer, target_peer_id, offer)),
            Self::Answer {
                target_peer_id,
                answer,
            } => Ok((SignalKind::Answer, target_peer_id, answer)),
            Self::IceCandidate {
                target_peer_id,
                candidate,
            } => Ok((SignalKind::IceCandidate, target_peer_id, candidate)),
            other => Err(other),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode_tagged(text, Self::KINDS)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Control plane: relay -> peer
// ---------------------------------------------------------------------------

/// Envelopes the relay hub delivers to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEnvelope {
    /// First envelope on every link: the assigned id and the other live peers
    #[serde(rename_all = "camelCase")]
    Welcome { peer_id: PeerId, peers: Vec<PeerId> },

    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: PeerId },

    #[serde(rename_all = "camelCase")]
    PeerUpdated { peer_id: PeerId, username: String },

    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId },

    #[serde(rename_all = "camelCase")]
    Offer {
        from_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_peer_id: Option<PeerId>,
        offer: Value,
    },

    #[serde(rename_all = "camelCase")]
    Answer {
        from_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_peer_id: Option<PeerId>,
        answer: Value,
    },

    #[serde(rename_all = "camelCase")]
    IceCandidate {
        from_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_peer_id: Option<PeerId>,
        candidate: Value,
    },

    /// Relay chat, timestamped by the hub
    #[serde(rename_all = "camelCase")]
    Chat {
        from_peer_id: PeerId,
        username: String,
        message: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },

    PeerList { peers: Vec<PeerSummary> },
}

impl ServerEnvelope {
    pub const KINDS: &'static [&'static str] = &[
        "welcome",
        "peer-joined",
        "peer-updated",
        "peer-left",
        "offer",
        "answer",
        "ice-candidate",
        "chat",
        "peer-list",
    ];

    /// Wrap a forwarded negotiation payload, attaching the sender.
    pub fn forwarded(kind: SignalKind, from: PeerId, target: PeerId, payload: Value) -> Self {
        let target_peer_id = Some(target);
        match kind {
            SignalKind::Offer => Self::Offer {
                from_peer_id: from,
                target_peer_id,
                offer: payload,
            },
            SignalKind::Answer => Self::Answer {
                from_peer_id: from,
                target_peer_id,
                answer: payload,
            },
            SignalKind::IceCandidate => Self::IceCandidate {
                from_peer_id: from,
                target_peer_id,
                candidate: payload,
            },
        }
    }

    /// Split a forwarded negotiation envelope into kind, sender and payload.
    pub fn into_signal(self) -> Result<(SignalKind, PeerId, Value), Self> {
        match self {
            Self::Offer {
                from_peer_id,
                offer,
                ..
            } => Ok((SignalKind::Offer, from_peer_id, offer)),
            Self::Answer {
                from_peer_id,
                answer,
                ..
            } => Ok((SignalKind::Answer, from_peer_id, answer)),
            Self::IceCandidate {
                from_peer_id,
                candidate,
                ..
            } => Ok((SignalKind::IceCandidate, from_peer_id, candidate)),
            other => Err(other),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode_tagged(text, Self::KINDS)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The three negotiation envelope kinds the relay forwards blindly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "ice-candidate",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a `peer-list` snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub username: Option<String>,
}

// ---------------------------------------------------------------------------
// Direct channel records
// ---------------------------------------------------------------------------

/// Records exchanged over an established direct channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelMessage {
    FileInfo(FileInfo),
    FileChunk(FileChunk),
    DirectMessage(DirectMessage),
}

impl ChannelMessage {
    pub const KINDS: &'static [&'static str] = &["file-info", "file-chunk", "direct-message"];

    pub fn from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data).map_err(|e| {
            ProtocolError::Json(serde::de::Error::custom(format!("invalid utf-8: {e}")))
        })?;
        decode_tagged(text, Self::KINDS)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Transfer announcement, sent before any chunk of the same transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub file_id: TransferId,
    pub file_name: String,
    pub file_size: u64,
    #[serde(default)]
    pub file_type: String,
}

/// A chunk of file data during P2P transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub file_id: TransferId,
    pub chunk_index: u32,
    pub total_chunks: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Chat text sent straight over the direct channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub content: String,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Decode a `type`-tagged JSON message, telling unknown kinds apart from
/// known kinds with bad fields.
fn decode_tagged<T: DeserializeOwned>(text: &str, known: &[&str]) -> Result<T, ProtocolError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingKind)?
        .to_string();

    if !known.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownKind(kind));
    }

    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { kind, source })
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_envelope_wire_names() {
        let env = ClientEnvelope::signal(
            SignalKind::IceCandidate,
            PeerId::from("nova_core_7"),
            json!({"candidate": "c1"}),
        );
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["targetPeerId"], "nova_core_7");
        assert_eq!(value["candidate"]["candidate"], "c1");

        let get = ClientEnvelope::from_json(r#"{"type":"get-peers"}"#).unwrap();
        assert_eq!(get, ClientEnvelope::GetPeers);
    }

    #[test]
    fn test_welcome_decodes_from_relay_json() {
        let env = ServerEnvelope::from_json(
            r#"{"type":"welcome","peerId":"echo_link_1","peers":["flux_wave_2"]}"#,
        )
        .unwrap();
        assert_eq!(
            env,
            ServerEnvelope::Welcome {
                peer_id: PeerId::from("echo_link_1"),
                peers: vec![PeerId::from("flux_wave_2")],
            }
        );
    }

    #[test]
    fn test_chat_timestamp_is_epoch_millis() {
        let timestamp = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let env = ServerEnvelope::Chat {
            from_peer_id: PeerId::from("a"),
            username: "alice".into(),
            message: "hi".into(),
            timestamp,
        };
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["timestamp"], 1_700_000_000_123i64);
        assert_eq!(value["fromPeerId"], "a");
    }

    #[test]
    fn test_unknown_kind_is_distinguished_from_malformed() {
        assert!(matches!(
            ClientEnvelope::from_json(r#"{"type":"teleport"}"#),
            Err(ProtocolError::UnknownKind(kind)) if kind == "teleport"
        ));
        assert!(matches!(
            ClientEnvelope::from_json(r#"{"type":"offer"}"#),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            ClientEnvelope::from_json(r#"{"offer":{}}"#),
            Err(ProtocolError::MissingKind)
        ));
        assert!(matches!(
            ClientEnvelope::from_json("not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_forwarded_keeps_payload_untouched() {
        let payload = json!({"type": "offer", "sdp": "v=0\r\n", "extra": [1, 2, 3]});
        let env = ServerEnvelope::forwarded(
            SignalKind::Offer,
            PeerId::from("from"),
            PeerId::from("to"),
            payload.clone(),
        );
        let (kind, from, delivered) = env.into_signal().unwrap();
        assert_eq!(kind, SignalKind::Offer);
        assert_eq!(from, PeerId::from("from"));
        assert_eq!(delivered, payload);
    }

    #[test]
    fn test_file_chunk_data_is_base64_text() {
        let msg = ChannelMessage::FileChunk(FileChunk {
            file_id: TransferId::from("t1"),
            chunk_index: 2,
            total_chunks: 3,
            data: vec![0, 255, 16, 32],
        });
        let bytes = msg.to_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "file-chunk");
        assert_eq!(value["fileId"], "t1");
        assert_eq!(value["chunkIndex"], 2);
        assert_eq!(value["data"], "AP8QIA==");

        assert_eq!(ChannelMessage::from_slice(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_file_info_without_type_defaults_to_empty() {
        let msg = ChannelMessage::from_slice(
            br#"{"type":"file-info","fileId":"x","fileName":"a.txt","fileSize":5}"#,
        )
        .unwrap();
        let ChannelMessage::FileInfo(info) = msg else {
            panic!("expected file-info");
        };
        assert_eq!(info.file_type, "");
        assert_eq!(info.file_size, 5);
    }

    #[test]
    fn test_direct_message_timestamp_is_optional() {
        let msg = ChannelMessage::from_slice(br#"{"type":"direct-message","content":"yo"}"#)
            .unwrap();
        assert_eq!(
            msg,
            ChannelMessage::DirectMessage(DirectMessage {
                content: "yo".into(),
                timestamp: None,
            })
        );
    }
}
