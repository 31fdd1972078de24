use thiserror::Error;

/// Errors produced while decoding relay envelopes or channel records.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The `type` tag names a kind this side does not understand.
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    /// The message has no `type` tag at all.
    #[error("Message has no type tag")]
    MissingKind,

    /// The kind is known but its fields do not decode.
    #[error("Malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// The input is not JSON.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
