use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors surfaced by the relay hub to connection tasks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Relay is full ({max} peers)")]
    Full { max: usize },

    #[error("Relay hub is not running")]
    Closed,
}

/// Errors returned by the HTTP surface.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Relay is full ({max} peers)")]
    RelayFull { max: usize },

    #[error("Relay hub unavailable")]
    HubUnavailable,
}

impl From<HubError> for ServerError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::Full { max } => ServerError::RelayFull { max },
            HubError::Closed => ServerError::HubUnavailable,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::RelayFull { .. } | ServerError::HubUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
