use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

/// Failures of a single request or of the push channel. Never fatal on their
/// own: the owning poll/fetch loop retries on its next tick.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {error}")]
    Status { status: u16, error: ApiError },
    #[error("invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("websocket failure: {0}")]
    WebSocket(String),
    #[error("no credential available for an authenticated call")]
    Unauthenticated,
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    pub fn status(status: u16, body: &str) -> Self {
        TransportError::Status {
            status,
            error: ApiError::from_response(status, body),
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TransportError::Status { error, .. } => Some(error.code),
            TransportError::Unauthenticated => Some(ErrorCode::Unauthorized),
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(value.to_string())
    }
}

impl From<url::ParseError> for TransportError {
    fn from(value: url::ParseError) -> Self {
        TransportError::InvalidUrl(value.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed payload: {0}")]
    Protocol(String),
    #[error("pairing session expired; start a new one")]
    SessionExpired,
    #[error("device is not paired")]
    NotPaired,
    #[error("no authenticated session")]
    NotAuthenticated,
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
