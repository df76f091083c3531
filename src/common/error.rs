use thiserror::Error;

/// Errors raised by the sync engine and the REST client.
///
/// Transient network failures and malformed payloads are absorbed inside the
/// session (logged and dropped); only the peripheral group operations hand
/// these back to the caller.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("WebSocket not connected")]
    NotConnected,

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
