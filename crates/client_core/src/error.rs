use shared::error::ApiError;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::timeline::LocalId;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server rejected request: {0}")]
    Api(ApiError),
    #[error("websocket failure: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("invalid server url {0:?}")]
    InvalidUrl(String),
    #[error("message body must not be empty")]
    EmptyBody,
    #[error("no local message {0}")]
    UnknownLocalMessage(LocalId),
    #[error("local message {0} has not failed")]
    NotFailed(LocalId),
    #[error("conversation session is closed")]
    SessionClosed,
}

pub type ClientResult<T> = Result<T, ClientError>;
