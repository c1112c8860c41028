use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not a relay URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("websocket: {0}")]
    WebSocket(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("malformed relay frame: {0}")]
    Protocol(String),

    #[error("JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
