use thiserror::Error;

/// Errors produced by the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("session not connected")]
    NotConnected,

    #[error("session logged out: {0}")]
    LoggedOut(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("webhook delivery failed: {0}")]
    Delivery(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Other(format!("json: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GatewayError::Timeout
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
