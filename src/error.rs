use serde::Serialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkflowStreamError {
    #[error("WebSocket connection error: {0}")]
    WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("TLS configuration error: {0}")]
    TlsError(#[from] rustls::Error),

    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Connection is not open")]
    NotConnected,

    #[error("Server rejected credentials: {reason}")]
    AuthRejected { code: Option<u16>, reason: String },

    #[error("Server refused connection: {reason}")]
    ServerRejected { code: Option<u16>, reason: String },

    #[error("Auth token unavailable: {0}")]
    TokenUnavailable(String),

    #[error("Maximum reconnection attempts exceeded")]
    MaxReconnectsExceeded,

    #[error("Connection failed: {0}")]
    ConnectionFailed(ConnectionFailure),

    #[error("Client has been shut down")]
    ClientShutdown,

    #[error("Metrics server error: {0}")]
    MetricsError(String),
}

pub type Result<T> = std::result::Result<T, WorkflowStreamError>;

/// Cloneable description of a connection-level failure, surfaced to
/// consumers as their `error` state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionFailure {
    pub message: String,
    pub close_code: Option<u16>,
    /// Whether reconnection was abandoned because of this failure.
    pub terminal: bool,
}

impl ConnectionFailure {
    pub fn new(message: impl Into<String>, close_code: Option<u16>, terminal: bool) -> Self {
        Self {
            message: message.into(),
            close_code,
            terminal,
        }
    }

    pub fn from_error(error: &WorkflowStreamError) -> Self {
        let close_code = match error {
            WorkflowStreamError::AuthRejected { code, .. }
            | WorkflowStreamError::ServerRejected { code, .. } => *code,
            WorkflowStreamError::ConnectionFailed(failure) => failure.close_code,
            _ => None,
        };
        Self::new(error.to_string(), close_code, false)
    }

    pub fn into_terminal(mut self) -> Self {
        self.terminal = true;
        self
    }
}

impl fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.close_code {
            Some(code) => write!(f, "{} (code: {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}
