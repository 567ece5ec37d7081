use thiserror::Error;

/// Tether unified error type
#[derive(Error, Debug)]
pub enum TetherError {
    #[error("Session '{session_id}' has been disposed")]
    Disposed { session_id: String },

    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    #[error("Request identity does not match session '{session_id}'")]
    Forbidden { session_id: String },

    #[error("Session store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Output error: {0}")]
    Output(String),
}

impl TetherError {
    /// Connectivity failure against a remote backend
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// True when the session state is unknown rather than absent
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}

pub type TetherResult<T> = Result<T, TetherError>;
