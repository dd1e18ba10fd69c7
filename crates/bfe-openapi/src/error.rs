use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("open-api request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The envelope (or the HTTP response, when no envelope was returned)
    /// carried a non-success status
    #[error("open-api returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode open-api payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("client configuration error: {0}")]
    Config(String),
}

impl ApiError {
    /// Logical status code, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether the request never produced a response within the deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_timeout())
    }
}
