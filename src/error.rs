use thiserror::Error as ThisError;

/// Errors surfaced by the token authority, the REST client and the session.
///
/// `Clone` so a single in-flight token exchange can hand the same failure to
/// every caller waiting on it.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),
    /// No response from the remote endpoint (DNS, connect, timeout).
    #[error("Transport error: {0}")]
    Transport(String),
    /// The token endpoint rejected the credential exchange.
    #[error("Authentication error ({status}): {body}")]
    Authentication { status: u16, body: String },
    /// A data endpoint rejected a poll or action request.
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Unexpected response: {0}")]
    Parse(String),
}

impl Error {
    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
