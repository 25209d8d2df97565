use thiserror::Error;

/// Credential problems. Never retried: the caller has to refresh the
/// credential and call `connect` again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no auth token available")]
    MissingCredential,
    #[error("broker rejected credential: {0}")]
    Rejected(String),
}

/// Network or protocol failure on the broker link. Always retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to open broker link: {0}")]
    Connect(String),
    #[error("broker did not answer within {0:?}")]
    Timeout(std::time::Duration),
    #[error("broker link closed")]
    Closed,
    #[error("broker protocol violation: {0}")]
    Protocol(String),
    #[error("failed to write frame: {0}")]
    Write(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ConnectError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("not connected to the message broker")]
    NotConnected,
    #[error("failed to encode payload: {0}")]
    Encode(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// History or poll request failure, distinct from an empty result.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server answered with status {0}")]
    Status(u16),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("poll window does not fit the calendar")]
    InvalidWindow,
}
