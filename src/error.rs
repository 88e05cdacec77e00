use thiserror::Error;

/// failures surfaced to the caller of an exchange.
///
/// the message is shown to the user verbatim; there is no automatic retry.
#[derive(Debug, Error)]
pub enum ChatError {
    /// network error, non-success http status, or the stream broke off.
    #[error("transport error: {0}")]
    Transport(String),

    /// the service answered with an `{ "error": ... }` payload.
    #[error("{0}")]
    Service(String),

    /// a payload that is not json, or not a response we understand.
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// the blocking io worker went away.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl From<ureq::Error> for ChatError {
    fn from(err: ureq::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}
