//! Crate-wide error type.

/// Errors produced by the store, the server functions, the transports and sync sessions.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// `create` was called with a `localId` that is already stored.
    #[error("Document {0} already exists.")]
    DuplicateIdentifier(String),

    /// `update` or `remove` was called with an unknown `localId`.
    #[error("Document {0} does not exist.")]
    NotFound(String),

    /// Malformed arguments, unknown function names or wrong function kinds.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("LMDB error: {0}")]
    Database(#[from] lmdb::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport could not reach or talk to the backend.
    #[error("transport error: {0}")]
    Transport(String),

    /// The session was disposed and no longer accepts operations.
    #[error("sync session has been disposed")]
    SessionDisposed,
}

impl ChatError {
    /// True for the two conditions raised by the server function layer itself.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ChatError::DuplicateIdentifier(_) | ChatError::NotFound(_))
    }
}
