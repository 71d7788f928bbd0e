use thiserror::Error;

/// Non-fatal dispatch failures.
///
/// Dropped signaling is silent by contract: the sender never receives an error
/// envelope, the failure is recorded in the log and the connection stays open.
/// Clients are expected to apply their own timeout/retry at a higher layer.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("sender has not joined the room")]
    NotJoined,

    #[error("sender already joined; identity is immutable for the connection")]
    AlreadyJoined,

    #[error("action requires the {0} role")]
    Unauthorized(&'static str),

    #[error("target user {0} not present in room")]
    TargetNotFound(String),

    #[error("no teacher connected to the room")]
    NoTeacher,
}

/// Convenience type alias for Results using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;
