//! Error types for session and flow operations

/// Errors from session bookkeeping and the two-phase flow.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("provider {0} is not part of this session")]
    UnknownProvider(String),

    #[error(transparent)]
    Auth(#[from] credmon_auth::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
