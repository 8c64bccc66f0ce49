//! Error types for key-file loading, token exchange and credential storage

/// Errors from the credential issuance path.
///
/// Identity lookups never produce one of these: a failed user-info fetch
/// resolves to the `Unknown` username instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("key file parse error: {0}")]
    Parse(String),

    #[error("key file record for {provider} is missing required field {field}")]
    MissingField { provider: String, field: &'static str },

    #[error("invalid key id: {0}")]
    InvalidKeyId(String),

    #[error("CSRF state mismatch for provider {0}")]
    CsrfMismatch(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("credential persistence failed: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, Error>;
