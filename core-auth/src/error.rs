use serde_json::Value;
use thiserror::Error;

/// Failures surfaced by the authenticated request pipeline.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    /// The server answered 401. Absorbed by the pipeline; callers only see
    /// it for requests sent with `skip_auth_handling`.
    #[error("Authentication failed")]
    AuthFailure,

    /// The credential was cleared and the user has to sign in again.
    #[error("Session expired")]
    SessionExpired,

    #[error("Request rejected ({status}): {message}")]
    ClientError {
        status: u16,
        message: String,
        /// Decoded error body, e.g. field errors from registration.
        payload: Option<Value>,
    },

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Secure storage error: {0}")]
    StorageError(String),

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Whether repeating the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::ServerError { .. } | AuthError::TransportError(_)
        )
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AuthError::AuthFailure => Some(401),
            AuthError::ClientError { status, .. } | AuthError::ServerError { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(e: serde_json::Error) -> Self {
        AuthError::Serialization(e.to_string())
    }
}

impl From<core_runtime::Error> for AuthError {
    fn from(e: core_runtime::Error) -> Self {
        AuthError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuthError>;
