//! Error types for the Coach API provider

use core_auth::AuthError;
use thiserror::Error;

/// Coach API provider errors
#[derive(Error, Debug, Clone)]
pub enum CoachApiError {
    /// The requested resource does not exist
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// The response did not have the expected shape
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Pipeline failure, including `SessionExpired`
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Result type for Coach API operations
pub type Result<T> = std::result::Result<T, CoachApiError>;

impl CoachApiError {
    /// True when the user has to sign in again.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, CoachApiError::Auth(AuthError::SessionExpired))
    }

    /// Map a 404 to `NotFound`, pass everything else through.
    pub(crate) fn for_resource(error: AuthError, resource: impl Into<String>) -> Self {
        match error {
            AuthError::ClientError { status: 404, .. } => CoachApiError::NotFound {
                resource: resource.into(),
            },
            other => CoachApiError::Auth(other),
        }
    }
}

impl From<serde_json::Error> for CoachApiError {
    fn from(e: serde_json::Error) -> Self {
        CoachApiError::ParseError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoachApiError::NotFound {
            resource: "exercise 7".to_string(),
        };
        assert_eq!(error.to_string(), "exercise 7 not found");

        let error: CoachApiError = AuthError::SessionExpired.into();
        assert_eq!(error.to_string(), "Session expired");
        assert!(error.is_session_expired());
    }

    #[test]
    fn test_not_found_mapping() {
        let error = CoachApiError::for_resource(
            AuthError::ClientError {
                status: 404,
                message: "Not found.".to_string(),
                payload: None,
            },
            "workout 3",
        );
        assert!(matches!(error, CoachApiError::NotFound { .. }));

        let error = CoachApiError::for_resource(
            AuthError::ClientError {
                status: 403,
                message: "Forbidden".to_string(),
                payload: None,
            },
            "workout 3",
        );
        assert!(matches!(
            error,
            CoachApiError::Auth(AuthError::ClientError { status: 403, .. })
        ));
    }
}
