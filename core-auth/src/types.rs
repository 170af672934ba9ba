//! Session and credential types shared across the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The bearer credential held by the session.
///
/// `access_token` is never empty; the credential store enforces that on
/// write and treats empty stored values as absent.
///
/// # Security
///
/// The `Debug` implementation redacts both tokens.
///
/// ```
/// use core_auth::Credential;
///
/// let credential = Credential::new("abc123", Some("r-1".to_string()), None);
/// assert!(!format!("{:?}", credential).contains("abc123"));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at,
        }
    }

    /// True only if an expiry is known and lies before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires_at| expires_at <= now)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }
}

// Custom Debug implementation to avoid logging tokens
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token-free view of the credential for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSnapshot {
    pub has_access_token: bool,
    pub has_refresh_token: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Authentication state of the session.
///
/// # State Transitions
///
/// ```text
/// SignedOut -> SignedIn
///                ^  |
///                |  v
///         TokenRefreshing
/// ```
///
/// ```
/// use core_auth::AuthState;
///
/// assert!(!AuthState::SignedOut.is_authenticated());
/// assert!(AuthState::TokenRefreshing.is_authenticated());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AuthState {
    /// No credential is held
    #[default]
    SignedOut,
    /// A credential is held
    SignedIn,
    /// A credential refresh is in flight
    TokenRefreshing,
}

impl AuthState {
    /// Returns `true` for `SignedIn` and `TokenRefreshing` states.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::SignedIn | AuthState::TokenRefreshing)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, AuthState::TokenRefreshing)
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthState::SignedOut => write!(f, "Signed Out"),
            AuthState::SignedIn => write!(f, "Signed In"),
            AuthState::TokenRefreshing => write!(f, "Refreshing Token..."),
        }
    }
}

/// Outcome of a login attempt.
///
/// Rejections are values, not errors: screens render `error` directly.
#[derive(Clone, PartialEq, Eq)]
pub struct SignInResult {
    pub success: bool,
    pub token: Option<String>,
    pub error: Option<String>,
}

impl SignInResult {
    pub fn succeeded(token: impl Into<String>) -> Self {
        Self {
            success: true,
            token: Some(token.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            token: None,
            error: Some(error.into()),
        }
    }
}

impl fmt::Debug for SignInResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignInResult")
            .field("success", &self.success)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("error", &self.error)
            .finish()
    }
}

/// Outcome of an account registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationResult {
    pub success: bool,
    /// Server response body on success.
    pub data: Option<Value>,
    /// Field errors keyed by field name on rejection, e.g.
    /// `{"username": ["A user with that username already exists."]}`.
    pub errors: Value,
}
