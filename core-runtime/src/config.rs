//! # Core Configuration Module
//!
//! Provides configuration management for the coaching client core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a `CoreConfig`
//! instance that holds all necessary dependencies and settings for the core library.
//! It enforces fail-fast validation to ensure all required bridges are provided
//! before initialization.
//!
//! ## Required Dependencies
//!
//! - `SecureStore` - Required for credential persistence
//!
//! ## Optional Dependencies (with platform defaults)
//!
//! - `HttpClient` - HTTP transport (desktop default: reqwest)
//! - `Clock` - Time source (default: system clock)
//!
//! When the `desktop-shims` feature is enabled, desktop-ready defaults for
//! `SecureStore` and `HttpClient` are injected automatically if not provided.
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//! use std::time::Duration;
//!
//! let config = CoreConfig::builder()
//!     .base_url("https://staging.example.com/api")
//!     .request_timeout(Duration::from_secs(15))
//!     .secure_store(Arc::new(MySecureStore))
//!     .build()?;
//! ```
//!
//! ## Environment
//!
//! [`CoreConfigBuilder::from_env`] reads:
//!
//! - `COACH_API_URL` - API base URL
//! - `COACH_REQUEST_TIMEOUT_SECS` - request timeout in whole seconds

use crate::error::{Error, Result};
use bridge_traits::{Clock, HttpClient, SecureStore, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Production API of the coaching backend.
pub const DEFAULT_BASE_URL: &str = "https://app.trenerwitek.pl/api";

/// Default bound on a single request, including the body download.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Scheme placed before the credential in the `Authorization` header.
pub const DEFAULT_AUTH_SCHEME: &str = "Token";

pub const ENV_API_URL: &str = "COACH_API_URL";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "COACH_REQUEST_TIMEOUT_SECS";

/// Names of the secure-storage slots holding the credential.
///
/// The defaults match the keys used by the shipped mobile app so an existing
/// install keeps its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry as epoch milliseconds in decimal text.
    pub expires_at: String,
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self {
            access_token: "userToken".to_string(),
            refresh_token: "refreshToken".to_string(),
            expires_at: "tokenExpiry".to_string(),
        }
    }
}

impl StorageKeys {
    pub fn all(&self) -> [&str; 3] {
        [&self.access_token, &self.refresh_token, &self.expires_at]
    }
}

/// Authentication endpoints, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEndpoints {
    pub login: String,
    pub refresh: String,
    pub register: String,
    pub password_reset: String,
    pub password_reset_confirm: String,
}

impl Default for AuthEndpoints {
    fn default() -> Self {
        Self {
            login: "/auth".to_string(),
            refresh: "/auth/refresh/".to_string(),
            register: "/auth/register/".to_string(),
            password_reset: "/auth/password-reset/".to_string(),
            password_reset_confirm: "/auth/password-reset/confirm/".to_string(),
        }
    }
}

/// Core configuration for the coaching client.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// API base URL without a trailing slash, e.g. `https://host/api`
    pub base_url: String,

    /// Base URL for media paths returned by the API
    pub media_base_url: String,

    /// Default per-request timeout
    pub request_timeout: Duration,

    /// `Authorization` header scheme
    pub auth_scheme: String,

    pub endpoints: AuthEndpoints,

    pub storage_keys: StorageKeys,

    /// Capacity of the event bus channel
    pub event_buffer_size: usize,

    /// HTTP transport (optional with desktop default)
    pub http_client: Option<Arc<dyn HttpClient>>,

    /// Secure credential storage (required)
    pub secure_store: Arc<dyn SecureStore>,

    /// Time source for credential expiry
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("base_url", &self.base_url)
            .field("media_base_url", &self.media_base_url)
            .field("request_timeout", &self.request_timeout)
            .field("auth_scheme", &self.auth_scheme)
            .field("endpoints", &self.endpoints)
            .field("storage_keys", &self.storage_keys)
            .field("event_buffer_size", &self.event_buffer_size)
            .field(
                "http_client",
                &self.http_client.as_ref().map(|_| "HttpClient { ... }"),
            )
            .field("secure_store", &"SecureStore { ... }")
            .field("clock", &"Clock { ... }")
            .finish()
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Shorthand for `CoreConfig::builder().from_env()?.build()`.
    pub fn from_env() -> Result<Self> {
        CoreConfig::builder().from_env()?.build()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        validate_base_url(&self.base_url)?;
        validate_base_url(&self.media_base_url)?;

        if self.request_timeout.is_zero() {
            return Err(Error::Config(
                "Request timeout must be greater than zero".to_string(),
            ));
        }

        if self.auth_scheme.trim().is_empty() || self.auth_scheme.contains(char::is_whitespace) {
            return Err(Error::Config(format!(
                "Invalid authorization scheme '{}'",
                self.auth_scheme
            )));
        }

        let endpoints = [
            &self.endpoints.login,
            &self.endpoints.refresh,
            &self.endpoints.register,
            &self.endpoints.password_reset,
            &self.endpoints.password_reset_confirm,
        ];
        if let Some(bad) = endpoints.iter().find(|path| !path.starts_with('/')) {
            return Err(Error::Config(format!(
                "Endpoint path '{}' must start with '/'",
                bad
            )));
        }

        let keys = self.storage_keys.all();
        if keys.iter().any(|key| key.is_empty()) {
            return Err(Error::Config("Storage keys cannot be empty".to_string()));
        }
        if keys[0] == keys[1] || keys[0] == keys[2] || keys[1] == keys[2] {
            return Err(Error::Config("Storage keys must be distinct".to_string()));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the HTTP client or a `CapabilityMissing` error.
    pub fn require_http_client(&self) -> Result<Arc<dyn HttpClient>> {
        self.http_client
            .clone()
            .ok_or_else(http_client_missing_error)
    }
}

fn validate_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::Config(format!(
            "Base URL must use http or https, got '{}'",
            other
        ))),
    }
}

fn normalize_base_url(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_string()
}

/// The media host serves files from the site root, i.e. the API URL minus
/// its trailing `/api` segment.
fn derive_media_base_url(base_url: &str) -> String {
    base_url
        .strip_suffix("/api")
        .unwrap_or(base_url)
        .to_string()
}

fn http_client_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: "HttpClient implementation is required for API access. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default ReqwestHttpClient. \
                 Mobile: inject the platform HTTP stack (URLSession/OkHttp)."
            .to_string(),
    }
}

#[cfg(not(feature = "desktop-shims"))]
fn secure_store_missing_error() -> Error {
    Error::CapabilityMissing {
        capability: "SecureStore".to_string(),
        message: "SecureStore implementation is required for credential persistence. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use the default KeyringSecureStore. \
                 Mobile: inject platform-native secure storage (Keychain/Keystore)."
            .to_string(),
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_secure_store() -> Result<Arc<dyn SecureStore>> {
    use bridge_desktop::KeyringSecureStore;

    let store: Arc<dyn SecureStore> = Arc::new(KeyringSecureStore::new());
    Ok(store)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_secure_store() -> Result<Arc<dyn SecureStore>> {
    Err(secure_store_missing_error())
}

#[cfg(feature = "desktop-shims")]
fn provide_default_http_client(timeout: Duration) -> Result<Option<Arc<dyn HttpClient>>> {
    use bridge_desktop::ReqwestHttpClient;

    let client = ReqwestHttpClient::with_timeout(timeout).map_err(|e| Error::CapabilityMissing {
        capability: "HttpClient".to_string(),
        message: e.to_string(),
    })?;
    let client: Arc<dyn HttpClient> = Arc::new(client);
    Ok(Some(client))
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_http_client(_timeout: Duration) -> Result<Option<Arc<dyn HttpClient>>> {
    Ok(None)
}

/// Builder for constructing [`CoreConfig`] instances.
///
/// Call [`build()`](CoreConfigBuilder::build) to create the final config.
/// The builder validates required dependencies and provides helpful error
/// messages.
#[derive(Default)]
pub struct CoreConfigBuilder {
    base_url: Option<String>,
    media_base_url: Option<String>,
    request_timeout: Option<Duration>,
    auth_scheme: Option<String>,
    endpoints: Option<AuthEndpoints>,
    storage_keys: Option<StorageKeys>,
    event_buffer_size: Option<usize>,
    http_client: Option<Arc<dyn HttpClient>>,
    secure_store: Option<Arc<dyn SecureStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CoreConfigBuilder {
    /// Sets the API base URL. A trailing slash is removed.
    ///
    /// ```
    /// use core_runtime::config::CoreConfig;
    ///
    /// let builder = CoreConfig::builder().base_url("https://staging.example.com/api/");
    /// ```
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Overrides the media base URL. Defaults to the base URL minus `/api`.
    pub fn media_base_url(mut self, url: impl Into<String>) -> Self {
        self.media_base_url = Some(url.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn auth_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.auth_scheme = Some(scheme.into());
        self
    }

    pub fn endpoints(mut self, endpoints: AuthEndpoints) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn storage_keys(mut self, keys: StorageKeys) -> Self {
        self.storage_keys = Some(keys);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    /// Sets the HTTP transport.
    ///
    /// On desktop with the `desktop-shims` feature, a `ReqwestHttpClient`
    /// is used when this is not called.
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Sets the secure credential store (required).
    ///
    /// On desktop with the `desktop-shims` feature, the OS keyring is used
    /// when this is not called.
    pub fn secure_store(mut self, store: Arc<dyn SecureStore>) -> Self {
        self.secure_store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Applies `COACH_API_URL` and `COACH_REQUEST_TIMEOUT_SECS` when set.
    pub fn from_env(self) -> Result<Self> {
        self.apply_env(|name| std::env::var(name).ok())
    }

    fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_API_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = Some(url);
        }

        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT_SECS) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                Error::Config(format!(
                    "{} must be a whole number of seconds, got '{}'",
                    ENV_REQUEST_TIMEOUT_SECS, raw
                ))
            })?;
            self.request_timeout = Some(Duration::from_secs(secs));
        }

        Ok(self)
    }

    /// Builds the final `CoreConfig` instance.
    ///
    /// # Returns
    ///
    /// Returns `Ok(CoreConfig)` on success, or an error if:
    /// - The `SecureStore` is missing and no platform default exists
    /// - A URL does not parse or is not http(s)
    /// - Any other value is out of range
    pub fn build(self) -> Result<CoreConfig> {
        let base_url = normalize_base_url(self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL));
        validate_base_url(&base_url)?;

        let media_base_url = match self.media_base_url {
            Some(url) => normalize_base_url(&url),
            None => derive_media_base_url(&base_url),
        };

        let request_timeout = self.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let secure_store = match self.secure_store {
            Some(store) => store,
            None => provide_default_secure_store()?,
        };

        let http_client = match self.http_client {
            Some(client) => Some(client),
            None => provide_default_http_client(request_timeout)?,
        };

        let config = CoreConfig {
            base_url,
            media_base_url,
            request_timeout,
            auth_scheme: self
                .auth_scheme
                .unwrap_or_else(|| DEFAULT_AUTH_SCHEME.to_string()),
            endpoints: self.endpoints.unwrap_or_default(),
            storage_keys: self.storage_keys.unwrap_or_default(),
            event_buffer_size: self
                .event_buffer_size
                .unwrap_or(crate::events::DEFAULT_EVENT_BUFFER_SIZE),
            http_client,
            secure_store,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        };

        config.validate()?;

        Ok(config)
    }
}
