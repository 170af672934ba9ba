//! Core service façade and bootstrap helpers.
//!
//! This crate is the composition root. It builds the event bus, the
//! authenticated request pipeline and the Coach API client from one
//! [`CoreConfig`] and hands host applications a single cloneable handle.
//! Nothing in the core is global: two `CoreService` values built from two
//! configurations share no state.
//!
//! Desktop apps enable the `desktop-shims` feature, which lets the
//! configuration fall back to the keyring secure store and the reqwest HTTP
//! client when the host does not inject its own.

pub mod error;

pub use error::{CoreError, Result};

use bridge_traits::HttpMethod;
use core_auth::{AuthState, SessionManager, SignInResult};
use core_runtime::config::CoreConfig;
use core_runtime::events::{EventBus, EventStream};
use provider_coach_api::CoachApiClient;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

pub use core_auth;
pub use core_runtime;
pub use provider_coach_api;

/// Primary façade exposed to host applications.
#[derive(Clone, Debug)]
pub struct CoreService {
    config: Arc<CoreConfig>,
    event_bus: EventBus,
    session: SessionManager,
    api: CoachApiClient,
}

impl CoreService {
    /// Build the service from a validated configuration.
    ///
    /// # Errors
    ///
    /// - `CapabilityMissing` if no HTTP client is configured
    /// - `InitializationFailed` if the configuration is invalid
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        config.require_http_client()?;

        let event_bus = EventBus::new(config.event_buffer_size);
        let session = SessionManager::from_config(&config, event_bus.clone())
            .map_err(|e| CoreError::InitializationFailed(e.to_string()))?;
        let api = CoachApiClient::from_config(session.dispatcher().clone(), &config);

        info!(base_url = %config.base_url, "Core service initialized");

        Ok(Self {
            config: Arc::new(config),
            event_bus,
            session,
            api,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn api(&self) -> &CoachApiClient {
        &self.api
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Subscribe to auth and request events.
    pub fn subscribe_events(&self) -> EventStream {
        EventStream::new(self.event_bus.subscribe())
    }

    pub async fn sign_in(&self, username: &str, password: &str) -> Result<SignInResult> {
        Ok(self.session.sign_in(username, password).await?)
    }

    pub async fn sign_out(&self) {
        self.session.sign_out().await
    }

    pub async fn request(&self, method: HttpMethod, path: &str, body: Option<Value>) -> Result<Value> {
        Ok(self.session.request(method, path, body).await?)
    }

    pub async fn is_authenticated(&self) -> bool {
        self.session.is_authenticated().await
    }

    pub async fn auth_state(&self) -> AuthState {
        self.session.auth_state().await
    }
}

/// Convenience bootstrapper for desktop hosts.
///
/// Reads `COACH_API_URL` and `COACH_REQUEST_TIMEOUT_SECS` and uses the
/// keyring and reqwest defaults.
///
/// ```no_run
/// # #[cfg(feature = "desktop-shims")]
/// # async fn example() -> core_service::Result<()> {
/// let core = core_service::bootstrap_desktop()?;
/// let result = core.sign_in("coach", "secret").await?;
/// println!("signed in: {}", result.success);
/// # Ok(())
/// # }
/// ```
#[cfg(feature = "desktop-shims")]
pub fn bootstrap_desktop() -> Result<CoreService> {
    let config = CoreConfig::from_env()?;
    CoreService::new(config)
}
