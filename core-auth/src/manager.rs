//! # Session Manager
//!
//! Caller-facing surface of the authenticated request pipeline.
//!
//! ## Overview
//!
//! `SessionManager` wraps the [`RequestDispatcher`] with the account
//! operations screens need: sign-in, sign-out, registration and password
//! reset. Authenticated calls go through [`SessionManager::request`]; auth
//! failures, refresh and replay are handled underneath.
//!
//! Login rejections are returned as a [`SignInResult`] value rather than an
//! error, so a form can show `error` verbatim.
//!
//! ## Usage
//!
//! ```no_run
//! use core_auth::SessionManager;
//! use core_runtime::config::CoreConfig;
//! use core_runtime::events::EventBus;
//! use bridge_traits::HttpMethod;
//! # async fn example(config: CoreConfig) -> core_auth::Result<()> {
//! let event_bus = EventBus::new(config.event_buffer_size);
//! let session = SessionManager::from_config(&config, event_bus)?;
//!
//! let result = session.sign_in("coach", "secret").await?;
//! if result.success {
//!     let profile = session.request(HttpMethod::Get, "/user/current/", None).await?;
//!     println!("{}", profile);
//! }
//! # Ok(())
//! # }
//! ```

use crate::credential_store::CredentialStore;
use crate::dispatcher::{error_message, first_string, ApiRequest, DispatcherSettings, RequestDispatcher};
use crate::error::{AuthError, Result};
use crate::types::{AuthState, CredentialSnapshot, RegistrationResult, SignInResult};
use bridge_traits::HttpMethod;
use core_runtime::config::{AuthEndpoints, CoreConfig};
use core_runtime::events::{AuthEvent, CoreEvent, EventBus};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

/// Shown when the server rejects a login without a usable message.
pub const INVALID_CREDENTIALS_MESSAGE: &str = "Invalid login credentials";

/// Shown when a login gets no answer from the server.
pub const UNREACHABLE_MESSAGE: &str = "Unable to reach the server";

/// Account operations and authenticated requests for one session.
#[derive(Clone, Debug)]
pub struct SessionManager {
    dispatcher: RequestDispatcher,
    endpoints: AuthEndpoints,
    event_bus: EventBus,
}

impl SessionManager {
    pub fn new(dispatcher: RequestDispatcher, endpoints: AuthEndpoints, event_bus: EventBus) -> Self {
        Self {
            dispatcher,
            endpoints,
            event_bus,
        }
    }

    /// Build the whole pipeline from configuration.
    ///
    /// # Errors
    ///
    /// `Config` if the configuration has no HTTP client.
    pub fn from_config(config: &CoreConfig, event_bus: EventBus) -> Result<Self> {
        let http_client = config.require_http_client()?;
        let credentials = CredentialStore::new(
            config.secure_store.clone(),
            config.clock.clone(),
            config.storage_keys.clone(),
        );
        let dispatcher = RequestDispatcher::new(
            http_client,
            credentials,
            DispatcherSettings::from_config(config),
            event_bus.clone(),
        );

        Ok(Self::new(dispatcher, config.endpoints.clone(), event_bus))
    }

    pub fn dispatcher(&self) -> &RequestDispatcher {
        &self.dispatcher
    }

    pub fn credentials(&self) -> &CredentialStore {
        self.dispatcher.credentials()
    }

    /// Exchange a username and password for a credential.
    ///
    /// # Returns
    ///
    /// - `success: true` with the token once it is stored
    /// - `success: false` with the server's message on rejection, or
    ///   "Unable to reach the server" when no usable answer arrived
    ///
    /// # Errors
    ///
    /// `StorageError` if the credential could not be persisted. The token
    /// is still held in memory for this process.
    #[instrument(skip(self, password))]
    pub async fn sign_in(&self, username: &str, password: &str) -> Result<SignInResult> {
        info!("Signing in");

        let request = ApiRequest::post(
            &self.endpoints.login,
            json!({ "username": username, "password": password }),
        )
        .public();

        let payload = match self.dispatcher.send(request).await {
            Ok(payload) => payload,
            Err(AuthError::ClientError { payload, .. }) => {
                let message = payload
                    .as_ref()
                    .and_then(error_message)
                    .unwrap_or_else(|| INVALID_CREDENTIALS_MESSAGE.to_string());
                return Ok(self.sign_in_rejected(message, true));
            }
            Err(AuthError::AuthFailure) => {
                return Ok(self.sign_in_rejected(INVALID_CREDENTIALS_MESSAGE.to_string(), true));
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Sign-in request got no usable response");
                return Ok(self.sign_in_rejected(UNREACHABLE_MESSAGE.to_string(), true));
            }
            Err(e) => return Err(e),
        };

        let Some(token) = first_string(&payload, &["token", "access", "access_token"]) else {
            warn!("Sign-in response carried no token");
            let message =
                error_message(&payload).unwrap_or_else(|| INVALID_CREDENTIALS_MESSAGE.to_string());
            return Ok(self.sign_in_rejected(message, false));
        };

        let refresh_token = first_string(&payload, &["refresh", "refresh_token"]);
        let expires_in = payload.get("expires_in").and_then(Value::as_i64);

        self.credentials()
            .set_credential(&token, refresh_token.as_deref(), expires_in)
            .await?;

        let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::SignedIn {
            username: username.to_string(),
        }));

        info!(has_refresh_token = refresh_token.is_some(), "Signed in");
        Ok(SignInResult::succeeded(token))
    }

    /// Forget the credential. Always completes locally.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) {
        if let Err(e) = self.credentials().clear_credential().await {
            warn!(error = %e, "Stored credential could not be fully removed");
        }

        let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::SignedOut));
        info!("Signed out");
    }

    /// Send an authenticated request and return the decoded body.
    ///
    /// `body` is ignored for `GET` and `HEAD`.
    pub async fn request(&self, method: HttpMethod, path: &str, body: Option<Value>) -> Result<Value> {
        let mut request = ApiRequest::new(method, path);
        request.body = body;
        self.dispatcher.send(request).await
    }

    /// True if an access token is held. Says nothing about server-side
    /// validity.
    pub async fn is_authenticated(&self) -> bool {
        self.credentials().access_token().await.is_some()
    }

    pub async fn auth_state(&self) -> AuthState {
        if self.dispatcher.coordinator().is_refreshing().await {
            AuthState::TokenRefreshing
        } else if self.is_authenticated().await {
            AuthState::SignedIn
        } else {
            AuthState::SignedOut
        }
    }

    pub async fn credential_snapshot(&self) -> CredentialSnapshot {
        self.credentials().snapshot().await
    }

    /// Create an account.
    ///
    /// The payload is forwarded as-is. A 4xx answer is returned as a failed
    /// [`RegistrationResult`] carrying the server's field errors.
    #[instrument(skip(self, payload))]
    pub async fn register(&self, payload: &Value) -> Result<RegistrationResult> {
        let request = ApiRequest::post(&self.endpoints.register, payload.clone()).public();

        match self.dispatcher.send(request).await {
            Ok(data) => {
                info!("Account registered");
                Ok(RegistrationResult {
                    success: true,
                    data: Some(data),
                    errors: json!({}),
                })
            }
            Err(AuthError::ClientError {
                payload, message, ..
            }) => {
                info!(message = %message, "Registration rejected");
                Ok(RegistrationResult {
                    success: false,
                    data: None,
                    errors: payload.unwrap_or_else(|| json!({ "detail": message })),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Ask the server to email a password reset token.
    #[instrument(skip(self, email))]
    pub async fn request_password_reset(&self, email: &str) -> Result<()> {
        let request =
            ApiRequest::post(&self.endpoints.password_reset, json!({ "email": email })).public();
        self.dispatcher.send(request).await?;
        info!("Password reset requested");
        Ok(())
    }

    /// Set a new password using a reset token.
    #[instrument(skip(self, token, password))]
    pub async fn confirm_password_reset(&self, token: &str, password: &str) -> Result<()> {
        let request = ApiRequest::post(
            &self.endpoints.password_reset_confirm,
            json!({ "token": token, "password": password }),
        )
        .public();
        self.dispatcher.send(request).await?;
        info!("Password reset confirmed");
        Ok(())
    }

    fn sign_in_rejected(&self, message: String, recoverable: bool) -> SignInResult {
        info!(message = %message, "Sign-in rejected");
        let _ = self.event_bus.emit(CoreEvent::Auth(AuthEvent::AuthError {
            message: message.clone(),
            recoverable,
        }));
        SignInResult::failed(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_desktop::InMemorySecureStore;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::{HttpClient, HttpRequest, HttpResponse, SecureStore, SystemClock};
    use core_runtime::config::StorageKeys;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Answers requests from a queue and records what was sent.
    #[derive(Default)]
    struct QueuedHttpClient {
        responses: Mutex<VecDeque<BridgeResult<HttpResponse>>>,
        sent: Mutex<Vec<HttpRequest>>,
    }

    impl QueuedHttpClient {
        fn respond(&self, status: u16, body: Value) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Ok(HttpResponse::new(status, body.to_string())));
        }

        fn fail(&self) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Err(BridgeError::OperationFailed("connection refused".into())));
        }
    }

    #[async_trait]
    impl HttpClient for QueuedHttpClient {
        async fn execute(&self, request: HttpRequest) -> BridgeResult<HttpResponse> {
            self.sent.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BridgeError::NotAvailable("no scripted response".into())))
        }
    }

    fn session(http: Arc<QueuedHttpClient>) -> (SessionManager, Arc<InMemorySecureStore>, EventBus) {
        let secure = Arc::new(InMemorySecureStore::new());
        let bus = EventBus::new(32);
        let credentials =
            CredentialStore::new(secure.clone(), Arc::new(SystemClock), StorageKeys::default());
        let settings = DispatcherSettings {
            base_url: "https://app.example.com/api".to_string(),
            request_timeout: Duration::from_secs(5),
            auth_scheme: "Token".to_string(),
            refresh_path: "/auth/refresh/".to_string(),
        };
        let dispatcher = RequestDispatcher::new(http, credentials, settings, bus.clone());
        (
            SessionManager::new(dispatcher, AuthEndpoints::default(), bus.clone()),
            secure,
            bus,
        )
    }

    #[tokio::test]
    async fn test_sign_in_stores_token_and_emits_event() {
        let http = Arc::new(QueuedHttpClient::default());
        http.respond(200, json!({ "token": "abc123" }));
        let (session, secure, bus) = session(http.clone());
        let mut events = bus.subscribe();

        let result = session.sign_in("coach", "secret").await.unwrap();
        assert!(result.success);
        assert_eq!(result.token.as_deref(), Some("abc123"));
        assert!(session.is_authenticated().await);
        assert_eq!(session.auth_state().await, AuthState::SignedIn);
        assert_eq!(
            secure.get_secret("userToken").await.unwrap(),
            Some(b"abc123".to_vec())
        );

        let sent = http.sent.lock().unwrap();
        assert_eq!(sent[0].url, "https://app.example.com/api/auth");
        assert_eq!(sent[0].header_value("Authorization"), None);
        drop(sent);

        // Request events come first; find the sign-in announcement
        loop {
            match events.recv().await.unwrap() {
                CoreEvent::Auth(AuthEvent::SignedIn { username }) => {
                    assert_eq!(username, "coach");
                    break;
                }
                CoreEvent::Request(_) => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_sign_in_rejection_uses_server_message() {
        let http = Arc::new(QueuedHttpClient::default());
        http.respond(
            400,
            json!({ "non_field_errors": ["Unable to log in with provided credentials."] }),
        );
        http.respond(400, json!({ "password": ["This field is required."] }));
        let (session, _, _) = session(http);

        let result = session.sign_in("coach", "wrong").await.unwrap();
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Unable to log in with provided credentials.")
        );

        let result = session.sign_in("coach", "").await.unwrap();
        assert_eq!(result.error.as_deref(), Some(INVALID_CREDENTIALS_MESSAGE));
        assert!(!session.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_sign_in_unreachable_server() {
        let http = Arc::new(QueuedHttpClient::default());
        http.fail();
        http.respond(502, json!({}));
        let (session, _, _) = session(http);

        for _ in 0..2 {
            let result = session.sign_in("coach", "secret").await.unwrap();
            assert!(!result.success);
            assert_eq!(result.error.as_deref(), Some(UNREACHABLE_MESSAGE));
        }
    }

    #[tokio::test]
    async fn test_sign_in_without_token_fails() {
        let http = Arc::new(QueuedHttpClient::default());
        http.respond(200, json!({ "user": "coach" }));
        let (session, _, _) = session(http);

        let result = session.sign_in("coach", "secret").await.unwrap();
        assert!(!result.success);
        assert!(!session.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_sign_out_clears_credential() {
        let http = Arc::new(QueuedHttpClient::default());
        http.respond(200, json!({ "token": "abc123", "refresh": "r-1" }));
        let (session, secure, _) = session(http);

        session.sign_in("coach", "secret").await.unwrap();
        assert!(session.credential_snapshot().await.has_refresh_token);

        session.sign_out().await;
        session.sign_out().await;

        assert!(!session.is_authenticated().await);
        assert_eq!(session.auth_state().await, AuthState::SignedOut);
        assert!(secure.is_empty().await);
    }

    #[tokio::test]
    async fn test_register_returns_field_errors() {
        let http = Arc::new(QueuedHttpClient::default());
        http.respond(
            400,
            json!({ "username": ["A user with that username already exists."] }),
        );
        http.respond(201, json!({ "id": 12, "username": "new-coach" }));
        let (session, _, _) = session(http.clone());

        let payload = json!({ "username": "coach", "password": "secret" });
        let result = session.register(&payload).await.unwrap();
        assert!(!result.success);
        assert_eq!(
            result.errors["username"][0],
            "A user with that username already exists."
        );

        let result = session.register(&payload).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data.unwrap()["id"], 12);

        let sent = http.sent.lock().unwrap();
        assert!(sent[0].url.ends_with("/auth/register/"));
    }

    #[tokio::test]
    async fn test_password_reset_flow() {
        let http = Arc::new(QueuedHttpClient::default());
        http.respond(200, json!({ "status": "OK" }));
        http.respond(200, json!({ "status": "OK" }));
        http.respond(404, json!({ "detail": "Not found." }));
        let (session, _, _) = session(http.clone());

        session.request_password_reset("coach@example.com").await.unwrap();
        session.confirm_password_reset("t-1", "n3w").await.unwrap();

        let err = session.confirm_password_reset("bad", "n3w").await.unwrap_err();
        assert_eq!(err.status(), Some(404));

        let sent = http.sent.lock().unwrap();
        assert!(sent[0].url.ends_with("/auth/password-reset/"));
        assert!(sent[1].url.ends_with("/auth/password-reset/confirm/"));
        assert_eq!(
            sent[1].body.as_deref(),
            Some(json!({ "token": "t-1", "password": "n3w" }).to_string().as_bytes())
        );
    }
}
