//! # Request Dispatcher
//!
//! Every outbound API call goes through [`RequestDispatcher::send`]. The
//! dispatcher attaches the current credential, bounds the call with a
//! timeout, classifies the response and, on a 401, hands the request to the
//! [`RefreshCoordinator`](crate::refresh::RefreshCoordinator).
//!
//! ## Classification
//!
//! | Response                     | Result                          |
//! |------------------------------|---------------------------------|
//! | 2xx                          | decoded JSON (`null` if empty)  |
//! | 401                          | refresh and retry, or `SessionExpired` |
//! | other 4xx                    | `ClientError`                   |
//! | 5xx and unexpected statuses  | `ServerError`                   |
//! | no response / timeout        | `TransportError`                |
//!
//! ## Retry policy
//!
//! A request is retried at most once after an auth failure. If the retry is
//! rejected with 401 too, the credential is cleared and the caller receives
//! `SessionExpired`.

use crate::credential_store::CredentialStore;
use crate::error::{AuthError, Result};
use crate::refresh::{RefreshCoordinator, RefreshHandler, RefreshOutcome};
use async_trait::async_trait;
use bridge_traits::{BridgeError, HttpClient, HttpMethod, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use core_runtime::config::CoreConfig;
use core_runtime::events::{AuthEvent, CoreEvent, EventBus, RequestEvent, RequestOutcome};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Extra headers, sent after the defaults so they can override them.
    pub headers: HashMap<String, String>,
    /// Query pairs appended to the URL.
    pub query: Vec<(String, String)>,
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
    /// Return a 401 as `AuthFailure` instead of refreshing.
    pub skip_auth_handling: bool,
    /// Send without an `Authorization` header even when a credential exists.
    pub anonymous: bool,
}

/// Description of one API call, relative to the base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub body: Option<Value>,
    pub options: RequestOptions,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            options: RequestOptions::default(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, path).body(body)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn skip_auth_handling(mut self) -> Self {
        self.options.skip_auth_handling = true;
        self
    }

    /// Unauthenticated call that reports a 401 as-is. Used for login,
    /// registration and the refresh call itself.
    pub fn public(mut self) -> Self {
        self.options.anonymous = true;
        self.options.skip_auth_handling = true;
        self
    }
}

/// Dispatcher settings derived from [`CoreConfig`].
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub base_url: String,
    pub request_timeout: Duration,
    pub auth_scheme: String,
    pub refresh_path: String,
}

impl DispatcherSettings {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            request_timeout: config.request_timeout,
            auth_scheme: config.auth_scheme.clone(),
            refresh_path: config.endpoints.refresh.clone(),
        }
    }
}

/// Sends API requests with the session credential attached.
///
/// Cloning is cheap; clones share the credential store and the refresh
/// coordinator.
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    http_client: Arc<dyn HttpClient>,
    credentials: CredentialStore,
    settings: DispatcherSettings,
    event_bus: EventBus,
    coordinator: RefreshCoordinator,
}

impl RequestDispatcher {
    pub fn new(
        http_client: Arc<dyn HttpClient>,
        credentials: CredentialStore,
        settings: DispatcherSettings,
        event_bus: EventBus,
    ) -> Self {
        let coordinator = RefreshCoordinator::new(event_bus.clone());
        Self {
            inner: Arc::new(DispatcherInner {
                http_client,
                credentials,
                settings,
                event_bus,
                coordinator,
            }),
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.inner.coordinator
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.inner.settings
    }

    /// Send a request and return the decoded response body.
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn send(&self, request: ApiRequest) -> Result<Value> {
        let (result, token_used) = self.inner.attempt(&request, false).await;

        match result {
            Err(AuthError::AuthFailure) if !request.options.skip_auth_handling => {
                self.handle_auth_failure(request, token_used).await
            }
            other => other,
        }
    }

    /// Send a request and decode the body into `T`.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let path = request.path.clone();
        let value = self.send(request).await?;
        serde_json::from_value(value).map_err(|e| {
            warn!(path = %path, error = %e, "Response did not match the expected shape");
            AuthError::InvalidResponse(format!("{}: {}", path, e))
        })
    }

    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let request = query
            .iter()
            .fold(ApiRequest::get(path), |req, (k, v)| req.query(*k, *v));
        self.send(request).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.send(ApiRequest::post(path, body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<Value> {
        self.send(ApiRequest::new(HttpMethod::Put, path).body(body))
            .await
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<Value> {
        self.send(ApiRequest::new(HttpMethod::Patch, path).body(body))
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.send(ApiRequest::new(HttpMethod::Delete, path)).await
    }

    async fn handle_auth_failure(
        &self,
        request: ApiRequest,
        token_used: Option<String>,
    ) -> Result<Value> {
        let current = self.inner.credentials.access_token().await;

        // A refresh already replaced the token this request was sent with
        if current.is_some() && current != token_used {
            debug!(path = %request.path, "Credential changed in flight, replaying with current token");
            return self.inner.replay(request).await;
        }

        if self.inner.credentials.refresh_token().await.is_none() {
            info!(path = %request.path, "Auth failure without a refresh credential");
            self.inner.expire_session("no_refresh_credential").await;
            return Err(AuthError::SessionExpired);
        }

        let handler: Arc<dyn RefreshHandler> = self.inner.clone();
        match self.inner.coordinator.submit(request, handler).await {
            RefreshOutcome::Retried(result) => result,
            RefreshOutcome::Expired => Err(AuthError::SessionExpired),
        }
    }
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl DispatcherInner {
    /// One transport round trip. Returns the classified result and the
    /// token the request carried.
    async fn attempt(&self, request: &ApiRequest, replay: bool) -> (Result<Value>, Option<String>) {
        let token = if request.options.anonymous {
            None
        } else {
            self.credentials.access_token().await
        };

        let http_request = match self.build_http_request(request, token.as_deref()) {
            Ok(http_request) => http_request,
            Err(e) => return (Err(e), token),
        };

        let timeout = request
            .options
            .timeout
            .unwrap_or(self.settings.request_timeout);
        let started = Instant::now();

        let response = tokio::time::timeout(timeout, self.http_client.execute(http_request)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let (result, status) = match response {
            Ok(Ok(response)) => (classify(&response), Some(response.status)),
            Ok(Err(e)) => (Err(transport_error(e)), None),
            Err(_) => (
                Err(AuthError::TransportError(format!(
                    "request timed out after {} ms",
                    timeout.as_millis()
                ))),
                None,
            ),
        };

        self.report(request, status, elapsed_ms, &result, replay);
        (result, token)
    }

    fn build_http_request(&self, request: &ApiRequest, token: Option<&str>) -> Result<HttpRequest> {
        let url = self.build_url(&request.path, &request.options.query)?;

        let mut http_request = HttpRequest::new(request.method, url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json");

        if let Some(token) = token {
            http_request = http_request.authorization(&self.settings.auth_scheme, token);
        }

        if !request.method.is_read_only() {
            if let Some(body) = &request.body {
                http_request = http_request
                    .json(body)
                    .map_err(|e| AuthError::Serialization(e.to_string()))?;
            }
        }

        for (key, value) in &request.options.headers {
            http_request = http_request.header(key.clone(), value.clone());
        }

        Ok(http_request)
    }

    fn build_url(&self, path: &str, query: &[(String, String)]) -> Result<String> {
        let raw = format!("{}{}", self.settings.base_url, path);
        if query.is_empty() {
            return Ok(raw);
        }

        let mut url = Url::parse(&raw)
            .map_err(|e| AuthError::Config(format!("Invalid request URL '{}': {}", raw, e)))?;
        url.query_pairs_mut().extend_pairs(query);
        Ok(url.into())
    }

    fn report(
        &self,
        request: &ApiRequest,
        status: Option<u16>,
        elapsed_ms: u64,
        result: &Result<Value>,
        replay: bool,
    ) {
        let outcome = match result {
            Ok(_) => RequestOutcome::Success,
            Err(AuthError::AuthFailure) => RequestOutcome::AuthFailure,
            Err(AuthError::ClientError { .. }) => RequestOutcome::ClientError,
            Err(AuthError::ServerError { .. }) => RequestOutcome::ServerError,
            Err(_) => RequestOutcome::TransportError,
        };

        match result {
            Ok(_) => debug!(
                method = %request.method,
                path = %request.path,
                status = status,
                elapsed_ms = elapsed_ms,
                replay = replay,
                "Request completed"
            ),
            Err(e) => warn!(
                method = %request.method,
                path = %request.path,
                status = status,
                elapsed_ms = elapsed_ms,
                replay = replay,
                error = %e,
                "Request failed"
            ),
        }

        let _ = self
            .event_bus
            .emit(CoreEvent::Request(RequestEvent::Completed {
                method: request.method.to_string(),
                path: request.path.clone(),
                status,
                elapsed_ms,
                outcome,
                replay,
            }));
    }
}

#[async_trait]
impl RefreshHandler for DispatcherInner {
    async fn refresh_credential(&self) -> Result<Option<DateTime<Utc>>> {
        let refresh_token = self
            .credentials
            .refresh_token()
            .await
            .ok_or(AuthError::SessionExpired)?;

        let request =
            ApiRequest::post(&self.settings.refresh_path, json!({ "refresh": refresh_token }))
                .public();
        let (result, _) = self.attempt(&request, false).await;
        let grant = RefreshGrant::from_payload(&result?).ok_or_else(|| {
            AuthError::InvalidResponse("refresh response carried no access token".to_string())
        })?;

        let refresh_token = grant.refresh_token.unwrap_or(refresh_token);
        if let Err(e) = self
            .credentials
            .set_credential(&grant.access_token, Some(refresh_token.as_str()), grant.expires_in)
            .await
        {
            // The new credential is live in memory; the next launch re-authenticates
            warn!(error = %e, "Refreshed credential could not be persisted");
        }

        Ok(self.credentials.expires_at().await)
    }

    async fn replay(&self, request: ApiRequest) -> Result<Value> {
        let (result, _) = self.attempt(&request, true).await;
        match result {
            Err(AuthError::AuthFailure) => {
                warn!(path = %request.path, "Replayed request rejected again");
                self.expire_session("replay_rejected").await;
                Err(AuthError::SessionExpired)
            }
            other => other,
        }
    }

    async fn expire_session(&self, reason: &str) {
        if let Err(e) = self.credentials.clear_credential().await {
            warn!(error = %e, "Failed to clear stored credential on session expiry");
        }
        info!(reason = reason, "Session expired");
        let _ = self
            .event_bus
            .emit(CoreEvent::Auth(AuthEvent::SessionExpired {
                reason: reason.to_string(),
            }));
    }
}

/// Token material returned by the refresh endpoint.
struct RefreshGrant {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

impl RefreshGrant {
    fn from_payload(payload: &Value) -> Option<Self> {
        let access_token = first_string(payload, &["access", "token", "access_token"])?;
        Some(Self {
            access_token,
            refresh_token: first_string(payload, &["refresh", "refresh_token"]),
            expires_in: payload.get("expires_in").and_then(Value::as_i64),
        })
    }
}

/// First non-empty string among `keys`.
pub(crate) fn first_string(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| payload.get(*key).and_then(Value::as_str))
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

fn transport_error(error: BridgeError) -> AuthError {
    match error {
        BridgeError::Timeout(after) => {
            AuthError::TransportError(format!("request timed out after {} ms", after.as_millis()))
        }
        other => AuthError::TransportError(other.to_string()),
    }
}

fn classify(response: &HttpResponse) -> Result<Value> {
    let status = response.status;

    if response.is_success() {
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        return serde_json::from_slice(&response.body)
            .map_err(|e| AuthError::InvalidResponse(format!("body is not JSON: {}", e)));
    }

    if status == 401 {
        return Err(AuthError::AuthFailure);
    }

    let payload: Option<Value> = serde_json::from_slice(&response.body).ok();
    let message = payload
        .as_ref()
        .and_then(error_message)
        .or_else(|| {
            response
                .text()
                .ok()
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty())
        })
        .unwrap_or_else(|| format!("HTTP {}", status));

    if response.is_client_error() {
        Err(AuthError::ClientError {
            status,
            message,
            payload,
        })
    } else {
        Err(AuthError::ServerError { status, message })
    }
}

/// Human-readable message from a Django REST Framework style error body.
pub(crate) fn error_message(payload: &Value) -> Option<String> {
    if let Some(message) = first_string(payload, &["detail", "error", "message"]) {
        return Some(message);
    }

    let non_field = payload.get("non_field_errors")?;
    match non_field {
        Value::String(message) => Some(message.clone()),
        Value::Array(items) => {
            let messages: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
            (!messages.is_empty()).then(|| messages.join(" "))
        }
        _ => None,
    }
}
