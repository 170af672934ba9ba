//! # Authenticated Request Pipeline
//!
//! Session credential handling for the coaching platform client.
//!
//! ## Overview
//!
//! Every API call carries the stored credential. When the server answers
//! 401, the pipeline refreshes the credential once, replays the failed
//! requests in order and only surfaces `SessionExpired` after the
//! credential has been cleared.
//!
//! ## Components
//!
//! - [`CredentialStore`]: in-memory cache over the platform secure store
//! - [`RequestDispatcher`]: attaches the credential and classifies responses
//! - [`RefreshCoordinator`]: single-flight refresh with a FIFO waiter queue
//! - [`SessionManager`]: sign-in, sign-out and account operations

pub mod credential_store;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod refresh;
pub mod types;

pub use credential_store::CredentialStore;
pub use dispatcher::{ApiRequest, DispatcherSettings, RequestDispatcher, RequestOptions};
pub use error::{AuthError, Result};
pub use manager::SessionManager;
pub use refresh::{RefreshCoordinator, RefreshHandler, RefreshOutcome};
pub use types::{AuthState, Credential, CredentialSnapshot, RegistrationResult, SignInResult};
