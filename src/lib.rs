//! Workspace umbrella crate.
//!
//! Re-exports `core-service` behind the workspace feature flags so host
//! applications can depend on `coach-client-workspace` alone.

#[cfg(feature = "desktop-shims")]
pub use core_service::*;
