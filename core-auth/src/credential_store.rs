//! Credential Store
//!
//! Owns the access credential, the refresh credential and the expiry, both
//! in memory and in the platform secure store.
//!
//! ## Behavior
//!
//! - Reads never fail. A storage error is logged and read as "no token", so
//!   a broken keychain degrades to the signed-out state instead of an error
//!   screen.
//! - Writes update memory first and then persist. The in-memory value stays
//!   authoritative for the rest of the process even if persisting fails.
//! - Each field lives in its own slot (`userToken`, `refreshToken`,
//!   `tokenExpiry` by default). Expiry is stored as epoch milliseconds.
//!
//! ## Example
//!
//! ```no_run
//! use core_auth::CredentialStore;
//! use core_runtime::config::StorageKeys;
//! use bridge_traits::{SecureStore, SystemClock};
//! use std::sync::Arc;
//! # async fn example(secure_store: Arc<dyn SecureStore>) -> core_auth::Result<()> {
//! let store = CredentialStore::new(secure_store, Arc::new(SystemClock), StorageKeys::default());
//!
//! store.set_credential("abc123", Some("r-1"), Some(3600)).await?;
//! assert_eq!(store.access_token().await.as_deref(), Some("abc123"));
//!
//! store.clear_credential().await?;
//! assert!(store.access_token().await.is_none());
//! # Ok(())
//! # }
//! ```

use crate::error::{AuthError, Result};
use crate::types::{Credential, CredentialSnapshot};
use bridge_traits::{Clock, SecureStore};
use chrono::{DateTime, Utc};
use core_runtime::config::StorageKeys;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// What memory knows about one storage slot.
#[derive(Debug, Clone, Default, PartialEq)]
enum Cached {
    /// Not read from storage yet
    #[default]
    Unknown,
    /// Known to hold nothing; storage is not consulted again
    Absent,
    Present(String),
}

impl Cached {
    fn from_option(value: Option<String>) -> Self {
        match value {
            Some(value) => Cached::Present(value),
            None => Cached::Absent,
        }
    }
}

#[derive(Default)]
struct CachedCredential {
    access_token: Cached,
    refresh_token: Cached,
    /// Epoch milliseconds, as stored
    expires_at: Cached,
    /// Bumped on every write so a slow storage read cannot resurrect a value
    /// that was replaced or cleared while the read was in flight.
    generation: u64,
}

impl CachedCredential {
    fn slot(&self, slot: &Slot) -> &Cached {
        match slot {
            Slot::Access => &self.access_token,
            Slot::Refresh => &self.refresh_token,
            Slot::Expiry => &self.expires_at,
        }
    }

    fn slot_mut(&mut self, slot: &Slot) -> &mut Cached {
        match slot {
            Slot::Access => &mut self.access_token,
            Slot::Refresh => &mut self.refresh_token,
            Slot::Expiry => &mut self.expires_at,
        }
    }
}

enum Slot {
    Access,
    Refresh,
    Expiry,
}

/// In-memory cache in front of the platform secure store.
///
/// Cloning is cheap and every clone shares the same cache.
#[derive(Clone)]
pub struct CredentialStore {
    secure_store: Arc<dyn SecureStore>,
    clock: Arc<dyn Clock>,
    keys: StorageKeys,
    cache: Arc<RwLock<CachedCredential>>,
}

impl CredentialStore {
    pub fn new(secure_store: Arc<dyn SecureStore>, clock: Arc<dyn Clock>, keys: StorageKeys) -> Self {
        debug!("Initializing CredentialStore");
        Self {
            secure_store,
            clock,
            keys,
            cache: Arc::new(RwLock::new(CachedCredential::default())),
        }
    }

    pub fn storage_keys(&self) -> &StorageKeys {
        &self.keys
    }

    /// Current access token, from memory or storage.
    pub async fn access_token(&self) -> Option<String> {
        self.read_slot(Slot::Access).await
    }

    /// Current refresh token, from memory or storage.
    pub async fn refresh_token(&self) -> Option<String> {
        self.read_slot(Slot::Refresh).await
    }

    /// Expiry of the access token, if known.
    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.read_slot(Slot::Expiry)
            .await
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
    }

    /// The whole credential, or `None` when no access token exists.
    pub async fn credential(&self) -> Option<Credential> {
        let access_token = self.access_token().await?;
        Some(Credential::new(
            access_token,
            self.refresh_token().await,
            self.expires_at().await,
        ))
    }

    /// Replace the credential.
    ///
    /// `expires_in_secs` is relative to the injected clock. A missing
    /// refresh token or expiry removes the stored value so a restart sees
    /// exactly what memory holds now.
    ///
    /// # Errors
    ///
    /// - `InvalidCredential` if `access_token` is empty (nothing is changed)
    /// - `StorageError` if persisting fails (memory is already updated)
    pub async fn set_credential(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in_secs: Option<i64>,
    ) -> Result<()> {
        if access_token.is_empty() {
            return Err(AuthError::InvalidCredential(
                "access token cannot be empty".to_string(),
            ));
        }

        let refresh_token = refresh_token.filter(|t| !t.is_empty());
        let expires_at = expires_in_secs.map(|secs| {
            self.clock.now().timestamp_millis() + secs.saturating_mul(1000)
        });

        {
            let mut cache = self.cache.write().await;
            cache.access_token = Cached::Present(access_token.to_string());
            cache.refresh_token = Cached::from_option(refresh_token.map(str::to_string));
            cache.expires_at = Cached::from_option(expires_at.map(|ms| ms.to_string()));
            cache.generation += 1;
        }

        self.persist(&self.keys.access_token, Some(access_token))
            .await?;
        self.persist(&self.keys.refresh_token, refresh_token).await?;
        self.persist(
            &self.keys.expires_at,
            expires_at.map(|ms| ms.to_string()).as_deref(),
        )
        .await?;

        info!(
            has_refresh_token = refresh_token.is_some(),
            expires_at = expires_at,
            "Credential stored"
        );
        Ok(())
    }

    /// Forget the credential in memory and in storage.
    ///
    /// Idempotent. Every slot is attempted even if one fails; the first
    /// failure is returned as `StorageError`. Memory reads as signed out
    /// either way, even if a stale value survives in storage.
    pub async fn clear_credential(&self) -> Result<()> {
        {
            let mut cache = self.cache.write().await;
            *cache = CachedCredential {
                access_token: Cached::Absent,
                refresh_token: Cached::Absent,
                expires_at: Cached::Absent,
                generation: cache.generation + 1,
            };
        }

        let mut first_error = None;
        for key in self.keys.all() {
            if let Err(e) = self.secure_store.delete_secret(key).await {
                warn!(key = key, error = %e, "Failed to delete credential slot");
                first_error.get_or_insert(AuthError::StorageError(e.to_string()));
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => {
                info!("Credential cleared");
                Ok(())
            }
        }
    }

    /// True only if an expiry is known and already passed.
    ///
    /// Advisory: the server's 401 is what ends a session.
    pub async fn is_expired(&self) -> bool {
        match self.expires_at().await {
            Some(expires_at) => expires_at <= self.clock.now(),
            None => false,
        }
    }

    pub async fn snapshot(&self) -> CredentialSnapshot {
        CredentialSnapshot {
            has_access_token: self.access_token().await.is_some(),
            has_refresh_token: self.refresh_token().await.is_some(),
            expires_at: self.expires_at().await,
        }
    }

    async fn read_slot(&self, slot: Slot) -> Option<String> {
        let generation = {
            let cache = self.cache.read().await;
            match cache.slot(&slot) {
                Cached::Present(value) => return Some(value.clone()),
                Cached::Absent => return None,
                Cached::Unknown => cache.generation,
            }
        };

        let key = match slot {
            Slot::Access => &self.keys.access_token,
            Slot::Refresh => &self.keys.refresh_token,
            Slot::Expiry => &self.keys.expires_at,
        };
        let loaded = self.load(key).await;

        let mut cache = self.cache.write().await;
        if cache.generation != generation {
            // A write landed while storage was being read; memory wins
            return match cache.slot(&slot) {
                Cached::Present(value) => Some(value.clone()),
                _ => None,
            };
        }
        let cached = cache.slot_mut(&slot);
        if *cached == Cached::Unknown {
            *cached = loaded.clone();
        }
        match loaded {
            Cached::Present(value) => Some(value),
            _ => None,
        }
    }

    /// Read one slot from storage. A read error leaves the slot `Unknown`
    /// so the next read tries again.
    async fn load(&self, key: &str) -> Cached {
        let bytes = match self.secure_store.get_secret(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Cached::Absent,
            Err(e) => {
                warn!(key = key, error = %e, "Failed to read credential slot, treating as absent");
                return Cached::Unknown;
            }
        };

        match String::from_utf8(bytes) {
            Ok(value) if value.is_empty() => Cached::Absent,
            Ok(value) => Cached::Present(value),
            Err(_) => {
                warn!(key = key, "Credential slot is not valid UTF-8, treating as absent");
                Cached::Absent
            }
        }
    }

    async fn persist(&self, key: &str, value: Option<&str>) -> Result<()> {
        let outcome = match value {
            Some(value) => self.secure_store.set_secret(key, value.as_bytes()).await,
            None => self.secure_store.delete_secret(key).await,
        };

        outcome.map_err(|e| {
            warn!(key = key, error = %e, "Failed to persist credential slot");
            AuthError::StorageError(e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::{BridgeError, Result as BridgeResult};
    use bridge_traits::ManualClock;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MockSecureStore {
        data: Mutex<HashMap<String, Vec<u8>>>,
        fail_reads: AtomicBool,
        fail_writes: AtomicBool,
    }

    #[async_trait]
    impl SecureStore for MockSecureStore {
        async fn set_secret(&self, key: &str, value: &[u8]) -> BridgeResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(BridgeError::OperationFailed("keychain locked".into()));
            }
            self.data
                .lock()
                .await
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }

        async fn get_secret(&self, key: &str) -> BridgeResult<Option<Vec<u8>>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(BridgeError::OperationFailed("keychain locked".into()));
            }
            Ok(self.data.lock().await.get(key).cloned())
        }

        async fn delete_secret(&self, key: &str) -> BridgeResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(BridgeError::OperationFailed("keychain locked".into()));
            }
            self.data.lock().await.remove(key);
            Ok(())
        }

        async fn list_keys(&self) -> BridgeResult<Vec<String>> {
            Ok(self.data.lock().await.keys().cloned().collect())
        }

        async fn clear_all(&self) -> BridgeResult<()> {
            self.data.lock().await.clear();
            Ok(())
        }
    }

    fn store_with(secure: Arc<MockSecureStore>, clock: Arc<ManualClock>) -> CredentialStore {
        CredentialStore::new(secure, clock, StorageKeys::default())
    }

    fn fixed_clock() -> Arc<ManualClock> {
        let start = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        Arc::new(ManualClock::new(start))
    }

    #[tokio::test]
    async fn test_set_then_read_round_trip() {
        let secure = Arc::new(MockSecureStore::default());
        let store = store_with(secure.clone(), fixed_clock());

        store
            .set_credential("abc", Some("r-1"), Some(3600))
            .await
            .expect("Failed to store credential");

        assert_eq!(store.access_token().await.as_deref(), Some("abc"));
        assert_eq!(store.refresh_token().await.as_deref(), Some("r-1"));

        let data = secure.data.lock().await;
        assert_eq!(data.get("userToken"), Some(&b"abc".to_vec()));
        assert_eq!(data.get("refreshToken"), Some(&b"r-1".to_vec()));
        assert_eq!(
            data.get("tokenExpiry"),
            Some(&b"1700003600000".to_vec())
        );
    }

    #[tokio::test]
    async fn test_fresh_instance_reads_persisted_credential() {
        let secure = Arc::new(MockSecureStore::default());
        let clock = fixed_clock();
        store_with(secure.clone(), clock.clone())
            .set_credential("abc", None, None)
            .await
            .unwrap();

        let restarted = store_with(secure, clock);
        assert_eq!(restarted.access_token().await.as_deref(), Some("abc"));
        assert_eq!(restarted.refresh_token().await, None);
        assert_eq!(restarted.expires_at().await, None);
    }

    #[tokio::test]
    async fn test_empty_access_token_rejected() {
        let secure = Arc::new(MockSecureStore::default());
        let store = store_with(secure.clone(), fixed_clock());

        let result = store.set_credential("", Some("r-1"), None).await;
        assert!(matches!(result, Err(AuthError::InvalidCredential(_))));
        assert!(store.access_token().await.is_none());
        assert!(secure.data.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_stored_value_reads_as_absent() {
        let secure = Arc::new(MockSecureStore::default());
        secure
            .data
            .lock()
            .await
            .insert("userToken".to_string(), Vec::new());

        let store = store_with(secure, fixed_clock());
        assert!(store.access_token().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_fields_removed_from_storage() {
        let secure = Arc::new(MockSecureStore::default());
        let store = store_with(secure.clone(), fixed_clock());

        store.set_credential("abc", Some("r-1"), Some(60)).await.unwrap();
        store.set_credential("def", None, None).await.unwrap();

        let data = secure.data.lock().await;
        assert_eq!(data.get("userToken"), Some(&b"def".to_vec()));
        assert!(!data.contains_key("refreshToken"));
        assert!(!data.contains_key("tokenExpiry"));
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let secure = Arc::new(MockSecureStore::default());
        let store = store_with(secure.clone(), fixed_clock());

        store.set_credential("abc", Some("r-1"), Some(60)).await.unwrap();
        store.clear_credential().await.unwrap();
        store.clear_credential().await.unwrap();

        assert!(store.access_token().await.is_none());
        assert!(store.refresh_token().await.is_none());
        assert!(secure.data.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_read_error_treated_as_absent() {
        let secure = Arc::new(MockSecureStore::default());
        secure
            .data
            .lock()
            .await
            .insert("userToken".to_string(), b"abc".to_vec());
        secure.fail_reads.store(true, Ordering::SeqCst);

        let store = store_with(secure, fixed_clock());
        assert!(store.access_token().await.is_none());
        assert!(!store.snapshot().await.has_access_token);
    }

    #[tokio::test]
    async fn test_write_error_surfaced_memory_kept() {
        let secure = Arc::new(MockSecureStore::default());
        secure.fail_writes.store(true, Ordering::SeqCst);
        let store = store_with(secure.clone(), fixed_clock());

        let result = store.set_credential("abc", None, None).await;
        assert!(matches!(result, Err(AuthError::StorageError(_))));

        // Memory stays authoritative for this process
        assert_eq!(store.access_token().await.as_deref(), Some("abc"));
        assert!(secure.data.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_clear_does_not_resurrect_credential() {
        let secure = Arc::new(MockSecureStore::default());
        let store = store_with(secure.clone(), fixed_clock());
        store.set_credential("abc", Some("r-1"), Some(60)).await.unwrap();

        secure.fail_writes.store(true, Ordering::SeqCst);
        let result = store.clear_credential().await;
        assert!(matches!(result, Err(AuthError::StorageError(_))));

        // The stale slots are still in storage but memory says signed out
        assert!(secure.data.lock().await.contains_key("userToken"));
        assert!(store.access_token().await.is_none());
        assert!(store.refresh_token().await.is_none());
        assert!(store.expires_at().await.is_none());
        assert!(store.credential().await.is_none());
        assert!(!store.snapshot().await.has_access_token);
    }

    #[tokio::test]
    async fn test_failed_refresh_slot_delete_keeps_memory_authoritative() {
        let secure = Arc::new(MockSecureStore::default());
        let store = store_with(secure.clone(), fixed_clock());
        store.set_credential("abc", Some("r-1"), None).await.unwrap();

        secure.fail_writes.store(true, Ordering::SeqCst);
        let result = store.set_credential("def", None, None).await;
        assert!(matches!(result, Err(AuthError::StorageError(_))));

        assert_eq!(store.access_token().await.as_deref(), Some("def"));
        assert!(store.refresh_token().await.is_none());
    }

    #[tokio::test]
    async fn test_read_error_is_retried_on_next_read() {
        let secure = Arc::new(MockSecureStore::default());
        secure
            .data
            .lock()
            .await
            .insert("userToken".to_string(), b"abc".to_vec());
        secure.fail_reads.store(true, Ordering::SeqCst);

        let store = store_with(secure.clone(), fixed_clock());
        assert!(store.access_token().await.is_none());

        secure.fail_reads.store(false, Ordering::SeqCst);
        assert_eq!(store.access_token().await.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_absent_slot_is_not_reread() {
        let secure = Arc::new(MockSecureStore::default());
        let store = store_with(secure.clone(), fixed_clock());
        assert!(store.refresh_token().await.is_none());

        // Written behind the store's back; memory already knows the slot is empty
        secure
            .data
            .lock()
            .await
            .insert("refreshToken".to_string(), b"r-9".to_vec());
        assert!(store.refresh_token().await.is_none());
    }

    #[tokio::test]
    async fn test_expiry_follows_clock() {
        let secure = Arc::new(MockSecureStore::default());
        let clock = fixed_clock();
        let store = store_with(secure, clock.clone());

        store.set_credential("abc", None, Some(60)).await.unwrap();
        assert!(!store.is_expired().await);

        clock.advance(chrono::Duration::seconds(61));
        assert!(store.is_expired().await);

        // No expiry is never expired
        store.set_credential("abc", None, None).await.unwrap();
        assert!(!store.is_expired().await);
    }

    #[tokio::test]
    async fn test_snapshot_and_credential() {
        let secure = Arc::new(MockSecureStore::default());
        let store = store_with(secure, fixed_clock());

        assert_eq!(store.snapshot().await, CredentialSnapshot::default());
        assert!(store.credential().await.is_none());

        store.set_credential("abc", Some("r-1"), Some(10)).await.unwrap();
        let snapshot = store.snapshot().await;
        assert!(snapshot.has_access_token);
        assert!(snapshot.has_refresh_token);
        assert_eq!(
            snapshot.expires_at.map(|t| t.timestamp_millis()),
            Some(1_700_000_010_000)
        );

        let credential = store.credential().await.unwrap();
        assert_eq!(credential.access_token, "abc");
        assert!(credential.can_refresh());
    }
}
