//! Writing a token pair into backend-domain cookies.
//!
//! There is exactly one write routine, parameterized by [`DomainConfig`].
//! [`TransferLock`] keeps two writers (for example two mounted UIs) from
//! interleaving their cookie writes, and carries a session epoch so a
//! sign-out can void a transfer that is already in flight.

use crate::domain::{CookieNames, DomainConfig};
use crate::{AuthResult, TokenPair};
use chrono::Utc;
use extension_storage::CookieStore;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Process-wide mutual exclusion for cookie transfers.
#[derive(Debug, Default)]
pub struct TransferLock {
    held: AtomicBool,
    epoch: AtomicU64,
}

impl TransferLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lock without waiting. `None` means another transfer holds it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<TransferGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(TransferGuard {
            lock: Arc::clone(self),
            epoch: self.epoch.load(Ordering::Acquire),
        })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Start a new session epoch. Transfers that began earlier roll back
    /// instead of completing. Does not wait for the lock.
    pub fn invalidate(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Held while a transfer runs; dropping it releases the lock on every path.
#[derive(Debug)]
pub struct TransferGuard {
    lock: Arc<TransferLock>,
    epoch: u64,
}

impl TransferGuard {
    /// False once a sign-out has started a new epoch.
    pub fn is_current(&self) -> bool {
        self.lock.epoch() == self.epoch
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}

/// What a transfer attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Both cookies (or the access cookie alone) were written.
    Written,
    /// Another transfer held the lock; nothing was written.
    AlreadyInProgress,
    /// A sign-out happened mid-transfer; the writes were undone.
    Superseded,
}

/// The single cookie transfer routine.
pub struct CookieTransfer {
    cookies: Arc<dyn CookieStore>,
    domains: DomainConfig,
    lock: Arc<TransferLock>,
}

impl CookieTransfer {
    pub fn new(cookies: Arc<dyn CookieStore>, domains: DomainConfig, lock: Arc<TransferLock>) -> Self {
        Self {
            cookies,
            domains,
            lock,
        }
    }

    pub fn domains(&self) -> &DomainConfig {
        &self.domains
    }

    pub fn lock(&self) -> &Arc<TransferLock> {
        &self.lock
    }

    /// Write `tokens` as backend-domain cookies.
    ///
    /// Without a refresh token only the access cookie is written; an
    /// existing refresh cookie is left alone. A write failure leaves the
    /// transfer incomplete and is returned to the caller.
    pub async fn transfer(&self, tokens: &TokenPair) -> AuthResult<TransferOutcome> {
        let Some(guard) = self.lock.try_acquire() else {
            debug!("transfer already in progress, skipping");
            return Ok(TransferOutcome::AlreadyInProgress);
        };

        let domain = self.domains.backend_domain.clone();
        let now = Utc::now();

        self.cookies
            .set(self.domains.access_cookie(&domain, &tokens.access_token, now))
            .await?;
        if let Some(refresh_token) = &tokens.refresh_token {
            self.cookies
                .set(self.domains.refresh_cookie(&domain, refresh_token, now))
                .await?;
        }

        if !guard.is_current() {
            warn!(domain = %domain, "session ended during transfer, rolling back");
            self.remove_written(&domain, tokens).await;
            return Ok(TransferOutcome::Superseded);
        }

        info!(
            domain = %domain,
            with_refresh = tokens.refresh_token.is_some(),
            "transferred tokens to backend cookies"
        );
        Ok(TransferOutcome::Written)
    }

    async fn remove_written(&self, domain: &str, tokens: &TokenPair) {
        if let Err(e) = self.cookies.remove(domain, CookieNames::ACCESS_TOKEN).await {
            warn!(domain, error = %e, "failed to roll back access cookie");
        }
        if tokens.refresh_token.is_some() {
            if let Err(e) = self.cookies.remove(domain, CookieNames::REFRESH_TOKEN).await {
                warn!(domain, error = %e, "failed to roll back refresh cookie");
            }
        }
    }

    /// Remove the access and refresh cookies on `domain` together. Both
    /// removals are attempted; the first error is returned.
    pub async fn clear_pair(&self, domain: &str) -> AuthResult<()> {
        let access = self.cookies.remove(domain, CookieNames::ACCESS_TOKEN).await;
        let refresh = self.cookies.remove(domain, CookieNames::REFRESH_TOKEN).await;
        debug!(domain, "cleared token cookies");
        access?;
        refresh?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuthError;
    use async_trait::async_trait;
    use extension_storage::{
        CookieChange, CookieRecord, MemoryCookieStore, SameSite, StorageResult,
    };
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{broadcast, Notify};

    /// Cookie store that counts writes and can stall them.
    #[derive(Default)]
    struct StallingStore {
        inner: MemoryCookieStore,
        sets: AtomicUsize,
        entered: Notify,
        release: Notify,
        stall: AtomicBool,
    }

    #[async_trait]
    impl CookieStore for StallingStore {
        async fn get(&self, domain: &str, name: &str) -> StorageResult<Option<CookieRecord>> {
            self.inner.get(domain, name).await
        }
        async fn get_all(&self, domain: &str) -> StorageResult<Vec<CookieRecord>> {
            self.inner.get_all(domain).await
        }
        async fn set(&self, record: CookieRecord) -> StorageResult<CookieRecord> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            if self.stall.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.inner.set(record).await
        }
        async fn remove(&self, domain: &str, name: &str) -> StorageResult<()> {
            self.inner.remove(domain, name).await
        }
        fn subscribe(&self) -> broadcast::Receiver<CookieChange> {
            self.inner.subscribe()
        }
    }

    fn domains() -> DomainConfig {
        DomainConfig::new("api.example.com", "login.example.org")
    }

    fn pair() -> TokenPair {
        TokenPair::new("tok1", Some("tok2".to_string()))
    }

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let lock = TransferLock::new();
        let guard = lock.try_acquire().unwrap();
        assert!(lock.is_held());
        assert!(lock.try_acquire().is_none());

        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn test_invalidate_outdates_guard() {
        let lock = TransferLock::new();
        let guard = lock.try_acquire().unwrap();
        assert!(guard.is_current());

        lock.invalidate();
        assert!(!guard.is_current());
        // Invalidation does not release someone else's lock.
        assert!(lock.is_held());
    }

    #[tokio::test]
    async fn test_transfer_writes_pair_with_cross_site_attributes() {
        let store = Arc::new(MemoryCookieStore::new());
        let transfer = CookieTransfer::new(store.clone(), domains(), TransferLock::new());

        let outcome = transfer.transfer(&pair()).await.unwrap();
        assert_eq!(outcome, TransferOutcome::Written);

        let access = store.get("api.example.com", "access_token").await.unwrap().unwrap();
        let refresh = store.get("api.example.com", "refresh_token").await.unwrap().unwrap();
        assert_eq!(access.value, "tok1");
        assert_eq!(refresh.value, "tok2");
        assert!(access.secure);
        assert_eq!(access.same_site, SameSite::NoRestriction);
        assert!(refresh.expiration_date.unwrap() > access.expiration_date.unwrap());
        assert!(!transfer.lock().is_held());
    }

    #[tokio::test]
    async fn test_concurrent_transfers_write_once() {
        let store = Arc::new(StallingStore::default());
        let transfer = CookieTransfer::new(store.clone(), domains(), TransferLock::new());

        let first = pair();
        let second = TokenPair::new("other", Some("other-refresh".to_string()));
        let (a, b) = tokio::join!(transfer.transfer(&first), transfer.transfer(&second));

        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == TransferOutcome::AlreadyInProgress);
        assert_eq!(
            outcomes,
            vec![TransferOutcome::Written, TransferOutcome::AlreadyInProgress]
        );
        assert_eq!(store.sets.load(Ordering::SeqCst), 2);
        let access = store.get("api.example.com", "access_token").await.unwrap().unwrap();
        assert_eq!(access.value, "tok1");
    }

    #[tokio::test]
    async fn test_invalidate_mid_transfer_rolls_back() {
        let store = Arc::new(StallingStore::default());
        store.stall.store(true, Ordering::SeqCst);
        let transfer = Arc::new(CookieTransfer::new(
            store.clone(),
            domains(),
            TransferLock::new(),
        ));

        let running = {
            let transfer = transfer.clone();
            tokio::spawn(async move { transfer.transfer(&pair()).await })
        };

        store.entered.notified().await;
        assert!(transfer.lock().is_held());
        transfer.lock().invalidate();
        store.release.notify_one();

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome, TransferOutcome::Superseded);
        assert!(store.get("api.example.com", "access_token").await.unwrap().is_none());
        assert!(store.get("api.example.com", "refresh_token").await.unwrap().is_none());
        assert!(!transfer.lock().is_held());
    }

    #[tokio::test]
    async fn test_rejected_write_releases_lock() {
        let store = Arc::new(MemoryCookieStore::new());
        let mut insecure = domains();
        insecure.secure = false;
        let transfer = CookieTransfer::new(store, insecure, TransferLock::new());

        let err = transfer.transfer(&pair()).await.unwrap_err();
        assert!(matches!(err, AuthError::CookieWrite(_)));
        assert!(!transfer.lock().is_held());
    }

    #[tokio::test]
    async fn test_access_only_keeps_refresh_cookie() {
        let store = Arc::new(MemoryCookieStore::new());
        let transfer = CookieTransfer::new(store.clone(), domains(), TransferLock::new());
        transfer.transfer(&pair()).await.unwrap();

        transfer
            .transfer(&TokenPair::new("tok3", None))
            .await
            .unwrap();

        let access = store.get("api.example.com", "access_token").await.unwrap().unwrap();
        let refresh = store.get("api.example.com", "refresh_token").await.unwrap().unwrap();
        assert_eq!(access.value, "tok3");
        assert_eq!(refresh.value, "tok2");
    }

    #[tokio::test]
    async fn test_clear_pair() {
        let store = Arc::new(MemoryCookieStore::new());
        let transfer = CookieTransfer::new(store.clone(), domains(), TransferLock::new());
        transfer.transfer(&pair()).await.unwrap();

        transfer.clear_pair("api.example.com").await.unwrap();
        transfer.clear_pair("api.example.com").await.unwrap();

        assert!(store.get_all("api.example.com").await.unwrap().is_empty());
    }
}
