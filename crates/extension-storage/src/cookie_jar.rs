//! Cookie jar implementations of [`CookieStore`].

use crate::cookies::{
    normalize_domain, CookieChange, CookieChangeCause, CookieRecord, CookieStore, SameSite,
};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Jar {
    cookies: Vec<CookieRecord>,
}

impl Jar {
    fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<CookieChange> {
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.cookies)
            .into_iter()
            .partition(|c| c.is_expired_at(now));
        self.cookies = live;

        expired
            .into_iter()
            .map(|cookie| CookieChange {
                cookie,
                removed: true,
                cause: CookieChangeCause::Expired,
            })
            .collect()
    }

    fn lookup(&self, domain: &str, name: &str) -> Option<CookieRecord> {
        self.cookies
            .iter()
            .filter(|c| c.name == name && c.matches_domain(domain))
            .max_by_key(|c| normalize_domain(&c.domain).len())
            .cloned()
    }

    fn visible(&self, domain: &str) -> Vec<CookieRecord> {
        self.cookies
            .iter()
            .filter(|c| c.matches_domain(domain))
            .cloned()
            .collect()
    }

    fn write(&mut self, record: CookieRecord, now: DateTime<Utc>) -> Vec<CookieChange> {
        let expired = record.is_expired_at(now);
        let mut changes = Vec::new();

        if let Some(idx) = self.cookies.iter().position(|c| c.same_slot(&record)) {
            let old = self.cookies.remove(idx);
            changes.push(CookieChange {
                cookie: old,
                removed: true,
                cause: if expired {
                    CookieChangeCause::Expired
                } else {
                    CookieChangeCause::Overwrite
                },
            });
        }

        if !expired {
            self.cookies.push(record.clone());
            changes.push(CookieChange {
                cookie: record,
                removed: false,
                cause: CookieChangeCause::Explicit,
            });
        }

        changes
    }

    fn delete(&mut self, domain: &str, name: &str) -> Vec<CookieChange> {
        let domain = normalize_domain(domain);
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.cookies)
            .into_iter()
            .partition(|c| c.name == name && normalize_domain(&c.domain) == domain);
        self.cookies = kept;

        removed
            .into_iter()
            .map(|cookie| CookieChange {
                cookie,
                removed: true,
                cause: CookieChangeCause::Explicit,
            })
            .collect()
    }
}

/// Apply the browser's write rules.
fn validate(record: &CookieRecord) -> StorageResult<()> {
    if record.name.trim().is_empty() {
        return Err(StorageError::CookieWrite("cookie name is empty".to_string()));
    }
    if normalize_domain(&record.domain).is_empty() {
        return Err(StorageError::CookieWrite(format!(
            "cookie {} has no domain",
            record.name
        )));
    }
    if !record.path.starts_with('/') {
        return Err(StorageError::CookieWrite(format!(
            "cookie {} path must start with '/'",
            record.name
        )));
    }
    if record.same_site == SameSite::NoRestriction && !record.secure {
        return Err(StorageError::CookieWrite(format!(
            "cookie {} uses SameSite=None without Secure",
            record.name
        )));
    }
    Ok(())
}

/// Jar plus change feed shared by both store flavours.
struct SharedJar {
    jar: Mutex<Jar>,
    changes: broadcast::Sender<CookieChange>,
}

impl SharedJar {
    fn new(jar: Jar) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            jar: Mutex::new(jar),
            changes,
        }
    }

    /// Run `f` against the jar after dropping expired cookies, persist if
    /// anything changed, then publish the changes.
    fn mutate<T>(
        &self,
        persist: impl Fn(&Jar) -> StorageResult<()>,
        f: impl FnOnce(&mut Jar, DateTime<Utc>) -> (T, Vec<CookieChange>),
    ) -> StorageResult<T> {
        let now = Utc::now();
        let (value, changes) = {
            let mut jar = self.jar.lock().unwrap_or_else(PoisonError::into_inner);
            let mut changes = jar.purge_expired(now);
            let (value, more) = f(&mut *jar, now);
            changes.extend(more);
            if !changes.is_empty() {
                persist(&*jar)?;
            }
            (value, changes)
        };

        for change in changes {
            // No subscribers is fine.
            let _ = self.changes.send(change);
        }
        Ok(value)
    }
}

fn no_persist(_: &Jar) -> StorageResult<()> {
    Ok(())
}

/// In-memory cookie jar.
pub struct MemoryCookieStore {
    inner: SharedJar,
}

impl MemoryCookieStore {
    pub fn new() -> Self {
        Self {
            inner: SharedJar::new(Jar::default()),
        }
    }
}

impl Default for MemoryCookieStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CookieStore for MemoryCookieStore {
    async fn get(&self, domain: &str, name: &str) -> StorageResult<Option<CookieRecord>> {
        self.inner
            .mutate(no_persist, |jar, _| (jar.lookup(domain, name), Vec::new()))
    }

    async fn get_all(&self, domain: &str) -> StorageResult<Vec<CookieRecord>> {
        self.inner
            .mutate(no_persist, |jar, _| (jar.visible(domain), Vec::new()))
    }

    async fn set(&self, record: CookieRecord) -> StorageResult<CookieRecord> {
        validate(&record)?;
        debug!(name = %record.name, domain = %record.domain, "set cookie");
        self.inner.mutate(no_persist, |jar, now| {
            let changes = jar.write(record.clone(), now);
            (record, changes)
        })
    }

    async fn remove(&self, domain: &str, name: &str) -> StorageResult<()> {
        self.inner
            .mutate(no_persist, |jar, _| ((), jar.delete(domain, name)))
    }

    fn subscribe(&self) -> broadcast::Receiver<CookieChange> {
        self.inner.changes.subscribe()
    }
}

/// Cookie jar persisted as JSON, rewritten after every change.
pub struct FileCookieStore {
    path: PathBuf,
    inner: SharedJar,
}

impl FileCookieStore {
    /// Open the jar at `path`, starting empty if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let jar = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                Jar::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Jar::default()
        };

        debug!(path = %path.display(), cookies = jar.cookies.len(), "opened cookie jar");
        Ok(Self {
            path,
            inner: SharedJar::new(jar),
        })
    }

    fn persist(&self, jar: &Jar) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(jar)?;
        std::fs::write(&self.path, content).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "failed to persist cookie jar");
            StorageError::from(e)
        })
    }
}

#[async_trait]
impl CookieStore for FileCookieStore {
    async fn get(&self, domain: &str, name: &str) -> StorageResult<Option<CookieRecord>> {
        self.inner
            .mutate(|jar| self.persist(jar), |jar, _| (jar.lookup(domain, name), Vec::new()))
    }

    async fn get_all(&self, domain: &str) -> StorageResult<Vec<CookieRecord>> {
        self.inner
            .mutate(|jar| self.persist(jar), |jar, _| (jar.visible(domain), Vec::new()))
    }

    async fn set(&self, record: CookieRecord) -> StorageResult<CookieRecord> {
        validate(&record)?;
        debug!(name = %record.name, domain = %record.domain, "set cookie");
        self.inner.mutate(
            |jar| self.persist(jar),
            |jar, now| {
                let changes = jar.write(record.clone(), now);
                (record, changes)
            },
        )
    }

    async fn remove(&self, domain: &str, name: &str) -> StorageResult<()> {
        self.inner
            .mutate(|jar| self.persist(jar), |jar, _| ((), jar.delete(domain, name)))
    }

    fn subscribe(&self) -> broadcast::Receiver<CookieChange> {
        self.inner.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn secure_cookie(domain: &str, name: &str, value: &str) -> CookieRecord {
        CookieRecord::new(domain, name, value)
            .with_secure(true)
            .with_same_site(SameSite::NoRestriction)
            .expires_at(Utc::now() + Duration::hours(1))
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let store = MemoryCookieStore::new();
        store
            .set(secure_cookie("api.example.com", "access_token", "tok1"))
            .await
            .unwrap();

        let cookie = store.get("api.example.com", "access_token").await.unwrap();
        assert_eq!(cookie.unwrap().value, "tok1");
        assert!(store.get("api.example.com", "refresh_token").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_site_none_requires_secure() {
        let store = MemoryCookieStore::new();
        let insecure = CookieRecord::new("api.example.com", "access_token", "tok1")
            .with_same_site(SameSite::NoRestriction);

        let result = store.set(insecure).await;
        assert!(matches!(result, Err(StorageError::CookieWrite(_))));
        assert!(store.get_all("api.example.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_domain_rejected() {
        let store = MemoryCookieStore::new();
        let result = store.set(CookieRecord::new(".", "access_token", "tok1")).await;
        assert!(matches!(result, Err(StorageError::CookieWrite(_))));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_slot() {
        let store = MemoryCookieStore::new();
        let mut changes = store.subscribe();

        store.set(secure_cookie("example.com", "access_token", "old")).await.unwrap();
        store.set(secure_cookie("example.com", "access_token", "new")).await.unwrap();

        let all = store.get_all("example.com").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, "new");

        let first = changes.recv().await.unwrap();
        assert!(!first.removed);
        let overwrite = changes.recv().await.unwrap();
        assert!(overwrite.removed);
        assert_eq!(overwrite.cause, CookieChangeCause::Overwrite);
        assert_eq!(overwrite.cookie.value, "old");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let store = MemoryCookieStore::new();
        store.set(secure_cookie("example.com", "access_token", "tok")).await.unwrap();

        store.remove("example.com", "access_token").await.unwrap();
        store.remove("example.com", "access_token").await.unwrap();
        store.remove("other.com", "missing").await.unwrap();

        assert!(store.get("example.com", "access_token").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_emits_explicit_change() {
        let store = MemoryCookieStore::new();
        store.set(secure_cookie("example.com", "access_token", "tok")).await.unwrap();
        let mut changes = store.subscribe();

        store.remove(".example.com", "access_token").await.unwrap();

        let change = changes.recv().await.unwrap();
        assert!(change.removed);
        assert_eq!(change.cause, CookieChangeCause::Explicit);
        assert_eq!(change.cookie.name, "access_token");
    }

    #[tokio::test]
    async fn test_past_expiration_removes_cookie() {
        let store = MemoryCookieStore::new();
        store.set(secure_cookie("example.com", "access_token", "tok")).await.unwrap();

        let expired = secure_cookie("example.com", "access_token", "")
            .expires_at(Utc::now() - Duration::hours(1));
        store.set(expired).await.unwrap();

        assert!(store.get("example.com", "access_token").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_most_specific_domain_wins() {
        let store = MemoryCookieStore::new();
        store.set(secure_cookie(".example.com", "access_token", "parent")).await.unwrap();
        store.set(secure_cookie("api.example.com", "access_token", "child")).await.unwrap();

        let cookie = store.get("api.example.com", "access_token").await.unwrap().unwrap();
        assert_eq!(cookie.value, "child");
        let cookie = store.get("example.com", "access_token").await.unwrap().unwrap();
        assert_eq!(cookie.value, "parent");
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cookies.json");

        {
            let store = FileCookieStore::open(&path).unwrap();
            store.set(secure_cookie("example.com", "access_token", "tok1")).await.unwrap();
            store.set(secure_cookie("example.com", "refresh_token", "tok2")).await.unwrap();
            store.remove("example.com", "refresh_token").await.unwrap();
        }

        let store = FileCookieStore::open(&path).unwrap();
        let all = store.get_all("example.com").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, "tok1");
    }
}
