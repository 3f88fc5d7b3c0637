//! Background-process token cache in extension storage.
//!
//! Layout is `{access_token, refresh_token, token_timestamp}`. The cache only
//! saves cookie reads; it is never consulted to decide whether a session is
//! valid.

use crate::{KeyValueStorage, StorageError, StorageKeys, StorageResult};
use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use tracing::debug;

/// Tokens read back from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_timestamp: DateTime<Utc>,
}

/// Typed access to the cached token pair.
pub struct TokenCache {
    storage: Box<dyn KeyValueStorage>,
}

impl TokenCache {
    pub fn new(storage: Box<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }

    /// Cache a pair, stamping it with the current time.
    ///
    /// A missing refresh token leaves any cached refresh token in place: a
    /// caller holding only an access token may not drop the other half.
    pub fn store(&self, access_token: &str, refresh_token: Option<&str>) -> StorageResult<()> {
        self.storage.set(StorageKeys::ACCESS_TOKEN, access_token)?;
        if let Some(refresh_token) = refresh_token {
            self.storage.set(StorageKeys::REFRESH_TOKEN, refresh_token)?;
        }
        self.storage.set(
            StorageKeys::TOKEN_TIMESTAMP,
            &Utc::now().timestamp_millis().to_string(),
        )?;
        debug!(has_refresh = refresh_token.is_some(), "cached token pair");
        Ok(())
    }

    /// Read the cached pair, if an access token is cached.
    pub fn load(&self) -> StorageResult<Option<CachedTokens>> {
        let Some(access_token) = self.storage.get(StorageKeys::ACCESS_TOKEN)? else {
            return Ok(None);
        };
        let refresh_token = self.storage.get(StorageKeys::REFRESH_TOKEN)?;
        let token_timestamp = match self.storage.get(StorageKeys::TOKEN_TIMESTAMP)? {
            Some(raw) => parse_timestamp(&raw)?,
            None => DateTime::<Utc>::UNIX_EPOCH,
        };

        Ok(Some(CachedTokens {
            access_token,
            refresh_token,
            token_timestamp,
        }))
    }

    /// Cached access token, if younger than `max_age`.
    pub fn fresh_access_token(&self, max_age: Duration) -> StorageResult<Option<String>> {
        let Some(cached) = self.load()? else {
            return Ok(None);
        };
        let age = Utc::now().signed_duration_since(cached.token_timestamp);
        let fresh = age
            .to_std()
            .map(|age| age <= max_age)
            .unwrap_or(true);

        Ok(fresh.then_some(cached.access_token))
    }

    /// Drop every cached key.
    pub fn clear(&self) -> StorageResult<()> {
        self.storage.delete(StorageKeys::ACCESS_TOKEN)?;
        self.storage.delete(StorageKeys::REFRESH_TOKEN)?;
        self.storage.delete(StorageKeys::TOKEN_TIMESTAMP)?;
        debug!("cleared token cache");
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> StorageResult<DateTime<Utc>> {
    let millis: i64 = raw
        .parse()
        .map_err(|_| StorageError::Encoding(format!("invalid token_timestamp: {raw}")))?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StorageError::Encoding(format!("token_timestamp out of range: {raw}")))
}
