//! Storage for the auth sync extension.
//!
//! Two kinds of state live here:
//! - **Cookies**: the per-domain cookie jar behind the [`CookieStore`] trait,
//!   with browser write rules (domain matching, `SameSite=None` requires
//!   `secure`, expiry) and a change feed.
//! - **Extension storage**: a key/value store behind [`KeyValueStorage`] and
//!   the [`TokenCache`] that the background process keeps in it.

mod cookie_jar;
mod cookies;
mod keys;
mod kv;
mod token_cache;
mod traits;

pub use cookie_jar::{FileCookieStore, MemoryCookieStore};
pub use cookies::{
    normalize_domain, CookieChange, CookieChangeCause, CookieRecord, CookieStore, SameSite,
};
pub use keys::StorageKeys;
pub use kv::{JsonFileStorage, MemoryStorage};
pub use token_cache::{CachedTokens, TokenCache};
pub use traits::KeyValueStorage;

use thiserror::Error;

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The cookie jar refused a write (bad domain, insecure cross-site cookie).
    #[error("Cookie write rejected: {0}")]
    CookieWrite(String),

    /// Encoding/decoding error
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
