//! Storage key constants.

/// Keys the background process uses in extension storage.
pub struct StorageKeys;

impl StorageKeys {
    /// Cached access token
    pub const ACCESS_TOKEN: &'static str = "access_token";

    /// Cached refresh token
    pub const REFRESH_TOKEN: &'static str = "refresh_token";

    /// Unix milliseconds at which the cached pair was written
    pub const TOKEN_TIMESTAMP: &'static str = "token_timestamp";
}
