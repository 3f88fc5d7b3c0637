//! "credentials: include" for reqwest: send jar cookies, keep `Set-Cookie`.

use chrono::{DateTime, Duration, Utc};
use extension_storage::{normalize_domain, CookieRecord, CookieStore, SameSite};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Moves cookies between the jar and HTTP requests/responses the way a
/// browser does for requests made with credentials.
#[derive(Clone)]
pub struct CookieCredentials {
    cookies: Arc<dyn CookieStore>,
}

impl CookieCredentials {
    pub fn new(cookies: Arc<dyn CookieStore>) -> Self {
        Self { cookies }
    }

    /// `Cookie` header value for a request to `url`, if any cookie applies.
    pub async fn header_for(&self, url: &Url) -> Option<HeaderValue> {
        let host = url.host_str()?;
        let secure_context = is_secure_context(url);

        let cookies = match self.cookies.get_all(host).await {
            Ok(cookies) => cookies,
            Err(e) => {
                warn!(host, error = %e, "failed to read cookies for request");
                return None;
            }
        };

        let pairs: Vec<String> = cookies
            .iter()
            .filter(|c| !c.secure || secure_context)
            .filter(|c| path_matches(url.path(), &c.path))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();

        if pairs.is_empty() {
            return None;
        }
        HeaderValue::from_str(&pairs.join("; ")).ok()
    }

    /// Attach the jar's cookies to an outgoing request.
    pub async fn attach(&self, request: &mut reqwest::Request) {
        let url = request.url().clone();
        if let Some(value) = self.header_for(&url).await {
            request.headers_mut().insert(COOKIE, value);
        }
    }

    /// Store every `Set-Cookie` in `headers` received from `url`.
    /// Cookies scoped to a domain the host does not belong to, and cookies
    /// the jar rejects, are dropped, as a browser would.
    pub async fn absorb(&self, url: &Url, headers: &HeaderMap) {
        let Some(host) = url.host_str() else {
            return;
        };

        for raw in headers.get_all(SET_COOKIE) {
            let Ok(raw) = raw.to_str() else {
                continue;
            };
            let Some(record) = parse_set_cookie(raw, host, Utc::now()) else {
                debug!(host, "ignoring malformed Set-Cookie");
                continue;
            };

            if !domain_matches(host, &record.domain) {
                warn!(host, cookie = %record.name, domain = %record.domain, "dropping Set-Cookie for foreign domain");
                continue;
            }

            let name = record.name.clone();
            if let Err(e) = self.cookies.set(record).await {
                warn!(host, cookie = %name, error = %e, "dropping Set-Cookie");
            }
        }
    }
}

/// Browsers treat https and loopback hosts as secure contexts.
fn is_secure_context(url: &Url) -> bool {
    url.scheme() == "https"
        || matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"))
}

/// RFC 6265 domain-match: the host is the domain or one of its subdomains.
/// IP addresses only match themselves.
fn domain_matches(host: &str, cookie_domain: &str) -> bool {
    let host = normalize_domain(host);
    let domain = normalize_domain(cookie_domain);
    if domain.is_empty() {
        return false;
    }
    host == domain
        || (host.ends_with(&format!(".{domain}")) && host.parse::<IpAddr>().is_err())
}

/// RFC 6265 path-match: `/api` covers `/api` and `/api/x` but not `/apiary`.
fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    match request_path.strip_prefix(cookie_path) {
        Some(rest) => rest.is_empty() || cookie_path.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// Parse one `Set-Cookie` header value.
pub(crate) fn parse_set_cookie(raw: &str, host: &str, now: DateTime<Utc>) -> Option<CookieRecord> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.trim().split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut record = CookieRecord::new(host, name, value.trim());
    let mut max_age: Option<i64> = None;
    let mut expires: Option<i64> = None;

    for attribute in parts {
        let (key, val) = match attribute.trim().split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (attribute.trim(), ""),
        };

        match key.to_ascii_lowercase().as_str() {
            "path" if val.starts_with('/') => record.path = val.to_string(),
            "domain" if !val.is_empty() => record.domain = val.to_string(),
            "secure" => record.secure = true,
            "httponly" => record.http_only = true,
            "samesite" => {
                record.same_site = match val.to_ascii_lowercase().as_str() {
                    "none" => SameSite::NoRestriction,
                    "lax" => SameSite::Lax,
                    "strict" => SameSite::Strict,
                    _ => SameSite::Unspecified,
                }
            }
            "max-age" => max_age = val.parse().ok(),
            "expires" => {
                expires = DateTime::parse_from_rfc2822(val)
                    .ok()
                    .map(|d| d.with_timezone(&Utc).timestamp())
            }
            _ => {}
        }
    }

    // Max-Age wins over Expires.
    record.expiration_date = match (max_age, expires) {
        (Some(seconds), _) if seconds <= 0 => Some(now.timestamp() - 1),
        (Some(seconds), _) => Some((now + Duration::seconds(seconds)).timestamp()),
        (None, Some(at)) => Some(at),
        (None, None) => None,
    };

    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use extension_storage::MemoryCookieStore;

    #[test]
    fn test_parse_set_cookie_attributes() {
        let now = Utc::now();
        let record = parse_set_cookie(
            "access_token=tok1; Path=/; HttpOnly; Secure; SameSite=None; Max-Age=3600",
            "api.example.com",
            now,
        )
        .unwrap();

        assert_eq!(record.name, "access_token");
        assert_eq!(record.value, "tok1");
        assert_eq!(record.domain, "api.example.com");
        assert!(record.secure && record.http_only);
        assert_eq!(record.same_site, SameSite::NoRestriction);
        assert_eq!(record.expiration_date, Some(now.timestamp() + 3600));
    }

    #[test]
    fn test_parse_set_cookie_clear() {
        let now = Utc::now();
        let record = parse_set_cookie("access_token=; Path=/; Max-Age=0", "api.example.com", now)
            .unwrap();
        assert!(record.is_expired_at(now));
    }

    #[test]
    fn test_parse_set_cookie_expires_date() {
        let record = parse_set_cookie(
            "user_id=u1; Domain=.example.com; Expires=Wed, 21 Oct 2037 07:28:00 GMT",
            "api.example.com",
            Utc::now(),
        )
        .unwrap();
        assert_eq!(record.domain, ".example.com");
        assert!(record.expiration_date.is_some());
    }

    #[test]
    fn test_parse_set_cookie_rejects_garbage() {
        assert!(parse_set_cookie("no-equals-sign", "example.com", Utc::now()).is_none());
        assert!(parse_set_cookie("=value", "example.com", Utc::now()).is_none());
    }

    #[tokio::test]
    async fn test_secure_cookies_not_sent_over_plain_http() {
        let jar = Arc::new(MemoryCookieStore::new());
        jar.set(CookieRecord::new("api.example.com", "access_token", "tok1").with_secure(true))
            .await
            .unwrap();
        jar.set(CookieRecord::new("api.example.com", "theme", "dark"))
            .await
            .unwrap();
        let credentials = CookieCredentials::new(jar);

        let https = Url::parse("https://api.example.com/auth/status").unwrap();
        let header = credentials.header_for(&https).await.unwrap();
        let header = header.to_str().unwrap();
        assert!(header.contains("access_token=tok1"));
        assert!(header.contains("theme=dark"));

        let http = Url::parse("http://api.example.com/auth/status").unwrap();
        let header = credentials.header_for(&http).await.unwrap();
        assert_eq!(header.to_str().unwrap(), "theme=dark");
    }

    #[tokio::test]
    async fn test_loopback_counts_as_secure() {
        let jar = Arc::new(MemoryCookieStore::new());
        jar.set(CookieRecord::new("127.0.0.1", "access_token", "tok1").with_secure(true))
            .await
            .unwrap();
        let credentials = CookieCredentials::new(jar);

        let url = Url::parse("http://127.0.0.1:8080/auth/status").unwrap();
        assert!(credentials.header_for(&url).await.is_some());
    }

    #[tokio::test]
    async fn test_absorb_writes_and_clears() {
        let jar = Arc::new(MemoryCookieStore::new());
        let credentials = CookieCredentials::new(jar.clone());
        let url = Url::parse("https://api.example.com/auth/refresh").unwrap();

        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("access_token=tok3; Path=/; Secure; SameSite=None; Max-Age=3600"),
        );
        headers.append(SET_COOKIE, HeaderValue::from_static("insecure=x; SameSite=None"));
        credentials.absorb(&url, &headers).await;

        let stored = jar.get("api.example.com", "access_token").await.unwrap();
        assert_eq!(stored.unwrap().value, "tok3");
        assert!(jar.get("api.example.com", "insecure").await.unwrap().is_none());

        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("access_token=; Path=/; Max-Age=0"));
        credentials.absorb(&url, &headers).await;
        assert!(jar.get("api.example.com", "access_token").await.unwrap().is_none());
    }

    #[test]
    fn test_path_match() {
        assert!(path_matches("/", "/"));
        assert!(path_matches("/api", "/"));
        assert!(path_matches("/api", "/api"));
        assert!(path_matches("/api/items", "/api"));
        assert!(path_matches("/api/items", "/api/"));
        assert!(!path_matches("/apiary", "/api"));
        assert!(!path_matches("/", "/api"));
    }

    #[test]
    fn test_domain_match() {
        assert!(domain_matches("api.example.com", "api.example.com"));
        assert!(domain_matches("api.example.com", ".example.com"));
        assert!(domain_matches("API.example.com", "example.com"));
        assert!(!domain_matches("api.example.com", "auth.example.test"));
        assert!(!domain_matches("example.com", "api.example.com"));
        assert!(!domain_matches("badexample.com", "example.com"));
        assert!(!domain_matches("127.0.0.1", "0.0.1"));
    }

    #[tokio::test]
    async fn test_path_scoped_cookie_not_sent_to_sibling_path() {
        let jar = Arc::new(MemoryCookieStore::new());
        jar.set(CookieRecord::new("api.example.com", "scoped", "1").with_path("/api"))
            .await
            .unwrap();
        let credentials = CookieCredentials::new(jar);

        let inside = Url::parse("https://api.example.com/api/items").unwrap();
        assert_eq!(
            credentials.header_for(&inside).await.unwrap().to_str().unwrap(),
            "scoped=1"
        );
        let sibling = Url::parse("https://api.example.com/apiary").unwrap();
        assert!(credentials.header_for(&sibling).await.is_none());
    }

    #[tokio::test]
    async fn test_absorb_drops_foreign_domain() {
        let jar = Arc::new(MemoryCookieStore::new());
        let credentials = CookieCredentials::new(jar.clone());
        let url = Url::parse("https://api.example.com/auth/refresh").unwrap();

        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("access_token=evil; Domain=auth.example.test; Path=/; Secure"),
        );
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("user_id=u1; Domain=example.com; Path=/; Secure"),
        );
        credentials.absorb(&url, &headers).await;

        assert!(jar.get("auth.example.test", "access_token").await.unwrap().is_none());
        assert_eq!(
            jar.get("example.com", "user_id").await.unwrap().unwrap().value,
            "u1"
        );
    }
}
