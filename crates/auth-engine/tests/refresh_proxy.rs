mod common;

use auth_engine::AuthError;
use common::*;
use extension_auth_protocol::ExtensionMessage;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, ResponseTemplate};

async fn mount_refresh(harness: &Harness, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({ "refresh_token": "r1" })))
        .respond_with(response)
        .mount(&harness.server)
        .await;
}

fn refreshed() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "access_token": "new",
        "refresh_token": "r2"
    }))
}

fn items_request(harness: &Harness) -> reqwest::Request {
    reqwest::Client::new()
        .get(format!("{}/api/items", harness.server.uri()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn unauthorized_then_ok_refreshes_once_and_retries_once() {
    let harness = Harness::start().await;
    harness.set_backend_tokens(Some("old"), Some("r1")).await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(header("authorization", "Bearer old"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&harness.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(header("authorization", "Bearer new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("items"))
        .mount(&harness.server)
        .await;
    mount_refresh(&harness, refreshed()).await;

    let proxy = harness.ctx.refresh_proxy();
    let response = proxy.fetch_with_auth(items_request(&harness)).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "items");
    assert_eq!(harness.requests_to("/auth/refresh").await, 1);
    assert_eq!(harness.requests_to("/api/items").await, 2);
    let cached = harness.cache().load().unwrap().unwrap();
    assert_eq!(cached.access_token, "new");
    assert_eq!(cached.refresh_token.as_deref(), Some("r2"));
}

#[tokio::test]
async fn unauthorized_after_refresh_fails_without_looping() {
    let harness = Harness::start().await;
    harness.set_backend_tokens(Some("old"), Some("r1")).await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&harness.server)
        .await;
    mount_refresh(&harness, refreshed()).await;
    let mut bus = harness.ctx.bus.subscribe();

    let proxy = harness.ctx.refresh_proxy();
    let result = proxy.fetch_with_auth(items_request(&harness)).await;

    assert!(matches!(result, Err(AuthError::AuthenticationFailed(_))));
    assert_eq!(harness.requests_to("/auth/refresh").await, 1);
    assert_eq!(harness.requests_to("/api/items").await, 2);
    assert_eq!(bus.try_recv().unwrap(), ExtensionMessage::AuthenticationFailed);

    let backend = harness.backend_domain();
    assert_eq!(harness.cookie(&backend, "access_token").await, None);
    assert_eq!(harness.cookie(&backend, "refresh_token").await, None);
    assert_eq!(harness.cache().load().unwrap(), None);
}

#[tokio::test]
async fn rejected_refresh_token_clears_tokens() {
    let harness = Harness::start().await;
    harness.set_backend_tokens(Some("old"), Some("r1")).await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&harness.server)
        .await;
    mount_refresh(&harness, ResponseTemplate::new(400)).await;
    let mut bus = harness.ctx.bus.subscribe();

    let proxy = harness.ctx.refresh_proxy();
    let result = proxy.fetch_with_auth(items_request(&harness)).await;

    assert!(matches!(result, Err(AuthError::AuthenticationFailed(_))));
    assert_eq!(harness.requests_to("/api/items").await, 1);
    assert_eq!(bus.try_recv().unwrap(), ExtensionMessage::AuthenticationFailed);
    assert_eq!(harness.cookie(&harness.backend_domain(), "refresh_token").await, None);
}

#[tokio::test]
async fn transient_refresh_failure_keeps_tokens() {
    let harness = Harness::start().await;
    harness.set_backend_tokens(Some("old"), Some("r1")).await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&harness.server)
        .await;
    mount_refresh(&harness, ResponseTemplate::new(503)).await;
    let mut bus = harness.ctx.bus.subscribe();

    let proxy = harness.ctx.refresh_proxy();
    let error = proxy
        .fetch_with_auth(items_request(&harness))
        .await
        .unwrap_err();

    assert!(error.is_transient());
    assert!(bus.try_recv().is_err());
    let backend = harness.backend_domain();
    assert_eq!(harness.cookie(&backend, "access_token").await.as_deref(), Some("old"));
    assert_eq!(harness.cookie(&backend, "refresh_token").await.as_deref(), Some("r1"));
}

#[tokio::test]
async fn missing_refresh_token_fails_without_calling_refresh() {
    let harness = Harness::start().await;
    harness.set_backend_tokens(Some("old"), None).await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&harness.server)
        .await;

    let proxy = harness.ctx.refresh_proxy();
    let result = proxy.fetch_with_auth(items_request(&harness)).await;

    assert!(matches!(result, Err(AuthError::AuthenticationFailed(_))));
    assert_eq!(harness.requests_to("/auth/refresh").await, 0);
}

#[tokio::test]
async fn other_statuses_pass_through_untouched() {
    let harness = Harness::start().await;
    harness.set_backend_tokens(Some("old"), Some("r1")).await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(header("authorization", "Bearer old"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&harness.server)
        .await;

    let proxy = harness.ctx.refresh_proxy();
    let response = proxy.fetch_with_auth(items_request(&harness)).await.unwrap();

    assert_eq!(response.status(), 500);
    assert_eq!(harness.requests_to("/auth/refresh").await, 0);
}

#[tokio::test]
async fn fresh_cached_token_is_preferred_over_cookie() {
    let harness = Harness::start().await;
    harness.set_backend_tokens(Some("cookie-token"), Some("r1")).await;
    harness.cache().store("cached-token", Some("r1")).unwrap();
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(header("authorization", "Bearer cached-token"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&harness.server)
        .await;

    let proxy = harness.ctx.refresh_proxy();
    let response = proxy.fetch_with_auth(items_request(&harness)).await.unwrap();

    assert_eq!(response.status(), 204);
}

async fn mount_rotating_refresh(harness: &Harness) {
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({ "refresh_token": "r1" })))
        .respond_with(refreshed())
        .up_to_n_times(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({ "refresh_token": "r2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "newer",
            "refresh_token": "r3"
        })))
        .mount(&harness.server)
        .await;
    // A spent refresh token is rejected.
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&harness.server)
        .await;
}

async fn refresh_tokens_sent(harness: &Harness) -> Vec<String> {
    harness
        .server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/auth/refresh")
        .map(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
            body["refresh_token"].as_str().unwrap().to_string()
        })
        .collect()
}

#[tokio::test]
async fn rotated_refresh_token_is_used_for_the_next_refresh() {
    let harness = Harness::start().await;
    harness.set_backend_tokens(Some("old"), Some("r1")).await;
    mount_rotating_refresh(&harness).await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(header("authorization", "Bearer new"))
        .respond_with(ResponseTemplate::new(200))
        .up_to_n_times(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(header("authorization", "Bearer newer"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&harness.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&harness.server)
        .await;

    let proxy = harness.ctx.refresh_proxy();
    let first = proxy.fetch_with_auth(items_request(&harness)).await.unwrap();
    assert_eq!(first.status(), 200);
    let backend = harness.backend_domain();
    assert_eq!(harness.cookie(&backend, "access_token").await.as_deref(), Some("new"));
    assert_eq!(harness.cookie(&backend, "refresh_token").await.as_deref(), Some("r2"));

    // The access token is revoked server side before it expires.
    let second = proxy.fetch_with_auth(items_request(&harness)).await.unwrap();
    assert_eq!(second.status(), 200);

    assert_eq!(refresh_tokens_sent(&harness).await, vec!["r1", "r2"]);
    assert_eq!(harness.cookie(&backend, "access_token").await.as_deref(), Some("newer"));
    assert_eq!(harness.cookie(&backend, "refresh_token").await.as_deref(), Some("r3"));
}

#[tokio::test]
async fn cached_refresh_token_wins_when_newer_than_cookie() {
    let harness = Harness::start().await;
    harness.set_backend_tokens(Some("old"), Some("r1")).await;
    mount_rotating_refresh(&harness).await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .and(header("authorization", "Bearer newer"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&harness.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/items"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&harness.server)
        .await;

    // A refresh whose cookie write lost the transfer race left r2 only in the cache.
    harness.cache().store("new", Some("r2")).unwrap();

    let proxy = harness.ctx.refresh_proxy();
    let response = proxy.fetch_with_auth(items_request(&harness)).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(refresh_tokens_sent(&harness).await, vec!["r2"]);
}
