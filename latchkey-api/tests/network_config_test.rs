// Integration tests for the lock network config store using wiremock.

use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use latchkey_api::{ApiClient, Tokens};
use latchkey_engine::{ConfigDraft, LockId, RemoteConfig, RemoteStore, SaveOutcome, StoreError, reconcile};

// ── Helpers ─────────────────────────────────────────────────────────

const LOCK: &str = "6f1c1a52-3b8e-4a55-9f3e-2a6b1d0c9e11";
const NETWORK_PATH: &str = "/api/locks/6f1c1a52-3b8e-4a55-9f3e-2a6b1d0c9e11/network/";

fn lock() -> LockId {
    LockId::parse(LOCK).unwrap()
}

fn tokens(access: &str, refresh: &str) -> Tokens {
    Tokens { access: Some(access.into()), refresh: Some(refresh.into()) }
}

async fn setup() -> (MockServer, ApiClient) {
    let server = MockServer::start().await;
    let client = ApiClient::new(&format!("{}/api", server.uri()), tokens("at-1", "rt-1")).unwrap();
    (server, client)
}

fn home() -> RemoteConfig {
    RemoteConfig {
        ssid: "Home".into(),
        password: "hunter2".into(),
        radio_name: Some("Front door".into()),
    }
}

// ── Reads ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_get_missing_config_404() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path(NETWORK_PATH))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "Not found."})))
        .mount(&server)
        .await;

    assert_eq!(client.get(&lock()).await.unwrap(), None);
}

#[tokio::test]
async fn test_get_missing_config_empty_object() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path(NETWORK_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    assert_eq!(client.get(&lock()).await.unwrap(), None);
}

#[tokio::test]
async fn test_get_existing_config() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path(NETWORK_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 4,
            "ssid": "Home",
            "password": "hunter2",
            "bluetooth_name": "Front door",
        })))
        .mount(&server)
        .await;

    assert_eq!(client.get(&lock()).await.unwrap(), Some(home()));
}

// ── Writes ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_posts_payload() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path(NETWORK_PATH))
        .and(header("authorization", "Bearer at-1"))
        .and(body_json(json!({
            "ssid": "Home",
            "password": "hunter2",
            "bluetooth_name": "Front door",
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 4})))
        .expect(1)
        .mount(&server)
        .await;

    client.create(&lock(), &home()).await.unwrap();
}

#[tokio::test]
async fn test_update_uses_patch() {
    let (server, client) = setup().await;

    Mock::given(method("PATCH"))
        .and(path(NETWORK_PATH))
        .and(body_json(json!({"ssid": "Home", "password": "hunter2", "bluetooth_name": "Front door"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 4})))
        .expect(1)
        .mount(&server)
        .await;

    client.update(&lock(), &home()).await.unwrap();
}

#[tokio::test]
async fn test_create_conflict() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path(NETWORK_PATH))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"detail": "exists"})))
        .mount(&server)
        .await;

    let err = client.create(&lock(), &home()).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict));
}

#[tokio::test]
async fn test_server_error_is_unavailable() {
    let (server, client) = setup().await;

    Mock::given(method("PATCH"))
        .and(path(NETWORK_PATH))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let err = client.update(&lock(), &home()).await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable(_)));
}

#[tokio::test]
async fn test_reconcile_creates_when_absent() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path(NETWORK_PATH))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(NETWORK_PATH))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 4})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(NETWORK_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let draft = ConfigDraft { ssid: "Home".into(), password: "x".into(), radio_name: None };
    let outcome = reconcile(&client, &lock(), &draft).await.unwrap();
    assert_eq!(outcome, SaveOutcome::Created);
}

// ── Token refresh ───────────────────────────────────────────────────

#[tokio::test]
async fn test_refresh_on_401_and_retry() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path(NETWORK_PATH))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/token/refresh/"))
        .and(body_json(json!({"refresh": "rt-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "at-2"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(NETWORK_PATH))
        .and(header("authorization", "Bearer at-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ssid": "Home"})))
        .expect(1)
        .mount(&server)
        .await;

    let config = client.get(&lock()).await.unwrap().unwrap();
    assert_eq!(config.ssid, "Home");
    // refresh token is kept when the server does not rotate it
    assert_eq!(client.tokens().await, tokens("at-2", "rt-1"));
}

#[tokio::test]
async fn test_refresh_rotates_both_tokens() {
    let (server, client) = setup().await;

    Mock::given(method("PATCH"))
        .and(path(NETWORK_PATH))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/token/refresh/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"access": "at-2", "refresh": "rt-2"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(NETWORK_PATH))
        .and(header("authorization", "Bearer at-2"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    client.update(&lock(), &home()).await.unwrap();
    assert_eq!(client.tokens().await, tokens("at-2", "rt-2"));
}

#[tokio::test]
async fn test_concurrent_401s_share_one_refresh() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path(NETWORK_PATH))
        .and(header("authorization", "Bearer at-1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/token/refresh/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "at-2"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(NETWORK_PATH))
        .and(header("authorization", "Bearer at-2"))
        .respond_with(ResponseTemplate::new(404))
        .expect(2)
        .mount(&server)
        .await;

    let (lock_a, lock_b) = (lock(), lock());
    let (a, b) = tokio::join!(client.get(&lock_a), client.get(&lock_b));
    assert_eq!(a.unwrap(), None);
    assert_eq!(b.unwrap(), None);
}

#[tokio::test]
async fn test_failed_refresh_is_unauthorized() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path(NETWORK_PATH))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/token/refresh/"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"code": "token_not_valid"})))
        .expect(1)
        .mount(&server)
        .await;

    let err = client.get(&lock()).await.unwrap_err();
    assert!(matches!(err, StoreError::Unauthorized(_)));
    assert_eq!(client.tokens().await.access, None);
}

#[tokio::test]
async fn test_missing_refresh_token_skips_refresh() {
    let server = MockServer::start().await;
    let client = ApiClient::new(
        &format!("{}/api", server.uri()),
        Tokens { access: Some("at-1".into()), refresh: None },
    )
    .unwrap();

    Mock::given(method("POST"))
        .and(path("/api/token/refresh/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(NETWORK_PATH))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = client.get(&lock()).await.unwrap_err();
    assert!(matches!(err, StoreError::Unauthorized(_)));
}
