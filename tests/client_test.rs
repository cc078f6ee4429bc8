//! API Client Integration Tests
//!
//! End-to-end behavior against a wiremock server: response parsing,
//! error mapping, retry recovery, breaker rejection and the session-key
//! authentication flow.

use std::time::Duration;

use hubcall::client::{ApiClient, ApiClientConfig, RequestOptions};
use hubcall::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(config: ApiClientConfig) -> ApiClient {
    let registry = CircuitBreakerRegistry::new();
    ApiClient::new(config, "analytics", &registry).unwrap()
}

fn base_config(server: &MockServer) -> ApiClientConfig {
    ApiClientConfig::new(server.uri())
        .with_timeout(Duration::from_secs(5))
        .with_max_retries(0)
}

// ============================================================================
// Success Path
// ============================================================================

#[tokio::test]
async fn test_get_parses_json_response() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"healthy": true})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(base_config(&server));

    // Act
    let response = client.get("/status").await.unwrap();

    // Assert
    assert_eq!(response.status, 200);
    assert!(response.is_success());
    assert_eq!(response.data["healthy"], true);
    assert_eq!(response.request.method, "GET");

    let stats = client.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.successful_requests, 1);
}

#[tokio::test]
async fn test_non_json_body_kept_as_text() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/version"))
        .respond_with(ResponseTemplate::new(200).set_body_string("v2.3.1"))
        .mount(&server)
        .await;

    let client = client_for(base_config(&server));
    let response = client.get("/version").await.unwrap();

    assert_eq!(response.data, json!("v2.3.1"));
}

#[tokio::test]
async fn test_get_with_query_parameters() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data/history"))
        .and(query_param("equipment", "Tank01"))
        .and(query_param("limit", "50"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"points": 50})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(base_config(&server));

    // Act
    let response = client
        .get_with(
            "/data/history",
            RequestOptions::new()
                .with_query("equipment", "Tank01")
                .with_query("limit", "50"),
        )
        .await
        .unwrap();

    // Assert
    assert_eq!(response.status, 200);
    assert_eq!(response.data["points"], 50);
}

#[tokio::test]
async fn test_per_call_timeout_overrides_client_timeout() {
    // Arrange: response slower than the per-call limit but well within
    // the client-wide one
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"ok": true}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let client = client_for(base_config(&server).with_circuit_breaker(false));

    // Act
    let err = client
        .get_with(
            "/data/slow",
            RequestOptions::new().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    // Assert
    assert_eq!(err.code(), "HUB-002");
    assert!(err.to_string().contains("timed out"));

    // the same call without an override completes
    let response = client.get("/data/slow").await.unwrap();
    assert_eq!(response.data["ok"], true);
}

#[tokio::test]
async fn test_post_sends_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/data/fit"))
        .and(body_json(json!({"equipment": "Tank01"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"jobId": 7})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(base_config(&server));
    let response = client
        .post("/data/fit", &json!({"equipment": "Tank01"}))
        .await
        .unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.data["jobId"], 7);
}

#[tokio::test]
async fn test_default_headers_sent_on_every_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .and(header("x-plugin", "basemap"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let config = base_config(&server).with_header("x-plugin", "basemap");
    let client = client_for(config);

    assert!(client.get("/status").await.is_ok());
}

// ============================================================================
// Error Mapping
// ============================================================================

#[tokio::test]
async fn test_http_error_maps_to_api_connection() {
    let server = MockServer::start().await;
    let long_body = "x".repeat(600);
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(502).set_body_string(long_body))
        .mount(&server)
        .await;

    let client = client_for(base_config(&server));
    let err = client.get("/data").await.unwrap_err();

    assert_eq!(err.code(), "HUB-002");
    let details = err.details();
    assert_eq!(details["status_code"], 502);
    // body excerpt is truncated to 500 chars
    assert_eq!(details["response_text"].as_str().unwrap().len(), 500);

    let stats = client.stats();
    assert_eq!(stats.failed_requests, 1);
}

#[tokio::test]
async fn test_connection_failure_maps_to_api_connection() {
    // nothing listens on this port
    let config = ApiClientConfig::new("http://127.0.0.1:1")
        .with_timeout(Duration::from_secs(2))
        .with_max_retries(0);
    let registry = CircuitBreakerRegistry::new();
    let client = ApiClient::new(config, "analytics", &registry).unwrap();

    let err = client.get("/status").await.unwrap_err();
    assert_eq!(err.code(), "HUB-002");
}

// ============================================================================
// Retry Recovery
// ============================================================================

#[tokio::test]
async fn test_retry_recovers_from_transient_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": 3})))
        .expect(1)
        .mount(&server)
        .await;

    let config = base_config(&server).with_max_retries(1);
    let client = client_for(config);

    let response = client.get("/data").await.unwrap();

    assert_eq!(response.data["rows"], 3);
    let stats = client.stats();
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.successful_requests, 1);
}

#[tokio::test]
async fn test_exhausted_retries_carry_retry_info() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let config = base_config(&server).with_max_retries(1);
    let client = client_for(config);

    let err = client.get("/data").await.unwrap_err();

    assert_eq!(err.code(), "HUB-002");
    let info = err.retry_info().unwrap();
    assert_eq!(info.total_attempts, 2);
    assert_eq!(info.max_retries, 1);
}

// ============================================================================
// Circuit Breaker Rejection
// ============================================================================

#[tokio::test]
async fn test_breaker_rejects_after_repeated_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::new();
    let client = ApiClient::with_breaker_config(
        base_config(&server),
        "analytics",
        &registry,
        CircuitBreakerConfig::default()
            .with_failure_threshold(2)
            .with_recovery_timeout(Duration::from_secs(60)),
    )
    .unwrap();

    assert_eq!(client.get("/data").await.unwrap_err().code(), "HUB-002");
    assert_eq!(client.get("/data").await.unwrap_err().code(), "HUB-002");

    // third call is rejected without reaching the server
    let err = client.get("/data").await.unwrap_err();
    assert_eq!(err.code(), "HUB-006");

    let breaker = registry.get("analytics").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn test_reset_protection_closes_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let registry = CircuitBreakerRegistry::new();
    let client = ApiClient::new(base_config(&server), "analytics", &registry).unwrap();

    registry.get("analytics").unwrap().force_open();
    assert_eq!(client.get("/data").await.unwrap_err().code(), "HUB-006");

    client.reset_protection();
    assert!(client.get("/data").await.is_ok());
}

// ============================================================================
// Authentication Flow
// ============================================================================

#[tokio::test]
async fn test_authenticate_installs_session_key_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({"apiKey": "long-lived-key"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"sessionKey": "s3ss10n"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(header("session-key", "s3ss10n"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rows": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(base_config(&server));

    client.authenticate("long-lived-key").await.unwrap();
    let response = client.get("/data").await.unwrap();

    assert_eq!(response.data["rows"], 1);
}

#[tokio::test]
async fn test_authenticate_rejection_is_authentication_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
        .mount(&server)
        .await;

    let client = client_for(base_config(&server));
    let err = client.authenticate("wrong-key").await.unwrap_err();

    assert_eq!(err.code(), "HUB-009");
    assert_eq!(err.details()["credential_supplied"], true);
}

#[tokio::test]
async fn test_authenticate_missing_session_key_in_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let client = client_for(base_config(&server));
    let err = client.authenticate("some-key").await.unwrap_err();

    assert_eq!(err.code(), "HUB-009");
}

// ============================================================================
// Health Document
// ============================================================================

#[tokio::test]
async fn test_health_status_merges_all_layers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let config = base_config(&server).with_max_retries(2);
    let client = client_for(config);
    client.get("/status").await.unwrap();

    let health = client.health_status();
    assert_eq!(health["service"], "analytics");
    assert_eq!(health["client"]["total_requests"], 1);
    assert_eq!(health["circuit_breaker"]["state"], "closed");
    assert_eq!(health["retry"]["total_operations"], 1);
}
