//! Integration tests for endpoint request execution and classification.
//!
//! Exercises the HTTP path against a mock server: auth header construction,
//! body/query serialization, the status classification matrix, and the
//! single-owner session lifecycle.

use std::{sync::Arc, time::Duration};

use serde_json::json;
use sluice_core::ApiError;
use sluice_dispatch::endpoint::{ApiKey, AuthScheme, Endpoint, EndpointConfig};
use wiremock::{
    matchers::{header, header_exists, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn endpoint_for(server: &MockServer, request_path: &str) -> Endpoint {
    Endpoint::new(EndpointConfig::new("test-provider", request_path).with_base_url(server.uri()))
        .unwrap()
}

#[tokio::test]
async fn successful_call_decodes_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"answer": 42})))
        .mount(&server)
        .await;

    let endpoint = endpoint_for(&server, "/v1/chat");
    let response = endpoint.call(&json!({"prompt": "hi"}), false).await.unwrap();

    assert_eq!(response["answer"], 42);
    endpoint.close().await;
}

#[tokio::test]
async fn non_json_success_returns_raw_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain response"))
        .mount(&server)
        .await;

    let endpoint = endpoint_for(&server, "/v1/raw");
    let response = endpoint.call(&json!({}), false).await.unwrap();

    assert_eq!(response, serde_json::Value::String("plain response".to_string()));
    endpoint.close().await;
}

#[tokio::test]
async fn undecodable_json_success_is_bad_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("not json at all", "application/json"),
        )
        .mount(&server)
        .await;

    let endpoint = endpoint_for(&server, "/v1/broken");
    let error = endpoint.call(&json!({}), false).await.unwrap_err();

    assert!(matches!(error, ApiError::BadResponse { .. }));
    endpoint.close().await;
}

#[tokio::test]
async fn http_statuses_classify_per_taxonomy() {
    let cases: Vec<(u16, fn(&ApiError) -> bool)> = vec![
        (401, |e| matches!(e, ApiError::Auth { status_code: 401, .. })),
        (403, |e| matches!(e, ApiError::Auth { status_code: 403, .. })),
        (404, |e| matches!(e, ApiError::NotFound { .. })),
        (400, |e| matches!(e, ApiError::BadRequest { status_code: 400, .. })),
        (422, |e| matches!(e, ApiError::BadRequest { status_code: 422, .. })),
        (408, |e| matches!(e, ApiError::Timeout { .. })),
        (500, |e| matches!(e, ApiError::Server { status_code: 500, .. })),
        (503, |e| matches!(e, ApiError::Server { status_code: 503, .. })),
    ];

    for (status, check) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status).set_body_string("details"))
            .mount(&server)
            .await;

        let endpoint = endpoint_for(&server, "/v1/status");
        let error = endpoint.call(&json!({}), false).await.unwrap_err();
        assert!(check(&error), "status {status} classified as {error:?}");
        endpoint.close().await;
    }
}

#[tokio::test]
async fn rate_limit_carries_retry_after_hint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .set_body_string("slow down")
                .append_header("Retry-After", "120"),
        )
        .mount(&server)
        .await;

    let endpoint = endpoint_for(&server, "/v1/limited");
    let error = endpoint.call(&json!({}), false).await.unwrap_err();

    match error {
        ApiError::RateLimit { retry_after_seconds, body } => {
            assert_eq!(retry_after_seconds, Some(120));
            assert_eq!(body, "slow down");
        },
        other => unreachable!("expected RateLimit, got {other:?}"),
    }
    endpoint.close().await;
}

#[tokio::test]
async fn connection_failure_classifies_as_transport() {
    // Nothing listens on this port
    let endpoint = Endpoint::new(
        EndpointConfig::new("test-provider", "/v1/void")
            .with_base_url("http://127.0.0.1:9")
            .with_timeout(Duration::from_secs(2)),
    )
    .unwrap();

    let error = endpoint.call(&json!({}), false).await.unwrap_err();
    assert!(matches!(error, ApiError::Transport { .. }), "got {error:?}");
}

#[tokio::test]
async fn bearer_auth_header_is_applied() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer sk-test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let endpoint = Endpoint::new(
        EndpointConfig::new("test-provider", "/v1/auth")
            .with_base_url(server.uri())
            .with_auth(AuthScheme::Bearer, ApiKey::new("sk-test-key")),
    )
    .unwrap();

    assert!(endpoint.call(&json!({}), false).await.is_ok());
    endpoint.close().await;
}

#[tokio::test]
async fn x_api_key_auth_header_is_applied() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("x-api-key", "sk-test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let endpoint = Endpoint::new(
        EndpointConfig::new("test-provider", "/v1/auth")
            .with_base_url(server.uri())
            .with_auth(AuthScheme::XApiKey, ApiKey::new("sk-test-key")),
    )
    .unwrap();

    assert!(endpoint.call(&json!({}), false).await.is_ok());
    endpoint.close().await;
}

#[tokio::test]
async fn basic_auth_header_is_applied() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let endpoint = Endpoint::new(
        EndpointConfig::new("test-provider", "/v1/auth")
            .with_base_url(server.uri())
            .with_auth(AuthScheme::Basic, ApiKey::new("user-key")),
    )
    .unwrap();

    assert!(endpoint.call(&json!({}), false).await.is_ok());
    endpoint.close().await;
}

#[tokio::test]
async fn get_requests_serialize_query_parameters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/search"))
        .and(query_param("q", "rust"))
        .and(query_param("limit", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hits": []})))
        .mount(&server)
        .await;

    let endpoint = Endpoint::new(
        EndpointConfig::new("test-provider", "/v1/search")
            .with_base_url(server.uri())
            .with_method("GET"),
    )
    .unwrap();

    let response = endpoint.call(&json!({"q": "rust", "limit": 5}), false).await.unwrap();
    assert_eq!(response["hits"], json!([]));
    endpoint.close().await;
}

#[tokio::test]
async fn default_headers_are_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("x-client-tag", "sluice-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let endpoint = Endpoint::new(
        EndpointConfig::new("test-provider", "/v1/tagged")
            .with_base_url(server.uri())
            .with_header("x-client-tag", "sluice-test"),
    )
    .unwrap();

    assert!(endpoint.call(&json!({}), false).await.is_ok());
    endpoint.close().await;
}

#[tokio::test]
async fn concurrent_calls_share_one_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_millis(50)),
        )
        .mount(&server)
        .await;

    let endpoint = Arc::new(endpoint_for(&server, "/v1/shared"));

    let payload1 = json!({"n": 1});
    let payload2 = json!({"n": 2});
    let (first, second) = tokio::join!(
        endpoint.call(&payload1, false),
        endpoint.call(&payload2, false),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(endpoint.session_generation(), 1);
    endpoint.close().await;
}

#[tokio::test]
async fn close_then_call_opens_a_fresh_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let endpoint = endpoint_for(&server, "/v1/session");

    endpoint.call(&json!({}), false).await.unwrap();
    assert_eq!(endpoint.session_generation(), 1);
    assert!(endpoint.has_session().await);

    endpoint.close().await;
    assert!(!endpoint.has_session().await);

    // Double close stays a no-op
    endpoint.close().await;
    assert_eq!(endpoint.session_generation(), 1);

    endpoint.call(&json!({}), false).await.unwrap();
    assert_eq!(endpoint.session_generation(), 2);
    endpoint.close().await;
}

#[tokio::test]
async fn scope_tears_down_on_exit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let endpoint = endpoint_for(&server, "/v1/scoped");

    endpoint
        .scope(|| async {
            let payload1 = json!({"n": 1});
            let payload2 = json!({"n": 2});
            let (a, b) = tokio::join!(
                endpoint.call(&payload1, false),
                endpoint.call(&payload2, false),
            );
            a.unwrap();
            b.unwrap();
            assert_eq!(endpoint.session_generation(), 1);
        })
        .await;

    assert!(!endpoint.has_session().await);

    // A fresh scope produces a different session
    endpoint
        .scope(|| async {
            endpoint.call(&json!({}), false).await.unwrap();
            assert_eq!(endpoint.session_generation(), 2);
        })
        .await;

    assert!(!endpoint.has_session().await);
}
