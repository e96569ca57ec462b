// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests of the gateway router: resolution, static delivery and
//! function proxying against a mocked execution service.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use edgerun_core::Manifest;
use edgerun_core::object_store::MemoryObjectStore;
use edgerun_gateway::proxy::FunctionProxy;
use edgerun_gateway::resolver::{DomainBinding, ManifestResolver, StaticBindingSource};
use edgerun_gateway::server::{GatewayState, router};
use edgerun_gateway::static_assets::StaticAssetServer;
use flate2::read::GzDecoder;
use tower::ServiceExt;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const APP_JS: &str = "export function main() { return 'hello from D1'; }\n";

fn manifest() -> Manifest {
    Manifest::from_json(
        r#"{"version": 1, "resources": [
            {"kind": "static", "urlPath": "/index.html", "resourcePath": "app/index.html"},
            {"kind": "static", "urlPath": "/app.js", "resourcePath": "app.js"},
            {"kind": "dynamic", "urlPath": "/api/users", "resourcePath": "api/users.js", "methods": ["GET"]},
            {"kind": "dynamic", "urlPath": "/api/upload", "resourcePath": "api/upload.js", "methods": ["POST"]}
        ]}"#,
    )
    .unwrap()
}

fn state(executor_url: &str) -> Arc<GatewayState> {
    state_with_timeout(executor_url, Duration::from_secs(5))
}

fn state_with_timeout(executor_url: &str, stream_timeout: Duration) -> Arc<GatewayState> {
    let bindings = Arc::new(StaticBindingSource::new());
    bindings.insert(
        "foo.example",
        DomainBinding {
            deployment_id: "D1".to_string(),
            project_id: "P1".to_string(),
            manifest: Some(manifest()),
        },
    );

    let store = Arc::new(MemoryObjectStore::new());
    store.insert("deployments/D1/app.js", APP_JS);
    store.insert("deployments/D1/app/index.html", "<!doctype html><h1>D1</h1>");

    Arc::new(GatewayState::new(
        ManifestResolver::new(bindings),
        StaticAssetServer::new(store),
        FunctionProxy::new(
            reqwest::Client::new(),
            executor_url,
            stream_timeout,
            64,
        ),
    ))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("host", "foo.example")
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_static_asset_gzip_end_to_end() {
    let app = router(state("http://127.0.0.1:1"));
    let request = Request::builder()
        .uri("/app.js")
        .header("host", "foo.example:443")
        .header("accept-encoding", "gzip")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-encoding"], "gzip");
    assert_eq!(response.headers()["cache-control"], "public, max-age=3600");

    let compressed = body_bytes(response).await;
    let mut decoded = String::new();
    GzDecoder::new(&compressed[..])
        .read_to_string(&mut decoded)
        .unwrap();
    assert_eq!(decoded, APP_JS);
}

#[tokio::test]
async fn test_static_asset_without_gzip_has_length() {
    let app = router(state("http://127.0.0.1:1"));
    let response = app.oneshot(get("/app.js")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("content-encoding").is_none());
    assert_eq!(
        response.headers()["content-length"],
        APP_JS.len().to_string().as_str()
    );
    assert_eq!(&body_bytes(response).await[..], APP_JS.as_bytes());
}

#[tokio::test]
async fn test_root_resolves_to_index_html() {
    let app = router(state("http://127.0.0.1:1"));
    let response = app.oneshot(get("/")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/html");
    assert_eq!(
        &body_bytes(response).await[..],
        b"<!doctype html><h1>D1</h1>"
    );
}

#[tokio::test]
async fn test_wrong_method_falls_through_to_404() {
    let app = router(state("http://127.0.0.1:1"));
    let request = Request::builder()
        .method("POST")
        .uri("/api/users")
        .header("host", "foo.example")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["path"], "/api/users");
    assert_eq!(json["resources"], 4);
}

#[tokio::test]
async fn test_unmatched_get_falls_back_to_index_html() {
    let app = router(state("http://127.0.0.1:1"));
    let response = app.oneshot(get("/dashboard/settings")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/html");
}

#[tokio::test]
async fn test_unmatched_delete_is_404_not_index() {
    let app = router(state("http://127.0.0.1:1"));
    let request = Request::builder()
        .method("DELETE")
        .uri("/index.html")
        .header("host", "foo.example")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["path"], "/index.html");
}

#[tokio::test]
async fn test_unknown_host_is_404() {
    let app = router(state("http://127.0.0.1:1"));
    let request = Request::builder()
        .uri("/")
        .header("host", "bar.example")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["host"], "bar.example");
}

#[tokio::test]
async fn test_missing_host_is_400() {
    let app = router(state("http://127.0.0.1:1"));
    let request = Request::builder().uri("/").body(Body::empty()).unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_function_request_is_proxied_with_routing_headers() {
    let executor = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/users"))
        .and(header("x-function-path", "deployments/D1/api/users.js"))
        .and(header("x-deployment-id", "D1"))
        .and(header("x-project-id", "P1"))
        .and(header("x-forwarded-host", "foo.example"))
        .and(header("authorization", "Bearer t"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/json")
                .insert_header("x-powered-by", "edgerun-test")
                .set_body_string(r#"[{"id":1}]"#),
        )
        .expect(1)
        .mount(&executor)
        .await;

    let app = router(state(&executor.uri()));
    let request = Request::builder()
        .uri("/api/users?page=2")
        .header("host", "foo.example")
        .header("authorization", "Bearer t")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-accel-buffering"], "no");
    assert_eq!(response.headers()["x-powered-by"], "edgerun-test");
    assert_eq!(&body_bytes(response).await[..], br#"[{"id":1}]"#);
}

#[tokio::test]
async fn test_upstream_unavailable_status_passes_through() {
    let executor = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .mount(&executor)
        .await;

    let app = router(state(&executor.uri()));
    let response = app.oneshot(get("/api/users")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(&body_bytes(response).await[..], b"busy");
}

#[tokio::test]
async fn test_stalled_executor_is_504_within_deadline() {
    let executor = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&executor)
        .await;

    let app = router(state_with_timeout(&executor.uri(), Duration::from_millis(300)));
    let started = std::time::Instant::now();
    let response = tokio::time::timeout(Duration::from_secs(3), app.oneshot(get("/api/users")))
        .await
        .expect("gateway waited past its deadline")
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn test_unreachable_executor_is_500() {
    let app = router(state("http://127.0.0.1:1"));
    let response = app.oneshot(get("/api/users")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_json(response).await["error"].is_string());
}

#[tokio::test]
async fn test_post_body_forwarded() {
    let executor = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/upload"))
        .and(wiremock::matchers::body_string("small"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&executor)
        .await;

    let app = router(state(&executor.uri()));
    let request = Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header("host", "foo.example")
        .body(Body::from("small"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn test_oversized_body_rejected() {
    let app = router(state("http://127.0.0.1:1"));
    let request = Request::builder()
        .method("POST")
        .uri("/api/upload")
        .header("host", "foo.example")
        .body(Body::from(vec![b'x'; 65]))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_health_is_not_routed_to_tenants() {
    let app = router(state("http://127.0.0.1:1"));
    let request = Request::builder()
        .uri("/_edgerun/health")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["healthy"], true);
}
