// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP and filesystem object store backends against real I/O.

use edgerun_core::object_store::{
    FsObjectStore, HttpObjectStore, ObjectStore, ObjectStoreConfig, deployment_key,
};
use edgerun_core::ObjectStoreError;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_http_store_maps_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/deployments/D1/app.js"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"abc123\"")
                .insert_header("last-modified", "Tue, 05 Mar 2024 07:08:09 GMT")
                .insert_header("content-type", "application/javascript")
                .set_body_bytes(b"export default 1;".to_vec()),
        )
        .mount(&server)
        .await;

    let store = HttpObjectStore::new(reqwest::Client::new(), &server.uri()).unwrap();
    let object = store
        .get(&deployment_key("D1", "app.js"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(object.etag.as_deref(), Some("\"abc123\""));
    assert_eq!(
        object.last_modified.as_deref(),
        Some("Tue, 05 Mar 2024 07:08:09 GMT")
    );
    assert_eq!(object.content_type.as_deref(), Some("application/javascript"));
    assert_eq!(object.content_length, Some(17));
    assert_eq!(&object.into_bytes().await.unwrap()[..], b"export default 1;");
}

#[tokio::test]
async fn test_http_store_not_found_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = HttpObjectStore::new(reqwest::Client::new(), &server.uri()).unwrap();
    assert!(store.get("deployments/D1/missing.js").await.unwrap().is_none());
}

#[tokio::test]
async fn test_http_store_server_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = HttpObjectStore::new(reqwest::Client::new(), &server.uri()).unwrap();
    match store.get("deployments/D1/app.js").await {
        Err(ObjectStoreError::Status { status, key }) => {
            assert_eq!(status, 503);
            assert_eq!(key, "deployments/D1/app.js");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_filesystem_config_builds_fs_backend() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(temp_dir.path().join("deployments/D1")).unwrap();
    std::fs::write(temp_dir.path().join("deployments/D1/metadata.json"), "{}").unwrap();

    let config = ObjectStoreConfig::Filesystem {
        root: temp_dir.path().to_path_buf(),
    };
    let store = config.build(reqwest::Client::new()).unwrap();
    assert_eq!(store.backend_type(), "fs");

    let bytes = store
        .get_bytes("deployments/D1/metadata.json")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&bytes[..], b"{}");

    let direct = FsObjectStore::new(temp_dir.path());
    assert_eq!(direct.root(), temp_dir.path());
}
