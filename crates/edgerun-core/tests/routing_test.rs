// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route matching against parsed manifests.

use edgerun_core::manifest::{Manifest, Resource};
use edgerun_core::routing::{find_static, match_route, matches_pattern, normalize_path, score};

const SAMPLE_MANIFEST: &str = r#"{
    "version": 1,
    "resources": [
        {"kind": "static", "urlPath": "/index.html", "resourcePath": "app/index.html"},
        {"kind": "dynamic", "urlPath": "/api/users", "resourcePath": "api/users.js", "methods": ["GET"]}
    ]
}"#;

fn resource_path(resource: Option<&Resource>) -> Option<&str> {
    resource.map(Resource::resource_path)
}

#[test]
fn test_get_matches_dynamic_entry() {
    let manifest = Manifest::from_json(SAMPLE_MANIFEST).unwrap();
    let resource = match_route(&manifest, "/api/users", "GET").unwrap();
    assert!(resource.is_dynamic());
    assert_eq!(resource.resource_path(), "api/users.js");
}

#[test]
fn test_method_is_case_insensitive() {
    let manifest = Manifest::from_json(SAMPLE_MANIFEST).unwrap();
    assert!(match_route(&manifest, "/api/users", "get").is_some());
}

#[test]
fn test_wrong_method_does_not_match() {
    let manifest = Manifest::from_json(SAMPLE_MANIFEST).unwrap();
    assert!(match_route(&manifest, "/api/users", "POST").is_none());
    assert!(find_static(&manifest, "/api/users").is_none());
}

#[test]
fn test_static_entry_matches_exact_path_only() {
    let manifest = Manifest::from_json(SAMPLE_MANIFEST).unwrap();
    assert_eq!(
        resource_path(match_route(&manifest, "index.html?v=2", "GET")),
        Some("app/index.html")
    );
    assert!(match_route(&manifest, "/index.htm", "GET").is_none());
}

#[test]
fn test_most_specific_route_wins_regardless_of_order() {
    let manifest = Manifest::from_json(
        r#"{"version": 1, "resources": [
            {"kind": "dynamic", "urlPath": "/a/*", "resourcePath": "wild.js"},
            {"kind": "dynamic", "urlPath": "/a/:id", "resourcePath": "param.js"},
            {"kind": "dynamic", "urlPath": "/a/b", "resourcePath": "literal.js"}
        ]}"#,
    )
    .unwrap();

    assert_eq!(
        resource_path(match_route(&manifest, "/a/b", "GET")),
        Some("literal.js")
    );
    assert_eq!(
        resource_path(match_route(&manifest, "/a/c", "GET")),
        Some("param.js")
    );
    assert_eq!(
        resource_path(match_route(&manifest, "/a/c/d", "GET")),
        Some("wild.js")
    );
}

#[test]
fn test_equal_scores_keep_manifest_order() {
    let manifest = Manifest::from_json(
        r#"{"version": 1, "resources": [
            {"kind": "dynamic", "urlPath": "/u/:id", "resourcePath": "first.js"},
            {"kind": "dynamic", "urlPath": "/u/:name", "resourcePath": "second.js"}
        ]}"#,
    )
    .unwrap();

    assert_eq!(
        resource_path(match_route(&manifest, "/u/7", "GET")),
        Some("first.js")
    );
}

#[test]
fn test_wildcard_flag_extends_pattern() {
    let manifest = Manifest::from_json(
        r#"{"version": 1, "resources": [
            {"kind": "dynamic", "urlPath": "/files", "resourcePath": "files.js", "wildcard": true}
        ]}"#,
    )
    .unwrap();

    assert!(match_route(&manifest, "/files/a/b.txt", "GET").is_some());
    assert!(match_route(&manifest, "/files", "GET").is_some());
    assert!(match_route(&manifest, "/filesystem", "GET").is_none());
}

#[test]
fn test_match_semantics_per_segment() {
    let cases = [
        ("/users/1/posts", "/users/:id/posts", true),
        ("/users/1/comments", "/users/:id/posts", false),
        ("/users/1/posts/9", "/users/:id/posts", false),
        ("/users/1/posts/9", "/users/:id/*", true),
        ("/", "/", true),
        ("/", "*", true),
        ("/x", "/", false),
    ];
    for (path, pattern, expected) in cases {
        assert_eq!(
            matches_pattern(path, pattern),
            expected,
            "matches_pattern({path:?}, {pattern:?})"
        );
    }
}

#[test]
fn test_scores_strictly_decrease_by_specificity() {
    let ordered = ["/a/b/c", "/a/b", "/a/:id", "/a/*"];
    for pair in ordered.windows(2) {
        assert!(
            score(pair[0]) > score(pair[1]),
            "{} should outrank {}",
            pair[0],
            pair[1]
        );
    }
}

#[test]
fn test_normalize_path_idempotent_over_samples() {
    let samples = [
        "", "/", "//", "a", "/a", "a/b/", "//a//b", "/a?q=1", "?", "/a#x", "/%20/",
    ];
    for sample in samples {
        let once = normalize_path(sample);
        assert!(once.starts_with('/'));
        assert!(!once.starts_with("//"));
        assert_eq!(normalize_path(&once), once);
    }
}
