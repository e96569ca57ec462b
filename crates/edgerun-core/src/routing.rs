// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Route matching.
//!
//! Picks the single best resource of a manifest for a request path and method.
//!
//! Static entries match by exact (normalized) path. Dynamic entries match
//! segment by segment against their pattern:
//!
//! | Pattern segment | Matches |
//! |-----------------|---------|
//! | `*`             | the whole remainder of the path (including nothing) |
//! | `:name`         | exactly one path segment |
//! | anything else   | an identical path segment |
//!
//! Overlapping patterns are allowed. When several entries match, the one with
//! the highest [`score`] wins, so `/a/b` beats `/a/:id`, which beats `/a/*`.
//! Equal scores keep the entry that appears first in the manifest.

use crate::manifest::{Manifest, Resource};

const WILDCARD: &str = "*";

/// Normalize a request path or pattern.
///
/// Drops a query string, collapses leading slashes into exactly one, and
/// maps the empty path to `/`. Trailing slashes are kept because the static
/// fallback chain depends on them. Idempotent.
pub fn normalize_path(path: &str) -> String {
    let without_query = path.split(['?', '#']).next().unwrap_or_default();
    let trimmed = without_query.trim_start_matches('/');
    format!("/{}", trimmed)
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|seg| !seg.is_empty()).collect()
}

/// Whether `path` matches the route `pattern`.
pub fn matches_pattern(path: &str, pattern: &str) -> bool {
    let path = normalize_path(path);
    let pattern = normalize_path(pattern);
    let path_segments = segments(&path);
    let pattern_segments = segments(&pattern);

    for (i, pattern_segment) in pattern_segments.iter().enumerate() {
        if *pattern_segment == WILDCARD {
            return true;
        }

        let Some(path_segment) = path_segments.get(i) else {
            return false;
        };

        if pattern_segment.starts_with(':') {
            continue;
        }

        if pattern_segment != path_segment {
            return false;
        }
    }

    path_segments.len() == pattern_segments.len()
}

/// Specificity score of a route pattern; higher is more specific.
///
/// `rank * 1000 + static_segments * 10 + total_segments`, where rank is 2 for
/// fully literal patterns, 1 for patterns with `:param` segments and 0 for
/// patterns containing `*`.
pub fn score(pattern: &str) -> u32 {
    let pattern = normalize_path(pattern);
    let segs = segments(&pattern);

    let has_wildcard = segs.contains(&WILDCARD);
    let has_params = segs.iter().any(|seg| seg.starts_with(':'));

    let rank = if has_wildcard {
        0
    } else if has_params {
        1
    } else {
        2
    };

    let static_segments = segs
        .iter()
        .filter(|seg| **seg != WILDCARD && !seg.starts_with(':'))
        .count() as u32;

    rank * 1000 + static_segments * 10 + segs.len() as u32
}

/// Select the best resource for `path` and `method`.
///
/// Returns `None` when nothing matches; the caller decides whether that means
/// the static fallback chain or a 404.
pub fn match_route<'a>(manifest: &'a Manifest, path: &str, method: &str) -> Option<&'a Resource> {
    let path = normalize_path(path);
    let mut best: Option<(u32, &Resource)> = None;

    for resource in &manifest.resources {
        let candidate_score = match resource {
            Resource::Static(entry) => {
                if normalize_path(&entry.url_path) != path {
                    continue;
                }
                score(&entry.url_path)
            }
            Resource::Dynamic(entry) => {
                if !entry.accepts_method(method) {
                    continue;
                }
                let pattern = entry.effective_pattern();
                if !matches_pattern(&path, &pattern) {
                    continue;
                }
                score(&pattern)
            }
        };

        if best.is_none_or(|(best_score, _)| candidate_score > best_score) {
            best = Some((candidate_score, resource));
        }
    }

    best.map(|(_, resource)| resource)
}

/// Find the static entry bound to exactly `path` (after normalization).
pub fn find_static<'a>(
    manifest: &'a Manifest,
    path: &str,
) -> Option<&'a crate::manifest::StaticResource> {
    let path = normalize_path(path);
    manifest
        .static_resources()
        .find(|entry| normalize_path(&entry.url_path) == path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_adds_leading_slash() {
        assert_eq!(normalize_path("api/users"), "/api/users");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("//x//"), "/x//");
    }

    #[test]
    fn test_normalize_strips_query() {
        assert_eq!(normalize_path("/a?b=c"), "/a");
        assert_eq!(normalize_path("?x"), "/");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for p in ["", "/", "a", "//a/b/", "/a?x=1", "a//b", "///", "#frag"] {
            let once = normalize_path(p);
            assert_eq!(normalize_path(&once), once, "not idempotent for {p:?}");
        }
    }

    #[test]
    fn test_literal_pattern() {
        assert!(matches_pattern("/api/users", "/api/users"));
        assert!(!matches_pattern("/api/users/1", "/api/users"));
        assert!(!matches_pattern("/api", "/api/users"));
    }

    #[test]
    fn test_param_pattern() {
        assert!(matches_pattern("/users/42", "/users/:id"));
        assert!(!matches_pattern("/users", "/users/:id"));
        assert!(!matches_pattern("/users/42/posts", "/users/:id"));
    }

    #[test]
    fn test_wildcard_pattern() {
        assert!(matches_pattern("/files/a/b/c", "/files/*"));
        assert!(matches_pattern("/files", "/files/*"));
        assert!(!matches_pattern("/other/a", "/files/*"));
        assert!(matches_pattern("/anything/at/all", "*"));
    }

    #[test]
    fn test_score_ordering() {
        assert!(score("/a/b") > score("/a/:id"));
        assert!(score("/a/:id") > score("/a/*"));
        assert!(score("/a/b/c") > score("/a/b"));
        assert_eq!(score("/a/b"), 2022);
        assert_eq!(score("/a/:id"), 1012);
        assert_eq!(score("/a/*"), 12);
    }
}
