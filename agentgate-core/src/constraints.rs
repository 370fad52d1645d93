//! Constraint predicates for the table backend.
//!
//! A request is an opaque attribute map; only the fields named by the
//! constraints (`path`, `domain`, `port`, `size`) are consulted. A
//! constraint whose field is absent from the request is non-binding: the
//! engine checks only what the caller provided. All present constraints
//! must hold together.

use glob::{MatchOptions, Pattern};
use serde_json::{Map, Value};

use crate::types::ToolConstraints;

/// Shell-glob options: `*` must not cross a `/`, so `/tmp/*` matches
/// `/tmp/foo` but not `/tmp/a/b`.
const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Check every constraint against the request fields.
pub fn check(constraints: &ToolConstraints, request: &Map<String, Value>) -> bool {
    if !constraints.path_patterns.is_empty() {
        if let Some(path) = request.get("path").and_then(Value::as_str) {
            if !path_matches_any(&constraints.path_patterns, path) {
                return false;
            }
        }
    }

    if !constraints.allowed_domains.is_empty() {
        if let Some(domain) = request.get("domain").and_then(Value::as_str) {
            if !constraints
                .allowed_domains
                .iter()
                .any(|p| domain_matches(p, domain))
            {
                return false;
            }
        }
    }

    // Denied domains are checked after the allow-list and win.
    if !constraints.denied_domains.is_empty() {
        if let Some(domain) = request.get("domain").and_then(Value::as_str) {
            if constraints
                .denied_domains
                .iter()
                .any(|p| domain_matches(p, domain))
            {
                return false;
            }
        }
    }

    if !constraints.allowed_ports.is_empty() {
        if let Some(port) = request.get("port").and_then(Value::as_u64) {
            if !constraints
                .allowed_ports
                .iter()
                .any(|&p| u64::from(p) == port)
            {
                return false;
            }
        }
    }

    if let Some(max) = constraints.max_size_bytes {
        if let Some(size) = request.get("size").and_then(Value::as_u64) {
            if size > max {
                return false;
            }
        }
    }

    true
}

/// True when any pattern matches the path.
pub fn path_matches_any(patterns: &[String], path: &str) -> bool {
    patterns.iter().any(|p| path_matches(p, path))
}

/// Match a single path pattern.
///
/// A trailing `/**` matches the directory itself and any path under it;
/// everything else is a shell glob on the full path. Invalid patterns
/// never match.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'));
    }
    match Pattern::new(pattern) {
        Ok(p) => p.matches_with(path, GLOB_OPTIONS),
        Err(_) => false,
    }
}

/// Match a domain pattern.
///
/// `*` matches everything; `*.x.y` matches strict sub-domains of `x.y`
/// (never `x.y` itself); anything else is a literal.
pub fn domain_matches(pattern: &str, domain: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        if suffix.starts_with('.') {
            return domain.len() > suffix.len() && domain.ends_with(suffix);
        }
    }
    pattern == domain
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
