// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cacheability and TTL policy derived from a tool's semantics.
//!
//! Classification is by name pattern, checked in a fixed order: mutation
//! patterns always lose, the generic `execute` tool is conditional on its
//! HTTP method, and read-style patterns win.

use serde_json::Value;
use std::time::Duration;

const NON_CACHEABLE: &[&str] = &[
    "create", "delete", "update", "modify", "put", "post", "remove", "start", "stop", "restart",
    "deploy", "execute_command",
];

const CACHEABLE: &[&str] = &["list", "get", "fetch", "search", "query", "describe"];

/// Whether a tool invocation's result may be cached at all.
pub fn is_cacheable(tool_name: &str, arguments: &Value) -> bool {
    let name = tool_name.to_lowercase();

    if NON_CACHEABLE.iter().any(|p| name.contains(p)) {
        return false;
    }

    // A generic "execute" tool is a read only when it carries a GET.
    if name.contains("execute") {
        let method = arguments
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("");
        return method.eq_ignore_ascii_case("GET");
    }

    CACHEABLE.iter().any(|p| name.contains(p))
}

/// TTL for a cacheable tool, by name class.  Static identifiers change
/// rarely; cost/metric/status data goes stale in minutes.
pub fn ttl_for(tool_name: &str) -> Duration {
    let name = tool_name.to_lowercase();

    let secs = if name.contains("subscription")
        || name.contains("account")
        || name.contains("resource_group")
        || name.contains("resource-group")
    {
        3600
    } else if name.contains("list") || name.contains("config") || name.contains("setting") {
        1800
    } else if name.contains("cost")
        || name.contains("metric")
        || name.contains("status")
        || name.contains("health")
    {
        300
    } else {
        600
    };
    Duration::from_secs(secs)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
