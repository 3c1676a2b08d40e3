// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Semantic tier: cross-user within a tenant, embedding-keyed, RBAC-gated.
//!
//! A hit requires (1) same tenant and tool, (2) cosine similarity at or above
//! the configured floor, and (3) the requesting user passing the RBAC check
//! for the resource scope recorded with the entry.  Admins bypass (3).

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use maestro_model::User;

/// Embedding callable; the index implementation is not the core's concern.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Tenant-policy RBAC check on a cached entry's resource scope.
#[async_trait]
pub trait ScopeAccess: Send + Sync {
    async fn can_access(&self, user: &User, scope: &str) -> bool;
}

struct Entry {
    id: String,
    tenant_id: String,
    original_user_id: String,
    tool_name: String,
    /// Canonical arguments the entry was created from, kept for diagnostics.
    #[allow(dead_code)]
    arguments_sketch: String,
    resource_scope: Option<String>,
    embedding: Vec<f32>,
    result: Value,
    /// Latency of the live execution that produced the entry; a hit reports
    /// this as the time saved.
    source_latency_ms: u64,
    hit_count: u64,
    #[allow(dead_code)]
    cached_at: DateTime<Utc>,
}

/// A successful semantic lookup.
#[derive(Debug, Clone)]
pub struct SemanticHit {
    pub result: Value,
    pub similarity: f32,
    /// The entry was created by a different user.
    pub cross_user: bool,
    pub resource_scope: Option<String>,
    pub time_saved_ms: u64,
}

pub struct SemanticCache {
    entries: RwLock<Vec<Entry>>,
    similarity_min: f32,
    max_entries: usize,
}

impl SemanticCache {
    pub fn new(similarity_min: f32, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            similarity_min,
            max_entries: max_entries.max(1),
        }
    }

    /// Nearest-neighbor lookup with the mandatory RBAC gate.
    ///
    /// Candidates are visited best-first; an entry the user may not access is
    /// skipped, so a denied best match degrades to the next one rather than
    /// leaking scoped data.  No surviving candidate means a miss.
    pub async fn lookup(
        &self,
        tenant_id: &str,
        tool_name: &str,
        query_embedding: &[f32],
        user: &User,
        access: &dyn ScopeAccess,
    ) -> Option<SemanticHit> {
        let mut candidates: Vec<(f32, usize)> = {
            let entries = self.entries.read().ok()?;
            entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.tenant_id == tenant_id && e.tool_name == tool_name)
                .map(|(i, e)| (cosine_similarity(query_embedding, &e.embedding), i))
                .filter(|(sim, _)| *sim >= self.similarity_min)
                .collect()
        };
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        for (similarity, idx) in candidates {
            let (scope, original_user_id) = {
                let entries = self.entries.read().ok()?;
                let e = entries.get(idx)?;
                (e.resource_scope.clone(), e.original_user_id.clone())
            };
            if let Some(scope) = &scope {
                if !user.is_admin && !access.can_access(user, scope).await {
                    debug!(%scope, user = %user.id, "semantic candidate denied by RBAC");
                    continue;
                }
            }
            let mut entries = self.entries.write().ok()?;
            let e = entries.get_mut(idx)?;
            e.hit_count += 1;
            return Some(SemanticHit {
                result: e.result.clone(),
                similarity,
                cross_user: original_user_id != user.id,
                resource_scope: scope,
                time_saved_ms: e.source_latency_ms,
            });
        }
        None
    }

    /// Record a result after a successful live execution.
    pub fn store(
        &self,
        tenant_id: &str,
        user_id: &str,
        tool_name: &str,
        arguments: &Value,
        resource_scope: Option<String>,
        embedding: Vec<f32>,
        result: Value,
        source_latency_ms: u64,
    ) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        if entries.len() >= self.max_entries {
            entries.remove(0);
        }
        entries.push(Entry {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            original_user_id: user_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments_sketch: crate::canonical::canonical_json(arguments),
            resource_scope,
            embedding,
            result,
            source_latency_ms,
            hit_count: 0,
            cached_at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total hits recorded for the entry with the given tool name (tests).
    pub fn hit_count(&self, tool_name: &str) -> u64 {
        self.entries
            .read()
            .map(|e| {
                e.iter()
                    .filter(|x| x.tool_name == tool_name)
                    .map(|x| x.hit_count)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Entry ids, oldest first (tests).
    pub fn entry_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .map(|e| e.iter().map(|x| x.id.clone()).collect())
            .unwrap_or_default()
    }
}

/// First configured key present in the arguments becomes the resource scope.
pub fn extract_resource_scope(arguments: &Value, keys: &[String]) -> Option<String> {
    let obj = arguments.as_object()?;
    keys.iter()
        .find_map(|k| obj.get(k))
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
