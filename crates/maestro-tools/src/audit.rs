// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::executor::ExecutionTarget;

/// Immutable record written once per tool invocation — live dispatches,
/// cache hits, and access denials alike.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub tool_name: String,
    pub server_id: String,
    pub executed_on: ExecutionTarget,
    pub latency_ms: u64,
    pub request_bytes: usize,
    pub response_bytes: usize,
    pub error: Option<String>,
    /// Model and provider that issued the call, when known.
    pub model: Option<String>,
    pub provider: Option<String>,
    /// Handling pod reported by the tool-proxy (`x-mcp-proxy-host`).
    pub proxy_host: Option<String>,
}

impl AuditRecord {
    pub fn new(user_id: &str, tool_name: &str, server_id: &str, target: ExecutionTarget) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            tool_name: tool_name.to_string(),
            server_id: server_id.to_string(),
            executed_on: target,
            latency_ms: 0,
            request_bytes: 0,
            response_bytes: 0,
            error: None,
            model: None,
            provider: None,
            proxy_host: None,
        }
    }
}

/// Write-only audit collaborator.  Append-only; concurrent writers need no
/// cross-request ordering.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> anyhow::Result<()>;

    /// Append and swallow failures.  Audit problems are logged, never
    /// surfaced to callers.
    async fn record(&self, record: AuditRecord) {
        if let Err(e) = self.append(record).await {
            warn!(error = %e, "audit append failed");
        }
    }
}

/// Default sink: one structured log line per invocation.
#[derive(Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn append(&self, r: AuditRecord) -> anyhow::Result<()> {
        info!(
            user = %r.user_id,
            tool = %r.tool_name,
            server = %r.server_id,
            target = ?r.executed_on,
            latency_ms = r.latency_ms,
            error = r.error.as_deref().unwrap_or(""),
            "tool audit"
        );
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: AuditRecord) -> anyhow::Result<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
