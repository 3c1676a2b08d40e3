// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

/// Per-request completion metrics, written once at finalization.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionMetrics {
    pub user_id: String,
    pub session_id: Option<String>,
    pub message_id: String,
    pub provider_type: String,
    pub model: String,
    pub latency_ms: u64,
    pub ttft_ms: Option<u64>,
    /// `latency_ms − ttft_ms`: time spent generating after the first token.
    pub model_latency_ms: Option<u64>,
    pub tokens_per_second: f64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub tool_calls_count: usize,
    pub status: String,
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn write(&self, metrics: CompletionMetrics) -> anyhow::Result<()>;

    /// Write and swallow failures; metrics never break a request.
    async fn record(&self, metrics: CompletionMetrics) {
        if let Err(e) = self.write(metrics).await {
            warn!(error = %e, "metrics write failed");
        }
    }
}

/// Default sink: one structured log line per completion.
#[derive(Default)]
pub struct TracingMetricsSink;

#[async_trait]
impl MetricsSink for TracingMetricsSink {
    async fn write(&self, m: CompletionMetrics) -> anyhow::Result<()> {
        info!(
            user = %m.user_id,
            model = %m.model,
            provider = %m.provider_type,
            latency_ms = m.latency_ms,
            ttft_ms = m.ttft_ms.unwrap_or(0),
            tokens_per_second = m.tokens_per_second,
            tool_calls = m.tool_calls_count,
            status = %m.status,
            "completion metrics"
        );
        Ok(())
    }
}

/// In-memory sink for tests.
#[derive(Default)]
pub struct MemoryMetricsSink {
    records: Mutex<Vec<CompletionMetrics>>,
}

impl MemoryMetricsSink {
    pub fn records(&self) -> Vec<CompletionMetrics> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetricsSink for MemoryMetricsSink {
    async fn write(&self, metrics: CompletionMetrics) -> anyhow::Result<()> {
        self.records.lock().unwrap().push(metrics);
        Ok(())
    }
}
