// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The typed event surface streamed to the client, and the sink that carries
//! it.  Serialized shapes are wire-exact: clients key on `type` and ignore
//! event types they do not recognize.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use maestro_model::{ToolCall, Usage};

/// Where a message row came from: a confirmed durable write or an in-memory
/// fallback id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Database,
    Optimistic,
}

/// One event on the per-request stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChatEvent {
    MessageSaved {
        message_id: String,
        role: String,
        content: String,
        timestamp: DateTime<Utc>,
        source: EventSource,
        confirmed: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        streaming: Option<bool>,
    },
    RagStatus {
        docs_retrieved: usize,
        chats_retrieved: usize,
        artifacts_retrieved: usize,
        collections: Vec<String>,
        retrieval_time: u64,
    },
    CompletionStart {
        model: String,
        message_id: String,
        source: EventSource,
    },
    Stream {
        content: String,
        timestamp: DateTime<Utc>,
    },
    Thinking {
        content: String,
        accumulated: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        elapsed_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tokens_per_second: Option<f64>,
    },
    TokenMetrics {
        tokens: u32,
        elapsed_ms: u64,
        tokens_per_second: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        actual_usage: Option<Usage>,
        #[serde(rename = "final", skip_serializing_if = "Option::is_none")]
        is_final: Option<bool>,
    },
    /// Heartbeat while tool-call deltas accumulate; partial calls are never
    /// exposed beyond this.
    ToolCallDelta {
        count: usize,
        timestamp: DateTime<Utc>,
    },
    ToolExecuting {
        name: String,
        arguments: Value,
        tool_call_id: String,
        target_server: String,
        timestamp: DateTime<Utc>,
    },
    ToolResult {
        name: String,
        result: Value,
        tool_call_id: String,
        execution_time_ms: u64,
        target_server: String,
        timestamp: DateTime<Utc>,
    },
    ToolError {
        name: String,
        error: String,
        tool_call_id: String,
        target_server: String,
        timestamp: DateTime<Utc>,
    },
    ToolCacheHit {
        name: String,
        tool_call_id: String,
        cached: bool,
        timestamp: DateTime<Utc>,
    },
    ToolSemanticCacheHit {
        name: String,
        tool_call_id: String,
        cached: bool,
        semantic: bool,
        cross_user: bool,
        similarity: f32,
        #[serde(skip_serializing_if = "Option::is_none")]
        resource_scope: Option<String>,
        time_saved_ms: u64,
        timestamp: DateTime<Utc>,
    },
    ProviderFailover {
        occurred: bool,
        original_provider: String,
        failover_provider: String,
        failure_reason: String,
        failover_time: DateTime<Utc>,
        message: String,
    },
    MessageUpdated {
        message_id: String,
        role: String,
        content: String,
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<ToolCall>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_usage: Option<Usage>,
        model: String,
        source: EventSource,
        confirmed: bool,
        #[serde(rename = "final")]
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking_content: Option<String>,
    },
    CompletionComplete {
        message_id: String,
        tool_calls: Vec<ToolCall>,
        usage: Usage,
        finish_reason: String,
        model: String,
        source: EventSource,
    },
    CompletionError {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
    },
    ContentSafetyWarning {
        message_id: String,
        issues: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        had_non_english: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        had_repetition: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        truncated: Option<bool>,
    },
    Warning {
        code: String,
        message: String,
    },
}

impl ChatEvent {
    /// Event-type tag, as serialized on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageSaved { .. } => "message_saved",
            Self::RagStatus { .. } => "rag_status",
            Self::CompletionStart { .. } => "completion_start",
            Self::Stream { .. } => "stream",
            Self::Thinking { .. } => "thinking",
            Self::TokenMetrics { .. } => "token_metrics",
            Self::ToolCallDelta { .. } => "tool_call_delta",
            Self::ToolExecuting { .. } => "tool_executing",
            Self::ToolResult { .. } => "tool_result",
            Self::ToolError { .. } => "tool_error",
            Self::ToolCacheHit { .. } => "tool_cache_hit",
            Self::ToolSemanticCacheHit { .. } => "tool_semantic_cache_hit",
            Self::ProviderFailover { .. } => "provider_failover",
            Self::MessageUpdated { .. } => "message_updated",
            Self::CompletionComplete { .. } => "completion_complete",
            Self::CompletionError { .. } => "completion_error",
            Self::ContentSafetyWarning { .. } => "content_safety_warning",
            Self::Warning { .. } => "warning",
        }
    }
}

// ─── Event sink ──────────────────────────────────────────────────────────────

/// Ordered, lossless delivery of events from the pipeline to one client
/// stream.  The bounded channel propagates client back-pressure to whoever
/// is producing — the provider stream is never consumed faster than the
/// client accepts.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ChatEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Append an event to the stream.  Returns `false` when the client is
    /// gone; the pipeline uses that as its disconnect signal.
    pub async fn emit(&self, event: ChatEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
