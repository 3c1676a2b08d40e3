// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Instant;

use serde_json::Value;

use maestro_config::SliderConfig;
use maestro_model::{router::TaskAnalysis, ContentPart, Message, ToolCall, User};
use maestro_retrieval::{RetrievedKnowledge, TieredMemories};
use maestro_tools::{CallerAuth, CodeExecutionContext, ToolInventory, ToolResult};

/// Inbound chat request, created at ingress and immutable thereafter.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub message_id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub message: String,
    pub attachments: Vec<ContentPart>,
    /// Explicit model override; wins over every routing rule.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub suppress_streaming: bool,
    pub enable_rag: bool,
    pub slider: Option<SliderConfig>,
    pub enable_extended_thinking: Option<bool>,
}

impl ChatRequest {
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            session_id: None,
            message: message.into(),
            attachments: Vec::new(),
            model: None,
            temperature: None,
            max_tokens: None,
            suppress_streaming: false,
            enable_rag: true,
            slider: None,
            enable_extended_thinking: None,
        }
    }
}

/// Mutable per-request state shared by the pipeline stages.  Exclusively
/// owned by the request task; created at ingress, destroyed on completion or
/// abort.
pub struct PipelineContext {
    pub request: ChatRequest,
    pub user: User,
    pub slider: SliderConfig,
    /// Session history, kept sorted by `(timestamp, role tie-rank)`.
    pub messages: Vec<Message>,
    /// Messages actually sent to the provider this request.
    pub prepared_messages: Vec<Message>,
    pub tools: ToolInventory,
    pub rag: Option<RetrievedKnowledge>,
    pub memories: Option<TieredMemories>,
    /// Append-only record of every tool invocation this request.
    pub mcp_calls: Vec<ToolResult>,
    pub code_execution: CodeExecutionContext,
    pub metadata: serde_json::Map<String, Value>,
    pub started_at: Instant,
    pub model_selection_reason: Option<String>,
    pub suppress_streaming: bool,
    pub force_final_completion: bool,
    /// Model configured on the session/pipeline this request belongs to.
    pub pipeline_model: Option<String>,
    pub task_analysis: Option<TaskAnalysis>,
    pub auth: CallerAuth,
}

impl PipelineContext {
    pub fn new(request: ChatRequest, user: User) -> Self {
        let slider = request.slider.clone().unwrap_or_default();
        let suppress_streaming = request.suppress_streaming;
        Self {
            request,
            user,
            slider,
            messages: Vec::new(),
            prepared_messages: Vec::new(),
            tools: ToolInventory::default(),
            rag: None,
            memories: None,
            mcp_calls: Vec::new(),
            code_execution: CodeExecutionContext::default(),
            metadata: serde_json::Map::new(),
            started_at: Instant::now(),
            model_selection_reason: None,
            suppress_streaming,
            force_final_completion: false,
            pipeline_model: None,
            task_analysis: None,
            auth: CallerAuth::default(),
        }
    }

    /// Insert a message keeping the list sorted by `(timestamp, tie rank)`.
    /// Assistant sorts before user on timestamp ties, so a reply that shares
    /// a sub-millisecond timestamp with its prompt stays chronological.
    pub fn push_message(&mut self, msg: Message) {
        let key = |m: &Message| (m.timestamp, m.role.tie_rank());
        let pos = self
            .messages
            .iter()
            .rposition(|m| key(m) <= key(&msg))
            .map(|p| p + 1)
            .unwrap_or(0);
        self.messages.insert(pos, msg);
    }

    pub fn record_tool_call(&mut self, result: ToolResult) {
        self.mcp_calls.push(result);
    }

    /// Tool calls executed this request, for finalization metadata.
    pub fn executed_tool_calls(&self) -> Vec<ToolCall> {
        self.prepared_messages
            .iter()
            .flat_map(|m| m.tool_calls.iter().cloned())
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
