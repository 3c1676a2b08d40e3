// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be on unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

/// Settings that drive the completion pipeline and model routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Model used when neither the request nor task analysis picks one.
    /// A request that resolves to no model at all is rejected at ingress.
    pub default_chat_model: Option<String>,
    /// Models that accept image input.  Empty means unknown.
    #[serde(default)]
    pub vision_capable_models: Vec<String>,
    /// Model to swap in when the request carries images but the routed model
    /// is not vision-capable.
    pub vision_fallback_model: Option<String>,
    /// Let task analysis override the configured model for a request.
    #[serde(default = "default_true")]
    pub intelligent_routing: bool,
    /// Let task analysis send trivially simple queries to a cheap local model.
    #[serde(default)]
    pub route_simple_to_ollama: bool,
    /// Maximum provider-stream → tool-calls cycles per request.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Hard cap on the number of tool schemas sent to a provider.
    /// The platform limit is 128; one slot is reserved.
    #[serde(default = "default_tool_limit")]
    pub tool_limit: usize,
    /// Idle seconds before a provider stream is considered dead.
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,
    /// Minimum milliseconds between best-effort persistence of streamed text.
    #[serde(default = "default_persist_interval")]
    pub persist_interval_ms: u64,
}

fn default_max_tool_rounds() -> u32 {
    8
}

fn default_tool_limit() -> usize {
    127
}

fn default_stream_idle_timeout() -> u64 {
    120
}

fn default_persist_interval() -> u64 {
    1000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_chat_model: None,
            vision_capable_models: Vec::new(),
            vision_fallback_model: None,
            intelligent_routing: true,
            route_simple_to_ollama: false,
            max_tool_rounds: default_max_tool_rounds(),
            tool_limit: default_tool_limit(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
            persist_interval_ms: default_persist_interval(),
        }
    }
}

/// Retrieval-stage budgets and filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_docs")]
    pub max_docs: usize,
    #[serde(default = "default_max_chats")]
    pub max_chats: usize,
    #[serde(default = "default_max_artifacts")]
    pub max_artifacts: usize,
    /// Items scoring below this are dropped after the fan-out joins.
    #[serde(default = "default_min_relevance")]
    pub min_relevance_score: f32,
    #[serde(default = "default_true")]
    pub enable_artifact_search: bool,
    /// Documentation collections to query.  Empty means all configured.
    #[serde(default)]
    pub collections: Vec<String>,
}

fn default_max_docs() -> usize {
    6
}

fn default_max_chats() -> usize {
    4
}

fn default_max_artifacts() -> usize {
    4
}

fn default_min_relevance() -> f32 {
    0.3
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_docs: default_max_docs(),
            max_chats: default_max_chats(),
            max_artifacts: default_max_artifacts(),
            min_relevance_score: default_min_relevance(),
            enable_artifact_search: true,
            collections: Vec::new(),
        }
    }
}

/// Tool-result cache tuning (both tiers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum entries held by the exact (per-user) tier.
    #[serde(default = "default_exact_capacity")]
    pub exact_capacity: usize,
    /// Cosine similarity floor for a semantic-tier hit.
    #[serde(default = "default_similarity_min")]
    pub semantic_similarity_min: f32,
    /// Soft cap on any cache lookup; a slower lookup is treated as a miss.
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_ms: u64,
    /// Argument keys inspected (in order) to extract the resource scope that
    /// gates cross-user semantic hits.
    #[serde(default = "default_scope_keys")]
    pub resource_scope_keys: Vec<String>,
}

fn default_exact_capacity() -> usize {
    1024
}

fn default_similarity_min() -> f32 {
    0.90
}

fn default_lookup_timeout() -> u64 {
    500
}

fn default_scope_keys() -> Vec<String> {
    [
        "subscription_id",
        "subscriptionId",
        "account_id",
        "accountId",
        "project_id",
        "tenant_id",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            exact_capacity: default_exact_capacity(),
            semantic_similarity_min: default_similarity_min(),
            lookup_timeout_ms: default_lookup_timeout(),
            resource_scope_keys: default_scope_keys(),
        }
    }
}

/// Tool-proxy endpoint and executor routing rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Base URL of the tool-proxy service.
    pub proxy_url: Option<String>,
    /// Service-to-service bearer used when the user token is not forwardable.
    pub api_internal_key: Option<String>,
    /// Hard cap on a single proxied tool execution.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_ms: u64,
    /// Tools whose names start with one of these run on the code-execution
    /// backend instead of the proxy.
    #[serde(default = "default_code_prefixes")]
    pub code_tool_prefixes: Vec<String>,
    /// Suffix counterpart of `code_tool_prefixes`.
    #[serde(default = "default_code_suffixes")]
    pub code_tool_suffixes: Vec<String>,
    /// Servers whose name contains this marker get the authenticated user id
    /// injected into tool arguments, replacing any model-supplied value.
    #[serde(default = "default_code_agent_marker")]
    pub code_agent_marker: String,
    /// Tool-name marker identifying the background-job tool that audit-style
    /// requests are pinned to.
    #[serde(default = "default_background_marker")]
    pub background_tool_marker: String,
    /// Glob patterns over `server/tool` that nobody may call.
    #[serde(default)]
    pub deny_tools: Vec<String>,
    /// Glob patterns over `server/tool` restricted to listed groups.
    #[serde(default)]
    pub restricted_tools: Vec<RestrictedTool>,
}

/// One group-restricted tool pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestrictedTool {
    /// Glob over `server/tool` (`*` and `?` supported).
    pub pattern: String,
    /// Groups allowed to call matching tools.
    pub groups: Vec<String>,
}

fn default_tool_timeout() -> u64 {
    600_000
}

fn default_code_prefixes() -> Vec<String> {
    vec!["code_".to_string(), "python_".to_string()]
}

fn default_code_suffixes() -> Vec<String> {
    vec!["_sandbox".to_string(), "_interpreter".to_string()]
}

fn default_code_agent_marker() -> String {
    "agenticode".to_string()
}

fn default_background_marker() -> String {
    "background".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            api_internal_key: None,
            tool_timeout_ms: default_tool_timeout(),
            code_tool_prefixes: default_code_prefixes(),
            code_tool_suffixes: default_code_suffixes(),
            code_agent_marker: default_code_agent_marker(),
            background_tool_marker: default_background_marker(),
            deny_tools: Vec::new(),
            restricted_tools: Vec::new(),
        }
    }
}

// ─── Slider ──────────────────────────────────────────────────────────────────

/// Where a request's slider value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliderSource {
    Request,
    Session,
    Default,
}

/// A single numeric cost/quality/latency preference attached to a request.
/// Drives model routing and native-reasoning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliderConfig {
    /// 0–100; higher buys more capable models and deeper reasoning.
    pub position: u8,
    pub enable_thinking: bool,
    pub max_thinking_budget: u32,
    pub source: SliderSource,
}

impl Default for SliderConfig {
    fn default() -> Self {
        Self {
            position: 50,
            enable_thinking: true,
            max_thinking_budget: 8192,
            source: SliderSource::Default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliderTier {
    Economical,
    Balanced,
    Premium,
}

impl SliderConfig {
    /// Economical ≤ 40, Balanced 41–60, Premium > 60.
    pub fn tier(&self) -> SliderTier {
        match self.position {
            0..=40 => SliderTier::Economical,
            41..=60 => SliderTier::Balanced,
            _ => SliderTier::Premium,
        }
    }

    /// Thinking budget honoring both the slider toggle and the tier ceiling.
    pub fn effective_thinking_budget(&self) -> u32 {
        if !self.enable_thinking {
            return 0;
        }
        let ceiling = match self.tier() {
            SliderTier::Economical => 0,
            SliderTier::Balanced => 8192,
            SliderTier::Premium => 32_768,
        };
        self.max_thinking_budget.min(ceiling)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
