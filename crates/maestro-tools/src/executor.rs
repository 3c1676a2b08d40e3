// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use maestro_config::ToolsConfig;
use maestro_model::User;

use crate::inventory::ResolvedToolCall;

/// Where a tool call was actually served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTarget {
    ToolProxy,
    CodeExecution,
    ExactCache,
    SemanticCache,
    /// Denied by access control; nothing ran.
    Policy,
}

/// Normalized result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub server_name: String,
    pub executed_on: ExecutionTarget,
    pub latency_ms: u64,
    pub request_bytes: usize,
    pub response_bytes: usize,
    pub payload: Option<Value>,
    pub error: Option<String>,
    /// Handling pod reported by the tool-proxy, copied into audit.
    pub proxy_host: Option<String>,
}

impl ToolResult {
    pub fn ok(call: &ResolvedToolCall, target: ExecutionTarget, payload: Value) -> Self {
        Self {
            tool_call_id: call.tool_call_id.clone(),
            tool_name: call.normalized_name.clone(),
            server_name: call.server_id.clone(),
            executed_on: target,
            latency_ms: 0,
            request_bytes: 0,
            response_bytes: 0,
            payload: Some(payload),
            error: None,
            proxy_host: None,
        }
    }

    pub fn err(call: &ResolvedToolCall, target: ExecutionTarget, error: impl Into<String>) -> Self {
        Self {
            payload: None,
            error: Some(error.into()),
            ..Self::ok(call, target, Value::Null)
        }
    }

    pub fn denied(call: &ResolvedToolCall, reason: &str) -> Self {
        Self::err(call, ExecutionTarget::Policy, format!("access denied: {reason}"))
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Text injected into the tool message the model sees next round.
    pub fn content_for_model(&self) -> String {
        match (&self.error, &self.payload) {
            (Some(e), _) => format!("Error: {e}"),
            (None, Some(p)) => serde_json::to_string(p).unwrap_or_else(|_| "null".into()),
            (None, None) => "null".into(),
        }
    }
}

// ─── Code execution ──────────────────────────────────────────────────────────

/// One execution appended to the per-request code context, success or not.
#[derive(Debug, Clone)]
pub struct CodeExecution {
    pub tool_name: String,
    pub started_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub success: bool,
}

/// Per-(user, session) code-execution state.  The first invocation attaches a
/// backend session; later calls reuse it so workspace state persists across
/// tool calls and rounds.
#[derive(Debug, Clone, Default)]
pub struct CodeExecutionContext {
    pub session_id: Option<String>,
    pub executions: Vec<CodeExecution>,
}

#[async_trait]
pub trait CodeExecutionBackend: Send + Sync {
    /// Create or attach the session for this (user, chat-session) pair.
    async fn open_session(&self, user_id: &str, chat_session_id: &str) -> anyhow::Result<String>;

    async fn execute(
        &self,
        code_session_id: &str,
        call: &ResolvedToolCall,
    ) -> anyhow::Result<Value>;
}

// ─── Auth ────────────────────────────────────────────────────────────────────

/// Credentials available for outbound tool calls.
#[derive(Debug, Clone, Default)]
pub struct CallerAuth {
    /// End-user bearer, forwarded when it is actually a forwardable token.
    pub user_token: Option<String>,
    /// Identity token for on-behalf-of flows.
    pub identity_token: Option<String>,
}

/// True when the string is a forwardable user credential: a JWT or a token
/// with a recognized API-key prefix.
pub fn looks_like_user_token(token: &str) -> bool {
    let jwt = token.starts_with("eyJ") && token.matches('.').count() == 2;
    let api_key = token.starts_with("sk-") || token.starts_with("api-");
    jwt || api_key
}

// ─── Executor ────────────────────────────────────────────────────────────────

/// Routes a resolved tool call to the correct backend and normalizes the
/// response.  Event bracketing and audit are driven by the completion stage
/// around each call.
pub struct ToolExecutor {
    client: reqwest::Client,
    config: ToolsConfig,
}

impl ToolExecutor {
    pub fn new(config: ToolsConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.tool_timeout_ms))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ToolsConfig {
        &self.config
    }

    /// Tools classified as code tools run on the code-execution backend.
    pub fn is_code_tool(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.config
            .code_tool_prefixes
            .iter()
            .any(|p| lower.starts_with(p.as_str()))
            || self
                .config
                .code_tool_suffixes
                .iter()
                .any(|s| lower.ends_with(s.as_str()))
    }

    /// Run a code tool, reusing the backend session recorded in `ctx`.
    /// An execution record is appended regardless of success.
    pub async fn execute_code_tool(
        &self,
        backend: &dyn CodeExecutionBackend,
        ctx: &mut CodeExecutionContext,
        user: &User,
        chat_session_id: &str,
        call: &ResolvedToolCall,
    ) -> ToolResult {
        let started_at = Utc::now();
        let start = Instant::now();

        let outcome = async {
            let session_id = match &ctx.session_id {
                Some(id) => id.clone(),
                None => {
                    let id = backend.open_session(&user.id, chat_session_id).await?;
                    debug!(code_session = %id, "attached code-execution session");
                    ctx.session_id = Some(id.clone());
                    id
                }
            };
            backend.execute(&session_id, call).await
        }
        .await;

        let latency_ms = start.elapsed().as_millis() as u64;
        ctx.executions.push(CodeExecution {
            tool_name: call.normalized_name.clone(),
            started_at,
            latency_ms,
            success: outcome.is_ok(),
        });

        match outcome {
            Ok(payload) => ToolResult {
                latency_ms,
                ..ToolResult::ok(call, ExecutionTarget::CodeExecution, payload)
            },
            Err(e) => ToolResult {
                latency_ms,
                ..ToolResult::err(call, ExecutionTarget::CodeExecution, e.to_string())
            },
        }
    }

    /// Dispatch through the tool-proxy.
    pub async fn dispatch(
        &self,
        call: &ResolvedToolCall,
        user: &User,
        auth: &CallerAuth,
    ) -> ToolResult {
        if call.server_id.is_empty() {
            return ToolResult::err(
                call,
                ExecutionTarget::ToolProxy,
                format!("unknown tool: {}", call.original_name),
            );
        }
        let Some(base) = &self.config.proxy_url else {
            return ToolResult::err(call, ExecutionTarget::ToolProxy, "tool proxy not configured");
        };

        let mut call = call.clone();
        // The code agent authenticates callers itself: the user id argument
        // always comes from the session, never from the model.
        if call
            .server_id
            .to_lowercase()
            .contains(&self.config.code_agent_marker)
        {
            if let Some(obj) = call.arguments.as_object_mut() {
                obj.insert("user_id".into(), Value::String(user.id.clone()));
            }
        }

        let body = json!({
            "server": call.server_id,
            "tool": call.original_name,
            "arguments": call.arguments,
            "id": call.tool_call_id,
        });
        let request_bytes = body.to_string().len();

        let mut req = self
            .client
            .post(format!("{}/mcp/tool", base.trim_end_matches('/')))
            .json(&body);
        if let Some(bearer) = self.bearer_for(auth) {
            req = req.header("Authorization", format!("Bearer {bearer}"));
        }
        // Forwarded under both names: the executor does not know which cloud
        // backend will consume the on-behalf-of token.
        if let Some(idt) = &auth.identity_token {
            req = req.header("X-AWS-ID-Token", idt).header("X-Azure-ID-Token", idt);
        }

        let start = Instant::now();
        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(tool = %call.original_name, error = %e, "tool proxy transport error");
                return ToolResult {
                    latency_ms: start.elapsed().as_millis() as u64,
                    request_bytes,
                    ..ToolResult::err(&call, ExecutionTarget::ToolProxy, e.to_string())
                };
            }
        };

        let proxy_host = resp
            .headers()
            .get("x-mcp-proxy-host")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let latency_ms = start.elapsed().as_millis() as u64;
        let response_bytes = text.len();

        let base_result = ToolResult {
            latency_ms,
            request_bytes,
            response_bytes,
            proxy_host,
            ..ToolResult::ok(&call, ExecutionTarget::ToolProxy, Value::Null)
        };

        if !status.is_success() {
            return ToolResult {
                payload: None,
                error: Some(format!("tool proxy HTTP {status}: {text}")),
                ..base_result
            };
        }
        let body: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                return ToolResult {
                    payload: None,
                    error: Some(format!("tool proxy returned invalid JSON: {e}")),
                    ..base_result
                }
            }
        };
        match normalize_proxy_payload(body) {
            Ok(payload) => ToolResult {
                payload: Some(payload),
                ..base_result
            },
            Err(e) => ToolResult {
                payload: None,
                error: Some(e),
                ..base_result
            },
        }
    }

    /// User token when it is forwardable, else the service-internal key.
    fn bearer_for(&self, auth: &CallerAuth) -> Option<String> {
        if let Some(tok) = &auth.user_token {
            if looks_like_user_token(tok) {
                return Some(tok.clone());
            }
        }
        self.config.api_internal_key.clone()
    }
}

/// Unwrap one level of `result.result` nesting and surface protocol errors.
pub fn normalize_proxy_payload(body: Value) -> Result<Value, String> {
    if let Some(err) = body.get("error") {
        let msg = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(msg);
    }
    match body.get("result") {
        Some(inner) => {
            // Double-wrapping is tolerated: {result: {result: <payload>}}.
            if let Some(nested) = inner.get("result") {
                Ok(nested.clone())
            } else {
                Ok(inner.clone())
            }
        }
        None => Ok(body),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
