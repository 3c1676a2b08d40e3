// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The completion stage: database-first placeholder, provider stream parsing,
//! the tool loop, and finalization.
//!
//! One request is one sequence of rounds.  Each round opens a provider
//! stream; a round that yields tool calls executes them sequentially and
//! feeds the results back as messages, a round that yields none finalizes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use maestro_cache::{
    extract_resource_scope, is_cacheable, ttl_for, Embedder, ExactCache, ScopeAccess,
    SemanticCache,
};
use maestro_config::Config;
use maestro_model::{
    classify_provider_error, router, CompletionRequest, Message, ProviderErrorClass,
    ProviderManager, ResponseEvent, ResponseStream, ToolCall, Usage,
};
use maestro_tools::{
    AccessDecision, AuditRecord, AuditSink, CodeExecutionBackend, ExecutionTarget,
    ResolvedToolCall, ToolAccessPolicy, ToolExecutor, ToolResult,
};

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::events::{ChatEvent, EventSink, EventSource};
use crate::metrics::{CompletionMetrics, MetricsSink};
use crate::safety::check_content_safety;
use crate::store::{MessageStore, MessageUpdate};

/// Tool-set floor for the schema-limit recovery path.
const SCHEMA_RETRY_MIN_TOOLS: usize = 20;
const SCHEMA_RETRY_MAX: u32 = 2;

/// Stream-parser states.  Mostly linear; `AccumulatingToolCalls` can
/// interleave with text and reasoning on providers that stream them together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    PreFirstToken,
    StreamingText,
    StreamingReasoning,
    AccumulatingToolCalls,
    Done,
}

/// Everything the completion stage talks to.
#[derive(Clone)]
pub struct CompletionDeps {
    pub config: Arc<Config>,
    pub providers: Arc<ProviderManager>,
    pub store: Arc<dyn MessageStore>,
    pub executor: Arc<ToolExecutor>,
    pub access: Arc<ToolAccessPolicy>,
    pub exact_cache: Arc<ExactCache>,
    pub semantic_cache: Arc<SemanticCache>,
    /// `None` disables the semantic tier entirely.
    pub embedder: Option<Arc<dyn Embedder>>,
    pub scope_access: Arc<dyn ScopeAccess>,
    pub audit: Arc<dyn AuditSink>,
    pub metrics: Arc<dyn MetricsSink>,
    pub code_backend: Option<Arc<dyn CodeExecutionBackend>>,
}

pub struct CompletionStage {
    deps: CompletionDeps,
}

struct RoundOutput {
    text: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    usage: Usage,
}

struct Placeholder {
    id: String,
    source: EventSource,
    session_id: String,
}

impl CompletionStage {
    pub fn new(deps: CompletionDeps) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &CompletionDeps {
        &self.deps
    }

    /// Drive the request to completion.  `ctx.prepared_messages` must already
    /// be assembled; the tool inventory and auth are read from `ctx`.
    pub async fn run(
        &self,
        ctx: &mut PipelineContext,
        sink: &EventSink,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Result<(), PipelineError> {
        let routed = router::route(router::RouteInput {
            requested_model: ctx.request.model.as_deref(),
            pipeline_model: ctx.pipeline_model.as_deref(),
            config: &self.deps.config.pipeline,
            slider: &ctx.slider,
            analysis: ctx.task_analysis.as_ref(),
            messages: &ctx.prepared_messages,
            enable_extended_thinking: ctx.request.enable_extended_thinking,
        })
        .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        ctx.model_selection_reason = Some(routed.reason.clone());

        let placeholder = self.write_placeholder(ctx, sink, &routed.model).await;
        let _ = sink
            .emit(ChatEvent::CompletionStart {
                model: routed.model.clone(),
                message_id: placeholder.id.clone(),
                source: placeholder.source,
            })
            .await;

        let request_start = Instant::now();
        let mut round: u32 = 0;
        let mut text_acc = String::new();
        let mut reasoning_acc = String::new();
        let mut usage_total = Usage::default();
        let mut ttft: Option<Duration> = None;
        let mut last_persist = Instant::now();
        let mut provider_name = self
            .deps
            .providers
            .primary_name()
            .unwrap_or("unknown")
            .to_string();

        let outcome = loop {
            if cancelled(cancel) {
                break Err(PipelineError::Cancelled);
            }

            let (tools, tool_choice) = if ctx.force_final_completion {
                // The forced final stream goes out tool-free so the model
                // must produce text.
                (Vec::new(), router::ToolChoice::Auto)
            } else {
                router::shape_tools(
                    ctx.tools.schemas(),
                    ctx.task_analysis.as_ref(),
                    &ctx.request.message,
                    &self.deps.config.pipeline,
                    &self.deps.config.tools.background_tool_marker,
                )
            };

            let req = CompletionRequest {
                model: routed.model.clone(),
                messages: ctx.prepared_messages.clone(),
                tools,
                tool_choice: tool_choice.into_wire(),
                temperature: ctx.request.temperature,
                max_tokens: ctx.request.max_tokens,
                reasoning: routed.reasoning.clone(),
                stream: true,
            };

            let (pname, stream) = match self.open_stream_with_retry(req, sink).await {
                Ok(x) => x,
                Err(e) => break Err(e),
            };
            provider_name = pname;

            // Failover metadata is polled once and cleared; the event goes
            // out before any stream chunk from the replacement provider.
            if let Some(fo) = self.deps.providers.take_failover() {
                let _ = sink
                    .emit(ChatEvent::ProviderFailover {
                        occurred: true,
                        original_provider: fo.original_provider.clone(),
                        failover_provider: fo.failover_provider.clone(),
                        failure_reason: fo.failure_reason.clone(),
                        failover_time: fo.failover_time,
                        message: format!(
                            "switched from {} to {}",
                            fo.original_provider, fo.failover_provider
                        ),
                    })
                    .await;
            }

            let out = match self
                .read_stream(
                    stream,
                    ctx,
                    sink,
                    cancel,
                    &placeholder,
                    &mut text_acc,
                    &mut ttft,
                    &mut last_persist,
                )
                .await
            {
                Ok(out) => out,
                Err(e) => break Err(e),
            };

            usage_total.add(out.usage);
            if !out.reasoning.is_empty() {
                reasoning_acc.push_str(&out.reasoning);
            }
            let _ = sink
                .emit(ChatEvent::TokenMetrics {
                    tokens: usage_total.completion_tokens,
                    elapsed_ms: request_start.elapsed().as_millis() as u64,
                    tokens_per_second: tokens_per_second(
                        usage_total.completion_tokens,
                        request_start.elapsed(),
                    ),
                    actual_usage: None,
                    is_final: None,
                })
                .await;

            if out.tool_calls.is_empty() {
                break Ok(true);
            }
            if ctx.force_final_completion {
                // Providers occasionally emit tool calls even with an empty
                // tool list.  Treat it as an error round: drop the calls and
                // finalize with whatever text exists.
                warn!(
                    count = out.tool_calls.len(),
                    "tool calls in forced-final round; dropping"
                );
                break Ok(false);
            }

            self.handle_tool_calls(out.tool_calls, &out.text, ctx, sink, &routed.model, &provider_name)
                .await;

            round += 1;
            if round >= self.deps.config.pipeline.max_tool_rounds {
                debug!(round, "tool-round cap reached; forcing final completion");
                ctx.force_final_completion = true;
            }
        };

        match outcome {
            Ok(clean_terminal) => {
                self.finalize(
                    ctx,
                    sink,
                    &placeholder,
                    &routed.model,
                    &provider_name,
                    text_acc,
                    reasoning_acc,
                    usage_total,
                    ttft,
                    request_start,
                    clean_terminal,
                )
                .await;
                Ok(())
            }
            Err(PipelineError::Cancelled) => {
                self.persist_interrupted(ctx, &placeholder, &text_acc).await;
                self.write_metrics(
                    ctx,
                    &placeholder,
                    &routed.model,
                    &provider_name,
                    usage_total,
                    ttft,
                    request_start,
                    "interrupted",
                )
                .await;
                Err(PipelineError::Cancelled)
            }
            Err(e) => {
                self.persist_failure(ctx, &placeholder, &text_acc).await;
                self.write_metrics(
                    ctx,
                    &placeholder,
                    &routed.model,
                    &provider_name,
                    usage_total,
                    ttft,
                    request_start,
                    "error",
                )
                .await;
                Err(e)
            }
        }
    }

    // ─── Placeholder ─────────────────────────────────────────────────────────

    /// Write the empty assistant row before the stream opens so clients can
    /// attach deltas to a stable primary key.
    async fn write_placeholder(
        &self,
        ctx: &PipelineContext,
        sink: &EventSink,
        model: &str,
    ) -> Placeholder {
        let session_id = ctx
            .request
            .session_id
            .clone()
            .unwrap_or_else(|| format!("session_{}", ctx.request.message_id));

        let mut row = Message::assistant("");
        row.model = Some(model.to_string());
        row.metadata
            .insert("status".into(), Value::String("streaming".into()));

        let (id, source) = match self.deps.store.add_message(&session_id, &row).await {
            Ok(id) => (id, EventSource::Database),
            Err(e) => {
                warn!(error = %e, "placeholder write failed; continuing optimistically");
                (
                    format!("assistant_{}", ctx.request.message_id),
                    EventSource::Optimistic,
                )
            }
        };

        let _ = sink
            .emit(ChatEvent::MessageSaved {
                message_id: id.clone(),
                role: "assistant".into(),
                content: String::new(),
                timestamp: row.timestamp,
                source,
                confirmed: source == EventSource::Database,
                streaming: Some(true),
            })
            .await;

        Placeholder {
            id,
            source,
            session_id,
        }
    }

    // ─── Provider stream ─────────────────────────────────────────────────────

    /// Open the provider stream, recovering from schema-complexity
    /// rejections by halving the tool set (floor 20, at most 2 retries).
    async fn open_stream_with_retry(
        &self,
        mut req: CompletionRequest,
        sink: &EventSink,
    ) -> Result<(String, ResponseStream), PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            match self.deps.providers.open_stream(req.clone()).await {
                Ok(opened) => return Ok(opened),
                Err(e) => {
                    let class = classify_provider_error(&e);
                    let can_shrink = req.tools.len() > SCHEMA_RETRY_MIN_TOOLS;
                    if class == ProviderErrorClass::SchemaComplexity
                        && attempt < SCHEMA_RETRY_MAX
                        && can_shrink
                    {
                        attempt += 1;
                        let target = (req.tools.len() / 2).max(SCHEMA_RETRY_MIN_TOOLS);
                        let _ = sink
                            .emit(ChatEvent::Warning {
                                code: "TOOL_LIMIT_EXCEEDED".into(),
                                message: format!(
                                    "provider rejected {} tool schemas; retrying with {}",
                                    req.tools.len(),
                                    target
                                ),
                            })
                            .await;
                        req.tools.truncate(target);
                        continue;
                    }
                    let retryable = matches!(
                        class,
                        ProviderErrorClass::Timeout | ProviderErrorClass::RateLimit
                    );
                    return Err(PipelineError::completion("provider_stream", e, retryable));
                }
            }
        }
    }

    /// Parse one provider stream into text, reasoning, and assembled tool
    /// calls, emitting deltas as they arrive.
    #[allow(clippy::too_many_arguments)]
    async fn read_stream(
        &self,
        mut stream: ResponseStream,
        ctx: &PipelineContext,
        sink: &EventSink,
        cancel: &mut oneshot::Receiver<()>,
        placeholder: &Placeholder,
        text_acc: &mut String,
        ttft: &mut Option<Duration>,
        last_persist: &mut Instant,
    ) -> Result<RoundOutput, PipelineError> {
        let idle = Duration::from_secs(self.deps.config.pipeline.stream_idle_timeout_secs);
        let persist_every = Duration::from_millis(self.deps.config.pipeline.persist_interval_ms);
        let stream_open = Instant::now();

        let mut phase = StreamPhase::PreFirstToken;
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut usage = Usage::default();
        let mut pending: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
        let mut heartbeat_sent = false;

        while phase != StreamPhase::Done {
            let next = tokio::select! {
                biased;
                _ = &mut *cancel => return Err(PipelineError::Cancelled),
                next = tokio::time::timeout(idle, stream.next()) => next,
            };
            let event = match next {
                Err(_) => {
                    return Err(PipelineError::completion(
                        "provider_stream",
                        "provider stream idle timeout",
                        true,
                    ))
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    let retryable = matches!(
                        classify_provider_error(&e),
                        ProviderErrorClass::Timeout | ProviderErrorClass::RateLimit
                    );
                    return Err(PipelineError::completion("provider_stream", e, retryable));
                }
                Ok(Some(Ok(event))) => event,
            };

            match event {
                ResponseEvent::TextDelta(delta) if !delta.is_empty() => {
                    if phase == StreamPhase::PreFirstToken {
                        *ttft = ttft.or_else(|| Some(stream_open.elapsed()));
                    }
                    if phase != StreamPhase::AccumulatingToolCalls {
                        phase = StreamPhase::StreamingText;
                    }
                    text.push_str(&delta);
                    text_acc.push_str(&delta);
                    if !ctx.suppress_streaming {
                        let _ = sink
                            .emit(ChatEvent::Stream {
                                content: delta,
                                timestamp: Utc::now(),
                            })
                            .await;
                    }
                    // Best-effort incremental persistence, at most once per
                    // interval; failures are logged and ignored.
                    if placeholder.source == EventSource::Database
                        && last_persist.elapsed() >= persist_every
                    {
                        *last_persist = Instant::now();
                        if let Err(e) = self
                            .deps
                            .store
                            .update_message(
                                &placeholder.id,
                                MessageUpdate {
                                    content: Some(text_acc.clone()),
                                    ..Default::default()
                                },
                            )
                            .await
                        {
                            debug!(error = %e, "incremental persist failed");
                        }
                    }
                }
                ResponseEvent::TextDelta(_) => {}
                ResponseEvent::ReasoningDelta(delta) => {
                    if phase != StreamPhase::AccumulatingToolCalls {
                        phase = StreamPhase::StreamingReasoning;
                    }
                    reasoning.push_str(&delta);
                    if !ctx.suppress_streaming {
                        let _ = sink
                            .emit(ChatEvent::Thinking {
                                content: delta,
                                accumulated: reasoning.clone(),
                                tokens: None,
                                elapsed_ms: Some(stream_open.elapsed().as_millis() as u64),
                                tokens_per_second: None,
                            })
                            .await;
                    }
                }
                ResponseEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments,
                    thought_signature,
                } => {
                    phase = StreamPhase::AccumulatingToolCalls;
                    let ptc = pending.entry(index).or_default();
                    if !id.is_empty() {
                        ptc.id = id;
                    }
                    if !name.is_empty() {
                        ptc.name = name;
                    }
                    ptc.args_buf.push_str(&arguments);
                    if thought_signature.is_some() {
                        ptc.thought_signature = thought_signature;
                    }
                    // Partial tool calls never reach the client beyond this
                    // one heartbeat.
                    if !heartbeat_sent {
                        heartbeat_sent = true;
                        let _ = sink
                            .emit(ChatEvent::ToolCallDelta {
                                count: pending.len(),
                                timestamp: Utc::now(),
                            })
                            .await;
                    }
                }
                ResponseEvent::Usage {
                    prompt_tokens,
                    completion_tokens,
                } => {
                    usage.add(Usage {
                        prompt_tokens,
                        completion_tokens,
                    });
                }
                ResponseEvent::Done => {
                    phase = StreamPhase::Done;
                }
                ResponseEvent::Error(e) => {
                    warn!("provider stream warning: {e}");
                }
            }
        }

        // Flush accumulated tool calls in index order, dropping undispatchable
        // ones and repairing missing ids so the round can still complete.
        let mut tool_calls = Vec::with_capacity(pending.len());
        for (i, (_, ptc)) in pending.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(tool_call_id = %ptc.id, "dropping tool call with empty name");
                continue;
            }
            let mut tc = ptc.finish();
            if tc.id.is_empty() {
                tc.id = format!("tc_synthetic_{i}");
            }
            tool_calls.push(tc);
        }

        Ok(RoundOutput {
            text,
            reasoning,
            tool_calls,
            usage,
        })
    }

    // ─── Tool loop ───────────────────────────────────────────────────────────

    /// Execute one round's tool calls sequentially, then append the synthetic
    /// assistant turn and one tool message per result.
    async fn handle_tool_calls(
        &self,
        calls: Vec<ToolCall>,
        round_text: &str,
        ctx: &mut PipelineContext,
        sink: &EventSink,
        model: &str,
        provider: &str,
    ) {
        let mut results = Vec::with_capacity(calls.len());
        for call in &calls {
            let resolved = ctx.tools.resolve(call);
            let result = self.run_one_call(&resolved, ctx, sink, model, provider).await;
            ctx.record_tool_call(result.clone());
            results.push(result);
        }

        ctx.prepared_messages
            .push(Message::assistant_with_tool_calls(round_text, calls));
        for r in &results {
            ctx.prepared_messages
                .push(Message::tool_result(&r.tool_call_id, r.content_for_model()));
        }
    }

    /// Serve one resolved call: code backend, access check, exact tier,
    /// semantic tier, then live dispatch with cache population.
    async fn run_one_call(
        &self,
        resolved: &ResolvedToolCall,
        ctx: &mut PipelineContext,
        sink: &EventSink,
        model: &str,
        provider: &str,
    ) -> ToolResult {
        let user = ctx.user.clone();
        let name = resolved.normalized_name.clone();

        // Code tools bypass the proxy and the caches entirely.
        if self.deps.executor.is_code_tool(&name) {
            if let Some(backend) = self.deps.code_backend.clone() {
                self.emit_executing(sink, resolved).await;
                let chat_session = ctx
                    .request
                    .session_id
                    .clone()
                    .unwrap_or_else(|| ctx.request.message_id.clone());
                let result = self
                    .deps
                    .executor
                    .execute_code_tool(
                        backend.as_ref(),
                        &mut ctx.code_execution,
                        &user,
                        &chat_session,
                        resolved,
                    )
                    .await;
                self.emit_outcome(sink, &result).await;
                self.audit(&user, resolved, &result, model, provider).await;
                return result;
            }
            let result = ToolResult::err(
                resolved,
                ExecutionTarget::CodeExecution,
                "no code-execution backend configured",
            );
            self.emit_executing(sink, resolved).await;
            self.emit_outcome(sink, &result).await;
            self.audit(&user, resolved, &result, model, provider).await;
            return result;
        }

        // Access control.  A denial produces no execution events — only an
        // audit record and an error result the model can read.
        if let AccessDecision::Deny(reason) =
            self.deps.access.check(&user, &resolved.server_id, &name)
        {
            let result = ToolResult::denied(resolved, &reason);
            self.audit(&user, resolved, &result, model, provider).await;
            return result;
        }

        let cacheable = is_cacheable(&name, &resolved.arguments);
        let lookup_timeout = Duration::from_millis(self.deps.config.cache.lookup_timeout_ms);

        if cacheable {
            if let Some(payload) = self
                .deps
                .exact_cache
                .get(&name, &user.id, &resolved.arguments)
            {
                let result = ToolResult::ok(resolved, ExecutionTarget::ExactCache, payload);
                let _ = sink
                    .emit(ChatEvent::ToolCacheHit {
                        name: name.clone(),
                        tool_call_id: resolved.tool_call_id.clone(),
                        cached: true,
                        timestamp: Utc::now(),
                    })
                    .await;
                self.audit(&user, resolved, &result, model, provider).await;
                return result;
            }

            if let Some(embedder) = &self.deps.embedder {
                let key_text = semantic_key_text(&ctx.request.message, &resolved.arguments);
                // Both the embed and the index lookup share the soft cap; a
                // slow semantic tier degrades to a live dispatch.
                let hit = tokio::time::timeout(lookup_timeout, async {
                    let embedding = embedder.embed(&key_text).await.ok()?;
                    self.deps
                        .semantic_cache
                        .lookup(
                            &user.tenant_id,
                            &name,
                            &embedding,
                            &user,
                            self.deps.scope_access.as_ref(),
                        )
                        .await
                })
                .await
                .ok()
                .flatten();

                if let Some(hit) = hit {
                    let result =
                        ToolResult::ok(resolved, ExecutionTarget::SemanticCache, hit.result.clone());
                    let _ = sink
                        .emit(ChatEvent::ToolSemanticCacheHit {
                            name: name.clone(),
                            tool_call_id: resolved.tool_call_id.clone(),
                            cached: true,
                            semantic: true,
                            cross_user: hit.cross_user,
                            similarity: hit.similarity,
                            resource_scope: hit.resource_scope.clone(),
                            time_saved_ms: hit.time_saved_ms,
                            timestamp: Utc::now(),
                        })
                        .await;
                    self.audit(&user, resolved, &result, model, provider).await;
                    return result;
                }
            }
        }

        // Live dispatch, bracketed by the heartbeat pair.
        self.emit_executing(sink, resolved).await;
        let result = self.deps.executor.dispatch(resolved, &user, &ctx.auth).await;
        self.emit_outcome(sink, &result).await;
        self.audit(&user, resolved, &result, model, provider).await;

        if cacheable && !result.is_error() {
            if let Some(payload) = &result.payload {
                // Exact tier synchronously (cheap), semantic tier off-task.
                self.deps.exact_cache.put(
                    &name,
                    &user.id,
                    &resolved.arguments,
                    payload.clone(),
                    ttl_for(&name),
                );
                if let Some(embedder) = self.deps.embedder.clone() {
                    let semantic = Arc::clone(&self.deps.semantic_cache);
                    let scope_keys = self.deps.config.cache.resource_scope_keys.clone();
                    let key_text = semantic_key_text(&ctx.request.message, &resolved.arguments);
                    let arguments = resolved.arguments.clone();
                    let payload = payload.clone();
                    let tenant = user.tenant_id.clone();
                    let user_id = user.id.clone();
                    let tool = name.clone();
                    let latency = result.latency_ms;
                    tokio::spawn(async move {
                        match embedder.embed(&key_text).await {
                            Ok(embedding) => {
                                let scope = extract_resource_scope(&arguments, &scope_keys);
                                semantic.store(
                                    &tenant, &user_id, &tool, &arguments, scope, embedding,
                                    payload, latency,
                                );
                            }
                            Err(e) => debug!(error = %e, "semantic cache store skipped"),
                        }
                    });
                }
            }
        }

        result
    }

    async fn emit_executing(&self, sink: &EventSink, resolved: &ResolvedToolCall) {
        let _ = sink
            .emit(ChatEvent::ToolExecuting {
                name: resolved.normalized_name.clone(),
                arguments: resolved.arguments.clone(),
                tool_call_id: resolved.tool_call_id.clone(),
                target_server: resolved.server_id.clone(),
                timestamp: Utc::now(),
            })
            .await;
    }

    async fn emit_outcome(&self, sink: &EventSink, result: &ToolResult) {
        let event = match &result.error {
            Some(error) => ChatEvent::ToolError {
                name: result.tool_name.clone(),
                error: error.clone(),
                tool_call_id: result.tool_call_id.clone(),
                target_server: result.server_name.clone(),
                timestamp: Utc::now(),
            },
            None => ChatEvent::ToolResult {
                name: result.tool_name.clone(),
                result: result.payload.clone().unwrap_or(Value::Null),
                tool_call_id: result.tool_call_id.clone(),
                execution_time_ms: result.latency_ms,
                target_server: result.server_name.clone(),
                timestamp: Utc::now(),
            },
        };
        let _ = sink.emit(event).await;
    }

    async fn audit(
        &self,
        user: &maestro_model::User,
        resolved: &ResolvedToolCall,
        result: &ToolResult,
        model: &str,
        provider: &str,
    ) {
        let mut record = AuditRecord::new(
            &user.id,
            &resolved.normalized_name,
            &resolved.server_id,
            result.executed_on,
        );
        record.latency_ms = result.latency_ms;
        record.request_bytes = result.request_bytes;
        record.response_bytes = result.response_bytes;
        record.error = result.error.clone();
        record.model = Some(model.to_string());
        record.provider = Some(provider.to_string());
        record.proxy_host = result.proxy_host.clone();
        self.deps.audit.record(record).await;
    }

    // ─── Finalization ────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        ctx: &mut PipelineContext,
        sink: &EventSink,
        placeholder: &Placeholder,
        model: &str,
        provider: &str,
        text_acc: String,
        reasoning_acc: String,
        usage: Usage,
        ttft: Option<Duration>,
        request_start: Instant,
        clean_terminal: bool,
    ) {
        let mut final_content = text_acc;

        let safety = check_content_safety(&final_content);
        if safety.tripped() {
            let _ = sink
                .emit(ChatEvent::ContentSafetyWarning {
                    message_id: placeholder.id.clone(),
                    issues: safety.issues.clone(),
                    had_non_english: Some(safety.had_non_english),
                    had_repetition: Some(safety.had_repetition),
                    truncated: Some(safety.truncated),
                })
                .await;
            if let Some(sanitized) = safety.sanitized {
                final_content = sanitized;
            }
        }

        let tool_calls = ctx.executed_tool_calls();
        let mut metadata = serde_json::Map::new();
        metadata.insert("status".into(), Value::String("complete".into()));
        if !reasoning_acc.is_empty() {
            metadata.insert(
                "thinkingContent".into(),
                Value::String(reasoning_acc.clone()),
            );
        }
        if !ctx.mcp_calls.is_empty() {
            let calls: Vec<Value> = ctx
                .mcp_calls
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "tool": c.tool_name,
                        "server": c.server_name,
                        "executedOn": c.executed_on,
                        "latencyMs": c.latency_ms,
                        "error": c.error,
                    })
                })
                .collect();
            metadata.insert("mcpCalls".into(), Value::Array(calls));
        }

        if placeholder.source == EventSource::Database {
            let update = MessageUpdate {
                content: Some(final_content.clone()),
                tool_calls: Some(tool_calls.clone()),
                model: Some(model.to_string()),
                token_usage: Some(usage),
                metadata: Some(metadata),
            };
            if let Err(e) = self.deps.store.update_message(&placeholder.id, update).await {
                warn!(error = %e, "final message update failed");
            }
            let _ = sink
                .emit(ChatEvent::MessageUpdated {
                    message_id: placeholder.id.clone(),
                    role: "assistant".into(),
                    content: final_content.clone(),
                    timestamp: Utc::now(),
                    tool_calls: (!tool_calls.is_empty()).then(|| tool_calls.clone()),
                    token_usage: Some(usage),
                    model: model.to_string(),
                    source: EventSource::Database,
                    confirmed: true,
                    is_final: true,
                    thinking_content: (!reasoning_acc.is_empty()).then(|| reasoning_acc.clone()),
                })
                .await;
        } else {
            // No durable row; the finalized turn lives in the in-memory
            // conversation only.
            let mut msg = Message::assistant(&final_content);
            msg.model = Some(model.to_string());
            msg.token_usage = Some(usage);
            ctx.push_message(msg);
        }

        let elapsed = request_start.elapsed();
        let _ = sink
            .emit(ChatEvent::TokenMetrics {
                tokens: usage.completion_tokens,
                elapsed_ms: elapsed.as_millis() as u64,
                tokens_per_second: tokens_per_second(usage.completion_tokens, elapsed),
                actual_usage: Some(usage),
                is_final: Some(true),
            })
            .await;

        if clean_terminal {
            let _ = sink
                .emit(ChatEvent::CompletionComplete {
                    message_id: placeholder.id.clone(),
                    tool_calls,
                    usage,
                    finish_reason: "stop".into(),
                    model: model.to_string(),
                    source: placeholder.source,
                })
                .await;
        }

        self.write_metrics(
            ctx,
            placeholder,
            model,
            provider,
            usage,
            ttft,
            request_start,
            if clean_terminal { "complete" } else { "forced_stop" },
        )
        .await;
    }

    /// Cancellation path: keep whatever streamed, mark the row interrupted.
    async fn persist_interrupted(
        &self,
        _ctx: &PipelineContext,
        placeholder: &Placeholder,
        text_acc: &str,
    ) {
        if placeholder.source != EventSource::Database {
            return;
        }
        let mut metadata = serde_json::Map::new();
        metadata.insert("status".into(), Value::String("interrupted".into()));
        let update = MessageUpdate {
            content: Some(text_acc.to_string()),
            metadata: Some(metadata),
            ..Default::default()
        };
        if let Err(e) = self.deps.store.update_message(&placeholder.id, update).await {
            warn!(error = %e, "interrupted persist failed");
        }
    }

    /// Failure path: never leave an empty assistant row without a marker.
    async fn persist_failure(
        &self,
        _ctx: &PipelineContext,
        placeholder: &Placeholder,
        text_acc: &str,
    ) {
        if placeholder.source != EventSource::Database {
            return;
        }
        let content = if text_acc.is_empty() {
            "I was unable to complete this response. Please try again.".to_string()
        } else {
            check_content_safety(text_acc)
                .sanitized
                .unwrap_or_else(|| text_acc.to_string())
        };
        let mut metadata = serde_json::Map::new();
        metadata.insert("status".into(), Value::String("error".into()));
        let update = MessageUpdate {
            content: Some(content),
            metadata: Some(metadata),
            ..Default::default()
        };
        if let Err(e) = self.deps.store.update_message(&placeholder.id, update).await {
            warn!(error = %e, "failure persist failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_metrics(
        &self,
        ctx: &PipelineContext,
        placeholder: &Placeholder,
        model: &str,
        provider: &str,
        usage: Usage,
        ttft: Option<Duration>,
        request_start: Instant,
        status: &str,
    ) {
        let latency_ms = request_start.elapsed().as_millis() as u64;
        let ttft_ms = ttft.map(|d| d.as_millis() as u64);
        self.deps
            .metrics
            .record(CompletionMetrics {
                user_id: ctx.user.id.clone(),
                session_id: Some(placeholder.session_id.clone()),
                message_id: placeholder.id.clone(),
                provider_type: provider.to_string(),
                model: model.to_string(),
                latency_ms,
                ttft_ms,
                model_latency_ms: ttft_ms.map(|t| latency_ms.saturating_sub(t)),
                tokens_per_second: tokens_per_second(
                    usage.completion_tokens,
                    request_start.elapsed(),
                ),
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                tool_calls_count: ctx.mcp_calls.len(),
                status: status.to_string(),
            })
            .await;
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cancelled(cancel: &mut oneshot::Receiver<()>) -> bool {
    // A dropped sender counts as cancellation too; `try_recv` returns
    // `Closed` in that case, which a plain `.is_ok()` check would miss.
    !matches!(
        cancel.try_recv(),
        Err(oneshot::error::TryRecvError::Empty)
    )
}

/// Text embedded for the semantic tier: the canonical arguments when they
/// carry anything, else the user's message (paraphrase matching).
fn semantic_key_text(user_message: &str, arguments: &Value) -> String {
    match arguments.as_object() {
        Some(obj) if !obj.is_empty() => maestro_cache::canonical_json(arguments),
        _ => user_message.to_string(),
    }
}

fn tokens_per_second(tokens: u32, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        0.0
    } else {
        tokens as f64 / secs
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
    thought_signature: Option<String>,
}

impl PendingToolCall {
    /// Arguments must resolve to an object; `null` or invalid JSON breaks
    /// the next provider request, so empty/broken buffers become `{}`.
    fn finish(self) -> ToolCall {
        let arguments = if self.args_buf.is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool_name = %self.name,
                        error = %e,
                        "invalid JSON tool arguments from model; substituting {{}}"
                    );
                    Value::Object(Default::default())
                }
            }
        };
        ToolCall {
            id: self.id,
            name: self.name,
            arguments,
            thought_signature: self.thought_signature,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
