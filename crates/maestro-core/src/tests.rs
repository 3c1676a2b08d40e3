// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end pipeline tests against scripted providers and a local
//! tool-proxy stub.  These exercise the event contract: ordering, tool
//! bracketing, cache substitution, failover, schema-limit recovery, and
//! cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::oneshot;

use maestro_cache::{Embedder, ExactCache, ScopeAccess, SemanticCache};
use maestro_config::Config;
use maestro_model::{
    FailingProvider, Message, ModelProvider, ResponseEvent, ScriptedProvider, ToolSchema, User,
};
use maestro_retrieval::{NullMemory, RetrievalStage};
use maestro_tools::{
    CodeExecutionBackend, MemoryAuditSink, ResolvedToolCall, ToolAccessPolicy, ToolDescriptor,
    ToolExecutor, ToolInventory,
};

use crate::completion::{CompletionDeps, CompletionStage};
use crate::context::{ChatRequest, PipelineContext};
use crate::error::PipelineError;
use crate::events::{ChatEvent, EventSink, EventSource};
use crate::metrics::MemoryMetricsSink;
use crate::pipeline::ChatPipeline;
use crate::store::{InMemoryMessageStore, MessageStore};

// ─── Test doubles ────────────────────────────────────────────────────────────

/// Embeds every text to the same unit vector, so any two lookups are
/// perfectly similar and only the RBAC gate decides semantic hits.
struct ConstEmbedder;

#[async_trait]
impl Embedder for ConstEmbedder {
    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }
}

struct GrantList(Vec<(String, String)>);

#[async_trait]
impl ScopeAccess for GrantList {
    async fn can_access(&self, user: &User, scope: &str) -> bool {
        self.0
            .iter()
            .any(|(u, s)| u == &user.id && s == scope)
    }
}

struct StubCodeBackend;

#[async_trait]
impl CodeExecutionBackend for StubCodeBackend {
    async fn open_session(&self, user_id: &str, chat: &str) -> anyhow::Result<String> {
        Ok(format!("code-{user_id}-{chat}"))
    }
    async fn execute(
        &self,
        session: &str,
        _call: &ResolvedToolCall,
    ) -> anyhow::Result<serde_json::Value> {
        Ok(json!({"session": session}))
    }
}

/// Emits one text delta, then hangs — lets tests cancel mid-stream.
struct HangingProvider;

#[async_trait]
impl ModelProvider for HangingProvider {
    fn name(&self) -> &str {
        "hanging"
    }
    async fn complete(
        &self,
        _req: maestro_model::CompletionRequest,
    ) -> anyhow::Result<maestro_model::ResponseStream> {
        use futures::StreamExt;
        let head = futures::stream::iter(vec![Ok(ResponseEvent::TextDelta("Hello".into()))]);
        Ok(Box::pin(head.chain(futures::stream::pending())))
    }
}

/// Minimal HTTP/1.1 tool-proxy stub: counts calls, records bodies, answers a
/// fixed double-wrapped payload.
async fn spawn_proxy(payload: serde_json::Value) -> (String, Arc<AtomicUsize>, Arc<Mutex<Vec<String>>>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let bodies = Arc::new(Mutex::new(Vec::new()));

    let calls2 = Arc::clone(&calls);
    let bodies2 = Arc::clone(&bodies);
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let calls = Arc::clone(&calls2);
            let bodies = Arc::clone(&bodies2);
            let payload = payload.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut tmp = [0u8; 4096];
                let (headers_end, content_length) = loop {
                    let Ok(n) = sock.read(&mut tmp).await else { return };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&tmp[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == &b"\r\n\r\n"[..]) {
                        let headers = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
                        let cl = headers
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        break (pos + 4, cl);
                    }
                };
                while buf.len() < headers_end + content_length {
                    let Ok(n) = sock.read(&mut tmp).await else { return };
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&tmp[..n]);
                }
                bodies
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&buf[headers_end..]).to_string());
                calls.fetch_add(1, Ordering::SeqCst);

                let body = json!({"result": {"result": payload}}).to_string();
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\nx-mcp-proxy-host: pod-test-1\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            });
        }
    });

    (format!("http://{addr}"), calls, bodies)
}

// ─── Harness ─────────────────────────────────────────────────────────────────

struct TestEnv {
    config: Config,
    providers: Vec<Arc<dyn ModelProvider>>,
    store: Arc<InMemoryMessageStore>,
    audit: Arc<MemoryAuditSink>,
    metrics: Arc<MemoryMetricsSink>,
    exact: Arc<ExactCache>,
    semantic: Arc<SemanticCache>,
    embedder: Option<Arc<dyn Embedder>>,
    grants: Vec<(String, String)>,
    code_backend: Option<Arc<dyn CodeExecutionBackend>>,
}

impl TestEnv {
    fn new(provider: Arc<dyn ModelProvider>) -> Self {
        let mut config = Config::default();
        config.pipeline.default_chat_model = Some("gpt-4o".into());
        Self {
            config,
            providers: vec![provider],
            store: Arc::new(InMemoryMessageStore::new()),
            audit: Arc::new(MemoryAuditSink::default()),
            metrics: Arc::new(MemoryMetricsSink::default()),
            exact: Arc::new(ExactCache::new(64)),
            semantic: Arc::new(SemanticCache::new(0.9, 64)),
            embedder: None,
            grants: Vec::new(),
            code_backend: None,
        }
    }

    fn scripted(scripts: Vec<Vec<ResponseEvent>>) -> (Self, Arc<ScriptedProvider>) {
        let provider = Arc::new(ScriptedProvider::new(scripts));
        (Self::new(provider.clone()), provider)
    }

    fn deps(&self) -> CompletionDeps {
        let config = Arc::new(self.config.clone());
        CompletionDeps {
            config: config.clone(),
            providers: Arc::new(maestro_model::ProviderManager::new(self.providers.clone())),
            store: self.store.clone(),
            executor: Arc::new(ToolExecutor::new(self.config.tools.clone()).unwrap()),
            access: Arc::new(ToolAccessPolicy::from_config(&self.config.tools)),
            exact_cache: self.exact.clone(),
            semantic_cache: self.semantic.clone(),
            embedder: self.embedder.clone(),
            scope_access: Arc::new(GrantList(self.grants.clone())),
            audit: self.audit.clone(),
            metrics: self.metrics.clone(),
            code_backend: self.code_backend.clone(),
        }
    }

    fn pipeline(&self) -> ChatPipeline {
        ChatPipeline::new(
            Arc::new(RetrievalStage::new(None, None, None, self.config.rag.clone())),
            Arc::new(NullMemory),
            CompletionStage::new(self.deps()),
        )
    }
}

fn descriptor(server: &str, original: &str, sanitized: &str) -> ToolDescriptor {
    ToolDescriptor {
        server_id: server.into(),
        original_name: original.into(),
        sanitized_name: sanitized.into(),
        schema: ToolSchema {
            name: sanitized.into(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        },
    }
}

fn ctx_for(user: User, message: &str, tools: ToolInventory) -> PipelineContext {
    let mut request = ChatRequest::new(user.id.clone(), message);
    request.session_id = Some(format!("sess-{}", user.id));
    let mut ctx = PipelineContext::new(request, user);
    ctx.tools = tools;
    ctx
}

async fn run(pipeline: &ChatPipeline, ctx: PipelineContext) -> (Result<(), PipelineError>, Vec<ChatEvent>) {
    let (sink, mut rx) = EventSink::channel(1024);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let result = pipeline.handle(ctx, sink, cancel_rx).await;
    drop(cancel_tx);
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (result, events)
}

fn kinds(events: &[ChatEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind()).collect()
}

fn index_of(kinds: &[&str], kind: &str) -> usize {
    kinds
        .iter()
        .position(|k| *k == kind)
        .unwrap_or_else(|| panic!("missing event {kind} in {kinds:?}"))
}

fn tool_call_event(id: &str, name: &str, args: &str) -> ResponseEvent {
    ResponseEvent::ToolCallDelta {
        index: 0,
        id: id.into(),
        name: name.into(),
        arguments: args.into(),
        thought_signature: None,
    }
}

fn usage(prompt: u32, completion: u32) -> ResponseEvent {
    ResponseEvent::Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
    }
}

// ─── S1: pure chat ───────────────────────────────────────────────────────────

#[tokio::test]
async fn s1_pure_chat_streams_and_finalizes() {
    let (env, _provider) = TestEnv::scripted(vec![vec![
        ResponseEvent::TextDelta("Hi".into()),
        ResponseEvent::TextDelta(" there".into()),
        usage(5, 2),
        ResponseEvent::Done,
    ]]);
    let pipeline = env.pipeline();
    let ctx = ctx_for(User::new("u1", "t1"), "Hello", ToolInventory::default());

    let (result, events) = run(&pipeline, ctx).await;
    result.unwrap();

    let ks = kinds(&events);
    // Q1 ordering: saved ≺ stream ≺ updated ≺ complete.
    let saved = index_of(&ks, "message_saved");
    let first_stream = index_of(&ks, "stream");
    let updated = index_of(&ks, "message_updated");
    let complete = index_of(&ks, "completion_complete");
    assert!(saved < first_stream && first_stream < updated && updated < complete);

    let streams: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Stream { content, .. } => Some(content.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(streams, vec!["Hi", " there"]);

    match events.iter().find(|e| e.kind() == "completion_complete") {
        Some(ChatEvent::CompletionComplete {
            tool_calls,
            finish_reason,
            ..
        }) => {
            assert!(tool_calls.is_empty());
            assert_eq!(finish_reason, "stop");
        }
        _ => unreachable!(),
    }

    // Stored row holds the concatenated text.
    let stored = env.store.list_messages("sess-u1").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].as_text(), Some("Hi there"));
    assert_eq!(stored[0].metadata["status"], json!("complete"));

    let metrics = env.metrics.records();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].status, "complete");
    assert_eq!(metrics[0].completion_tokens, 2);
}

// ─── S2: exact cache ─────────────────────────────────────────────────────────

#[tokio::test]
async fn s2_exact_cache_second_request_skips_proxy() {
    let (proxy_url, calls, _bodies) = spawn_proxy(json!(["S-1", "S-2"])).await;

    let scripts = |_: u32| {
        vec![
            vec![tool_call_event("c1", "list_subscriptions", "{}"), ResponseEvent::Done],
            vec![ResponseEvent::TextDelta("done".into()), ResponseEvent::Done],
        ]
    };
    let (mut env, _provider) =
        TestEnv::scripted(scripts(0).into_iter().chain(scripts(1)).collect());
    env.config.tools.proxy_url = Some(proxy_url);
    let pipeline = env.pipeline();

    let inventory = || {
        ToolInventory::new(vec![descriptor(
            "azure",
            "List-Subscriptions",
            "list_subscriptions",
        )])
    };

    // First request dispatches live.
    let (result, events) = run(
        &pipeline,
        ctx_for(User::new("u1", "t1"), "list subs", inventory()),
    )
    .await;
    result.unwrap();
    let ks = kinds(&events);
    let executing = index_of(&ks, "tool_executing");
    let tool_result = index_of(&ks, "tool_result");
    assert!(executing < tool_result, "Q2 bracket order");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Identical second request within TTL is served from the exact tier.
    let (result, events) = run(
        &pipeline,
        ctx_for(User::new("u1", "t1"), "list subs", inventory()),
    )
    .await;
    result.unwrap();
    let ks = kinds(&events);
    assert!(ks.contains(&"tool_cache_hit"));
    assert!(!ks.contains(&"tool_executing"), "cache hit replaces the bracket");
    assert_eq!(calls.load(Ordering::SeqCst), 1, "Q5: no proxy call on hit");

    // Every invocation audited: one live, one cache hit.
    let audits = env.audit.records();
    assert_eq!(audits.len(), 2);
    assert_eq!(audits[0].proxy_host.as_deref(), Some("pod-test-1"));
    assert!(audits[1].error.is_none());
}

// ─── S3: semantic cache with RBAC ────────────────────────────────────────────

#[tokio::test]
async fn s3_semantic_cross_user_hit_and_rbac_miss() {
    let (proxy_url, calls, _bodies) = spawn_proxy(json!(["S-1", "S-2"])).await;

    let round = || {
        vec![
            vec![
                tool_call_event("c1", "list_subscriptions", r#"{"subscription_id": "sub-1"}"#),
                ResponseEvent::Done,
            ],
            vec![ResponseEvent::TextDelta("done".into()), ResponseEvent::Done],
        ]
    };
    let (mut env, _provider) = TestEnv::scripted(
        round().into_iter().chain(round()).chain(round()).collect(),
    );
    env.config.tools.proxy_url = Some(proxy_url);
    env.embedder = Some(Arc::new(ConstEmbedder));
    env.grants = vec![("user-b".into(), "sub-1".into())];
    let pipeline = env.pipeline();

    let inventory = || {
        ToolInventory::new(vec![descriptor(
            "azure",
            "List-Subscriptions",
            "list_subscriptions",
        )])
    };

    // User A populates both tiers with a live execution.
    let (result, _) = run(
        &pipeline,
        ctx_for(User::new("user-a", "tenant-t"), "list my subscriptions", inventory()),
    )
    .await;
    result.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // The semantic write is asynchronous; wait for it to land.
    for _ in 0..100 {
        if !env.semantic.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!env.semantic.is_empty(), "semantic entry must be stored");

    // User B (granted sub-1) gets a cross-user semantic hit.
    let (result, events) = run(
        &pipeline,
        ctx_for(User::new("user-b", "tenant-t"), "show subscriptions please", inventory()),
    )
    .await;
    result.unwrap();
    match events
        .iter()
        .find(|e| e.kind() == "tool_semantic_cache_hit")
        .expect("user B must hit the semantic tier")
    {
        ChatEvent::ToolSemanticCacheHit {
            cross_user,
            similarity,
            resource_scope,
            ..
        } => {
            assert!(*cross_user);
            assert!(*similarity >= 0.9);
            assert_eq!(resource_scope.as_deref(), Some("sub-1"));
        }
        _ => unreachable!(),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1, "no proxied call for user B");

    // User C (no grant) misses and dispatches live.
    let (result, events) = run(
        &pipeline,
        ctx_for(User::new("user-c", "tenant-t"), "show subscriptions please", inventory()),
    )
    .await;
    result.unwrap();
    let ks = kinds(&events);
    assert!(!ks.contains(&"tool_semantic_cache_hit"), "Q6: RBAC denial is a miss");
    assert!(ks.contains(&"tool_executing"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ─── S4: access denial inside the tool loop ──────────────────────────────────

#[tokio::test]
async fn s4_denied_tool_produces_no_bracket_but_feeds_the_model() {
    let (proxy_url, calls, _bodies) = spawn_proxy(json!({"accounts": []})).await;

    let (mut env, _provider) = TestEnv::scripted(vec![
        vec![
            ResponseEvent::ToolCallDelta {
                index: 0,
                id: "c1".into(),
                name: "list_accounts".into(),
                arguments: "{}".into(),
                thought_signature: None,
            },
            ResponseEvent::ToolCallDelta {
                index: 1,
                id: "c2".into(),
                name: "delete_vm".into(),
                arguments: r#"{"vm": "web-1"}"#.into(),
                thought_signature: None,
            },
            ResponseEvent::Done,
        ],
        vec![ResponseEvent::TextDelta("handled".into()), ResponseEvent::Done],
    ]);
    env.config.tools.proxy_url = Some(proxy_url);
    env.config.tools.deny_tools = vec!["*/delete_vm".into()];

    let inventory = ToolInventory::new(vec![
        descriptor("aws", "list-accounts", "list_accounts"),
        descriptor("azure", "delete-vm", "delete_vm"),
    ]);

    // Drive the completion stage directly so the finished context can be
    // inspected for message well-formedness.
    let stage = CompletionStage::new(env.deps());
    let mut ctx = ctx_for(User::new("u1", "t1"), "clean up", inventory);
    ctx.prepared_messages = crate::prompts::build_prepared_messages(&ctx);

    let (sink, mut rx) = EventSink::channel(1024);
    let (cancel_tx, mut cancel_rx) = oneshot::channel();
    stage.run(&mut ctx, &sink, &mut cancel_rx).await.unwrap();
    drop(cancel_tx);
    drop(sink);
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }

    let ks = kinds(&events);
    // Exactly one bracket pair — for the allowed tool only.
    assert_eq!(ks.iter().filter(|k| **k == "tool_executing").count(), 1);
    assert_eq!(ks.iter().filter(|k| **k == "tool_result").count(), 1);
    assert!(ks.contains(&"completion_complete"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Q3: assistant-with-calls, then one tool message per call (matched by
    // id, in order), then nothing but the final assistant text round.
    let assistant_idx = ctx
        .prepared_messages
        .iter()
        .position(|m| !m.tool_calls.is_empty())
        .unwrap();
    let assistant = &ctx.prepared_messages[assistant_idx];
    assert_eq!(assistant.tool_calls.len(), 2);
    let tool_msgs: Vec<&Message> = ctx.prepared_messages[assistant_idx + 1..]
        .iter()
        .take(2)
        .collect();
    assert_eq!(tool_msgs[0].tool_call_id.as_deref(), Some("c1"));
    assert_eq!(tool_msgs[1].tool_call_id.as_deref(), Some("c2"));
    assert!(tool_msgs[1]
        .as_text()
        .unwrap()
        .contains("access denied"));

    // Both invocations audited, the denial with its error.
    let audits = env.audit.records();
    assert_eq!(audits.len(), 2);
    assert!(audits.iter().any(|a| a
        .error
        .as_deref()
        .map(|e| e.contains("access denied"))
        .unwrap_or(false)));
}

// ─── S5: schema-limit retry ──────────────────────────────────────────────────

fn wide_inventory(n: usize) -> ToolInventory {
    ToolInventory::new(
        (0..n)
            .map(|i| descriptor("srv", &format!("tool-{i}"), &format!("tool_{i}")))
            .collect(),
    )
}

#[tokio::test]
async fn s5_schema_limit_halves_tools_until_accepted() {
    let provider = Arc::new(ScriptedProvider::always_text("ok").with_max_tools(70));
    let env = TestEnv::new(provider.clone());
    let pipeline = env.pipeline();

    let (result, events) = run(
        &pipeline,
        ctx_for(User::new("u1", "t1"), "go", wide_inventory(130)),
    )
    .await;
    result.unwrap();

    let warnings: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Warning { code, .. } => Some(code.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(warnings, vec!["TOOL_LIMIT_EXCEEDED"]);

    // 130 shaped to the 127 cap, rejected, halved to 63, accepted.
    let requests = provider.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].tools.len(), 63);
}

#[tokio::test]
async fn s5_schema_limit_exhausts_retries_and_fails() {
    let provider = Arc::new(ScriptedProvider::always_text("ok").with_max_tools(10));
    let env = TestEnv::new(provider);
    let pipeline = env.pipeline();

    let (result, events) = run(
        &pipeline,
        ctx_for(User::new("u1", "t1"), "go", wide_inventory(130)),
    )
    .await;
    assert!(result.is_err());

    let ks = kinds(&events);
    // Q8: at most two retries, a warning for each, then the error surfaces.
    assert_eq!(ks.iter().filter(|k| **k == "warning").count(), 2);
    assert!(ks.contains(&"completion_error"));
    assert!(!ks.contains(&"completion_complete"));
}

// ─── S6: provider failover ───────────────────────────────────────────────────

#[tokio::test]
async fn s6_failover_emitted_once_before_first_stream_chunk() {
    let scripted: Arc<dyn ModelProvider> = Arc::new(ScriptedProvider::always_text("hi"));
    let mut env = TestEnv::new(Arc::new(FailingProvider::new("primary", "upstream 503")));
    env.providers.push(scripted);
    let pipeline = env.pipeline();

    let (result, events) = run(
        &pipeline,
        ctx_for(User::new("u1", "t1"), "hello", ToolInventory::default()),
    )
    .await;
    result.unwrap();

    let ks = kinds(&events);
    assert_eq!(
        ks.iter().filter(|k| **k == "provider_failover").count(),
        1,
        "Q9: at most one failover event"
    );
    assert!(index_of(&ks, "provider_failover") < index_of(&ks, "stream"));

    match events.iter().find(|e| e.kind() == "provider_failover").unwrap() {
        ChatEvent::ProviderFailover {
            occurred,
            original_provider,
            failover_provider,
            ..
        } => {
            assert!(*occurred);
            assert_eq!(original_provider, "primary");
            assert_eq!(failover_provider, "scripted");
        }
        _ => unreachable!(),
    }
}

// ─── Tool loop: round cap and forced final ───────────────────────────────────

#[tokio::test]
async fn round_cap_forces_tool_free_final_stream() {
    let (proxy_url, _calls, _bodies) = spawn_proxy(json!("ok")).await;

    let tool_round = vec![tool_call_event("c1", "get_status", "{}"), ResponseEvent::Done];
    let (mut env, provider) = TestEnv::scripted(vec![
        tool_round.clone(),
        tool_round,
        vec![ResponseEvent::TextDelta("wrapped up".into()), ResponseEvent::Done],
    ]);
    env.config.tools.proxy_url = Some(proxy_url);
    env.config.pipeline.max_tool_rounds = 2;
    let pipeline = env.pipeline();

    let inventory = ToolInventory::new(vec![descriptor("srv", "get-status", "get_status")]);
    let (result, events) = run(&pipeline, ctx_for(User::new("u1", "t1"), "check", inventory)).await;
    result.unwrap();

    assert!(kinds(&events).contains(&"completion_complete"));
    let requests = provider.requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    assert!(!requests[0].tools.is_empty());
    assert!(!requests[1].tools.is_empty());
    assert!(requests[2].tools.is_empty(), "forced final goes out tool-free");
}

// ─── Q7: name resolution round-trip ──────────────────────────────────────────

#[tokio::test]
async fn invented_name_dispatches_with_inventory_original() {
    let (proxy_url, _calls, bodies) = spawn_proxy(json!([])).await;

    let (mut env, _provider) = TestEnv::scripted(vec![
        // The model invents a dashed variant of the sanitized name.
        vec![tool_call_event("c1", "list-subscriptions", "{}"), ResponseEvent::Done],
        vec![ResponseEvent::TextDelta("done".into()), ResponseEvent::Done],
    ]);
    env.config.tools.proxy_url = Some(proxy_url);
    let pipeline = env.pipeline();

    let inventory = ToolInventory::new(vec![descriptor(
        "azure",
        "List-Subscriptions",
        "list_subscriptions",
    )]);
    let (result, _) = run(&pipeline, ctx_for(User::new("u1", "t1"), "subs", inventory)).await;
    result.unwrap();

    let bodies = bodies.lock().unwrap();
    assert_eq!(bodies.len(), 1);
    let body: serde_json::Value = serde_json::from_str(&bodies[0]).unwrap();
    assert_eq!(body["tool"], "List-Subscriptions");
    assert_eq!(body["server"], "azure");
}

// ─── Code tools ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn code_tool_runs_on_backend_and_records_execution() {
    let (mut env, _provider) = TestEnv::scripted(vec![
        vec![tool_call_event("c1", "code_run", r#"{"source": "print(1)"}"#), ResponseEvent::Done],
        vec![tool_call_event("c2", "code_run", r#"{"source": "print(2)"}"#), ResponseEvent::Done],
        vec![ResponseEvent::TextDelta("ran".into()), ResponseEvent::Done],
    ]);
    env.code_backend = Some(Arc::new(StubCodeBackend));
    env.config.pipeline.max_tool_rounds = 4;

    let inventory = ToolInventory::new(vec![descriptor("tools", "code-run", "code_run")]);
    let stage = CompletionStage::new(env.deps());
    let mut ctx = ctx_for(User::new("u1", "t1"), "run it", inventory);
    ctx.prepared_messages = crate::prompts::build_prepared_messages(&ctx);

    let (sink, mut rx) = EventSink::channel(1024);
    let (cancel_tx, mut cancel_rx) = oneshot::channel();
    stage.run(&mut ctx, &sink, &mut cancel_rx).await.unwrap();
    drop(cancel_tx);
    drop(sink);

    // Session attached once, reused across rounds; both executions recorded.
    assert_eq!(ctx.code_execution.session_id.as_deref(), Some("code-u1-sess-u1"));
    assert_eq!(ctx.code_execution.executions.len(), 2);
    assert!(ctx.code_execution.executions.iter().all(|e| e.success));

    let mut saw_result = 0;
    while let Ok(e) = rx.try_recv() {
        if e.kind() == "tool_result" {
            saw_result += 1;
        }
    }
    assert_eq!(saw_result, 2);
}

// ─── Placeholder fallback and failure persistence ────────────────────────────

#[tokio::test]
async fn placeholder_write_failure_falls_back_to_optimistic() {
    let (env, _provider) = TestEnv::scripted(vec![vec![
        ResponseEvent::TextDelta("hello".into()),
        ResponseEvent::Done,
    ]]);
    env.store.set_fail_writes(true);
    let pipeline = env.pipeline();

    let (result, events) = run(
        &pipeline,
        ctx_for(User::new("u1", "t1"), "hi", ToolInventory::default()),
    )
    .await;
    result.unwrap();

    match events.iter().find(|e| e.kind() == "message_saved").unwrap() {
        ChatEvent::MessageSaved {
            source,
            confirmed,
            message_id,
            ..
        } => {
            assert_eq!(*source, EventSource::Optimistic);
            assert!(!confirmed);
            assert!(message_id.starts_with("assistant_"));
        }
        _ => unreachable!(),
    }
    // No durable row, so no message_updated; the stream still completes.
    let ks = kinds(&events);
    assert!(!ks.contains(&"message_updated"));
    assert!(ks.contains(&"completion_complete"));
}

#[tokio::test]
async fn provider_failure_leaves_explanatory_row() {
    let env = TestEnv::new(Arc::new(FailingProvider::new("only", "connection refused")));
    let pipeline = env.pipeline();

    let (result, events) = run(
        &pipeline,
        ctx_for(User::new("u1", "t1"), "hi", ToolInventory::default()),
    )
    .await;
    assert!(result.is_err());

    let ks = kinds(&events);
    assert!(ks.contains(&"completion_error"));
    assert!(!ks.contains(&"completion_complete"));

    // Never an empty assistant row without a marker.
    let stored = env.store.list_messages("sess-u1").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].as_text().unwrap().contains("unable to complete"));
    assert_eq!(stored[0].metadata["status"], json!("error"));

    let metrics = env.metrics.records();
    assert_eq!(metrics[0].status, "error");
}

// ─── Q10: cancellation ───────────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_stops_events_and_marks_row_interrupted() {
    let env = TestEnv::new(Arc::new(HangingProvider));
    let pipeline = Arc::new(env.pipeline());

    let (sink, mut rx) = EventSink::channel(1024);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let ctx = ctx_for(User::new("u1", "t1"), "hi", ToolInventory::default());

    let task = tokio::spawn({
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.handle(ctx, sink, cancel_rx).await }
    });

    // Wait for the first streamed chunk, then interrupt.
    let mut placeholder_id = String::new();
    loop {
        match rx.recv().await.expect("stream must start") {
            ChatEvent::MessageSaved { message_id, .. } => placeholder_id = message_id,
            ChatEvent::Stream { .. } => break,
            _ => {}
        }
    }
    cancel_tx.send(()).unwrap();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(PipelineError::Cancelled)));

    // No terminal or tool events after cancellation.
    let mut trailing = Vec::new();
    while let Ok(e) = rx.try_recv() {
        trailing.push(e.kind());
    }
    assert!(!trailing.contains(&"completion_complete"));
    assert!(!trailing.contains(&"completion_error"));
    assert!(!trailing.contains(&"stream"));

    // The durable row keeps the partial text and is marked interrupted.
    let row = env.store.get(&placeholder_id).expect("placeholder exists");
    assert_eq!(row.as_text(), Some("Hello"));
    assert_eq!(row.metadata["status"], json!("interrupted"));

    let metrics = env.metrics.records();
    assert_eq!(metrics[0].status, "interrupted");
}

// ─── Reasoning deltas ────────────────────────────────────────────────────────

#[tokio::test]
async fn reasoning_deltas_stream_separately_and_persist() {
    let (env, _provider) = TestEnv::scripted(vec![vec![
        ResponseEvent::ReasoningDelta("step one; ".into()),
        ResponseEvent::ReasoningDelta("step two".into()),
        ResponseEvent::TextDelta("Answer".into()),
        ResponseEvent::Done,
    ]]);
    let pipeline = env.pipeline();

    let (result, events) = run(
        &pipeline,
        ctx_for(User::new("u1", "t1"), "think hard", ToolInventory::default()),
    )
    .await;
    result.unwrap();

    let thinking: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ChatEvent::Thinking { content, accumulated, .. } => {
                Some((content.clone(), accumulated.clone()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(thinking.len(), 2);
    assert_eq!(thinking[1].1, "step one; step two");

    match events.iter().find(|e| e.kind() == "message_updated").unwrap() {
        ChatEvent::MessageUpdated {
            content,
            thinking_content,
            ..
        } => {
            assert_eq!(content, "Answer");
            assert_eq!(thinking_content.as_deref(), Some("step one; step two"));
        }
        _ => unreachable!(),
    }

    let stored = env.store.list_messages("sess-u1").await.unwrap();
    assert_eq!(stored[0].metadata["thinkingContent"], json!("step one; step two"));
}

// ─── History chronology (Q4) ─────────────────────────────────────────────────

#[tokio::test]
async fn history_is_loaded_in_chronological_order() {
    let (env, provider) = TestEnv::scripted(vec![vec![
        ResponseEvent::TextDelta("next".into()),
        ResponseEvent::Done,
    ]]);

    // Seed history out of order with a timestamp tie.
    let now = chrono::Utc::now();
    let mut q = Message::user("first question");
    q.timestamp = now;
    let mut a = Message::assistant("tied answer");
    a.timestamp = now;
    env.store.add_message("sess-u1", &q).await.unwrap();
    env.store.add_message("sess-u1", &a).await.unwrap();

    let pipeline = env.pipeline();
    let (result, _) = run(
        &pipeline,
        ctx_for(User::new("u1", "t1"), "continue", ToolInventory::default()),
    )
    .await;
    result.unwrap();

    let requests = provider.requests.lock().unwrap();
    let msgs = &requests[0].messages;
    // system, assistant (tie winner), user, new user turn.
    let roles: Vec<_> = msgs.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            maestro_model::Role::System,
            maestro_model::Role::Assistant,
            maestro_model::Role::User,
            maestro_model::Role::User,
        ]
    );
}
