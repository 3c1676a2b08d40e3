// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Local smoke harness for the orchestration core.
//!
//! Runs one completion through the full pipeline — retrieval, memory,
//! placeholder write, stream parsing, finalization — against the mock
//! provider, printing every client event as one JSON line.  The real HTTP
//! ingress lives in the outer service; this binary exists so the pipeline
//! can be exercised and inspected without it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use maestro_core::{
    ChatPipeline, ChatRequest, CompletionDeps, CompletionStage, EventSink, InMemoryMessageStore,
    PipelineContext, TracingMetricsSink,
};
use maestro_model::{MockProvider, ProviderManager, User};
use maestro_retrieval::{NullMemory, RetrievalStage};
use maestro_tools::{ToolAccessPolicy, ToolExecutor, TracingAuditSink};

#[derive(Parser)]
#[command(name = "maestro", about = "Chat completion orchestration core (dev harness)")]
struct Cli {
    /// Explicit config file (merged on top of the standard search paths)
    #[arg(long)]
    config: Option<PathBuf>,

    /// The user message to complete
    #[arg(long)]
    message: String,

    /// Acting user id
    #[arg(long, default_value = "dev-user")]
    user: String,

    /// Tenant the user belongs to
    #[arg(long, default_value = "dev-tenant")]
    tenant: String,

    /// Session to attach the exchange to
    #[arg(long)]
    session: Option<String>,

    /// Explicit model override
    #[arg(long)]
    model: Option<String>,

    /// Run with admin privileges (full retrieval budgets, RBAC bypass)
    #[arg(long)]
    admin: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = maestro_config::load(cli.config.as_deref())?;
    if config.pipeline.default_chat_model.is_none() {
        config.pipeline.default_chat_model = Some("mock-model".into());
    }
    let config = Arc::new(config);

    let deps = CompletionDeps {
        config: config.clone(),
        providers: Arc::new(ProviderManager::single(Arc::new(MockProvider))),
        store: Arc::new(InMemoryMessageStore::new()),
        executor: Arc::new(ToolExecutor::new(config.tools.clone())?),
        access: Arc::new(ToolAccessPolicy::from_config(&config.tools)),
        exact_cache: Arc::new(maestro_cache::ExactCache::new(config.cache.exact_capacity)),
        semantic_cache: Arc::new(maestro_cache::SemanticCache::new(
            config.cache.semantic_similarity_min,
            1024,
        )),
        embedder: None,
        scope_access: Arc::new(DenyAllScopes),
        audit: Arc::new(TracingAuditSink),
        metrics: Arc::new(TracingMetricsSink),
        code_backend: None,
    };
    let pipeline = ChatPipeline::new(
        Arc::new(RetrievalStage::new(None, None, None, config.rag.clone())),
        Arc::new(NullMemory),
        CompletionStage::new(deps),
    );

    let user = if cli.admin {
        User::admin(cli.user, cli.tenant)
    } else {
        User::new(cli.user, cli.tenant)
    };
    let mut request = ChatRequest::new(user.id.clone(), cli.message);
    request.session_id = cli.session;
    request.model = cli.model;
    let ctx = PipelineContext::new(request, user);

    let (sink, mut rx) = EventSink::channel(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => eprintln!("event serialization failed: {e}"),
            }
        }
    });

    let (_cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
    let result = pipeline.handle(ctx, sink, cancel_rx).await;
    printer.await?;
    result?;
    Ok(())
}

/// The harness has no tenant policy service; scoped semantic entries are
/// simply never shared.
struct DenyAllScopes;

#[async_trait::async_trait]
impl maestro_cache::ScopeAccess for DenyAllScopes {
    async fn can_access(&self, _user: &User, _scope: &str) -> bool {
        false
    }
}
