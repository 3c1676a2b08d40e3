// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::warn;

use maestro_retrieval::{MemoryProvider, RetrievalStage};

use crate::completion::CompletionStage;
use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::events::{ChatEvent, EventSink};
use crate::prompts::build_prepared_messages;

/// The full request pipeline: retrieval, memory, prepared-message assembly,
/// then the completion stage.  Stages run sequentially on the request task;
/// only the completion stage can fail the request.
pub struct ChatPipeline {
    retrieval: Arc<RetrievalStage>,
    memory: Arc<dyn MemoryProvider>,
    completion: CompletionStage,
}

impl ChatPipeline {
    pub fn new(
        retrieval: Arc<RetrievalStage>,
        memory: Arc<dyn MemoryProvider>,
        completion: CompletionStage,
    ) -> Self {
        Self {
            retrieval,
            memory,
            completion,
        }
    }

    /// Run one request to completion.  The caller owns the context (tool
    /// inventory, auth, pipeline model) and the receiving end of the sink.
    ///
    /// Cancellation closes the stream cleanly: no `completion_error` and no
    /// further events.  Every other failure emits `completion_error` before
    /// returning it.
    pub async fn handle(
        &self,
        mut ctx: PipelineContext,
        sink: EventSink,
        mut cancel: oneshot::Receiver<()>,
    ) -> Result<(), PipelineError> {
        // Session history feeds prepared-message assembly.  A store failure
        // degrades to an empty history rather than failing the request.
        if let Some(session_id) = ctx.request.session_id.clone() {
            match self
                .completion
                .deps()
                .store
                .list_messages(&session_id)
                .await
            {
                Ok(history) => {
                    for msg in history {
                        ctx.push_message(msg);
                    }
                }
                Err(e) => warn!(error = %e, "history load failed"),
            }
        }

        // Retrieval stage.  Emits `rag_status` only when something was found.
        if ctx.request.enable_rag {
            if let Some(knowledge) = self
                .retrieval
                .retrieve(&ctx.request.message, &ctx.user)
                .await
            {
                let _ = sink
                    .emit(ChatEvent::RagStatus {
                        docs_retrieved: knowledge.docs.len(),
                        chats_retrieved: knowledge.chats.len(),
                        artifacts_retrieved: knowledge.artifacts.len(),
                        collections: knowledge.collections.clone(),
                        retrieval_time: knowledge.retrieval_ms,
                    })
                    .await;
                ctx.rag = Some(knowledge);
            }
        }

        // Memory stage: opaque additions from the external collaborator.
        match self
            .memory
            .recall(
                &ctx.user.id,
                ctx.request.session_id.as_deref(),
                &ctx.request.message,
            )
            .await
        {
            Ok(memories) if !memories.is_empty() => ctx.memories = Some(memories),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "memory recall failed"),
        }

        ctx.prepared_messages = build_prepared_messages(&ctx);

        match self.completion.run(&mut ctx, &sink, &mut cancel).await {
            Ok(()) => Ok(()),
            Err(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) => {
                let _ = sink
                    .emit(ChatEvent::CompletionError {
                        error: e.to_string(),
                        stage: Some(e.stage().to_string()),
                    })
                    .await;
                Err(e)
            }
        }
    }
}
