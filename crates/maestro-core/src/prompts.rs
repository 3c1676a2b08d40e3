// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Prepared-message assembly: folds retrieved knowledge and tiered memories
//! into the system context ahead of the conversation history and user turn.

use maestro_model::{ContentPart, Message};

use crate::context::PipelineContext;

const BASE_PROMPT: &str = "You are a helpful assistant with access to tools. \
Use the provided context when it is relevant; say so when it is not.";

/// Build the message list sent to the provider: system context (base prompt,
/// knowledge, memories), then session history, then the new user turn.
pub fn build_prepared_messages(ctx: &PipelineContext) -> Vec<Message> {
    let mut system = String::from(BASE_PROMPT);

    if let Some(rag) = &ctx.rag {
        let mut section = String::new();
        for item in rag.docs.iter().chain(&rag.artifacts) {
            section.push_str("\n- ");
            section.push_str(item.content.trim());
        }
        if !rag.chats.is_empty() {
            section.push_str("\n\nRelated prior conversations:");
            for item in &rag.chats {
                section.push_str("\n- ");
                section.push_str(item.content.trim());
            }
        }
        if !section.is_empty() {
            system.push_str("\n\n## Retrieved context\n");
            system.push_str(&section);
        }
    }

    if let Some(memories) = &ctx.memories {
        if !memories.is_empty() {
            system.push_str("\n\n## Memory");
            for m in memories
                .short_term_summaries
                .iter()
                .chain(&memories.domain_knowledge)
                .chain(&memories.semantic_matches)
            {
                system.push_str("\n- ");
                system.push_str(m.trim());
            }
        }
    }

    let mut prepared = Vec::with_capacity(ctx.messages.len() + 2);
    prepared.push(Message::system(system));
    prepared.extend(ctx.messages.iter().cloned());
    prepared.push(user_turn(ctx));
    prepared
}

fn user_turn(ctx: &PipelineContext) -> Message {
    if ctx.request.attachments.is_empty() {
        Message::user(&ctx.request.message)
    } else {
        let mut parts = vec![ContentPart::Text {
            text: ctx.request.message.clone(),
        }];
        parts.extend(ctx.request.attachments.iter().cloned());
        Message::user_with_parts(parts)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
