// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{provider::ResponseStream, CompletionRequest, ResponseEvent};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<ResponseEvent>> = vec![
            Ok(ResponseEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseEvent::Usage {
                prompt_tokens: 10,
                completion_tokens: 10,
            }),
            Ok(ResponseEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted provider.  Each `complete` call pops the next response
/// script from the front of the queue, letting tests specify exact event
/// sequences — tool calls, reasoning deltas, usage — without network access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<Vec<ResponseEvent>>>,
    /// Every request seen, in order.  Tests inspect tool counts per attempt.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
    /// When set, any request carrying more tool schemas than this is rejected
    /// with a schema-complexity error instead of consuming a script.
    max_tools: Option<usize>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<ResponseEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            requests: Arc::new(Mutex::new(Vec::new())),
            max_tools: None,
        }
    }

    /// Reject requests with more than `n` tool schemas, mimicking a provider
    /// that enforces a hard schema-surface limit.
    pub fn with_max_tools(mut self, n: usize) -> Self {
        self.max_tools = Some(n);
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            ResponseEvent::TextDelta(r),
            ResponseEvent::Usage {
                prompt_tokens: 5,
                completion_tokens: 5,
            },
            ResponseEvent::Done,
        ]])
    }

    /// Convenience: one round emitting a tool call, then a text round.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                ResponseEvent::ToolCallDelta {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                    thought_signature: None,
                },
                ResponseEvent::Done,
            ],
            vec![
                ResponseEvent::TextDelta(final_text.into()),
                ResponseEvent::Done,
            ],
        ])
    }

    /// Number of `complete` calls that actually consumed a script.
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        if let Some(max) = self.max_tools {
            if req.tools.len() > max {
                anyhow::bail!("too many states for serving: {} tools", req.tools.len());
            }
        }
        self.requests.lock().unwrap().push(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![
                    ResponseEvent::TextDelta("[no more scripts]".into()),
                    ResponseEvent::Done,
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<ResponseEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

/// Provider whose `complete` always fails with a fixed message.  Used to
/// exercise failover and error-classification paths.
pub struct FailingProvider {
    name: String,
    error: String,
}

impl FailingProvider {
    pub fn new(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for FailingProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        anyhow::bail!("{}", self.error)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
