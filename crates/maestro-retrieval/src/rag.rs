// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Retrieval stage: parallel lookup across the document store, prior-chat
//! store, and user-artifact store.  Sub-queries fail independently; a failed
//! sub-query degrades to an empty sub-result and the request continues.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, warn};

use maestro_config::RagConfig;
use maestro_model::User;

/// One retrieved snippet with its relevance score in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct KnowledgeItem {
    pub content: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub score: f32,
}

impl KnowledgeItem {
    pub fn new(content: impl Into<String>, score: f32) -> Self {
        Self {
            content: content.into(),
            metadata: serde_json::Map::new(),
            score,
        }
    }
}

/// Joined and filtered output of the retrieval fan-out.
#[derive(Debug, Clone, Default)]
pub struct RetrievedKnowledge {
    pub docs: Vec<KnowledgeItem>,
    pub chats: Vec<KnowledgeItem>,
    pub artifacts: Vec<KnowledgeItem>,
    pub retrieval_ms: u64,
    pub total_results: usize,
    pub collections: Vec<String>,
}

impl RetrievedKnowledge {
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty() && self.chats.is_empty() && self.artifacts.is_empty()
    }
}

#[async_trait]
pub trait DocumentSearch: Send + Sync {
    async fn search(
        &self,
        query: &str,
        collections: &[String],
        limit: usize,
    ) -> anyhow::Result<Vec<KnowledgeItem>>;

    /// Collections this backend serves, reported in `rag_status`.
    fn collections(&self) -> Vec<String>;
}

#[async_trait]
pub trait ChatSearch: Send + Sync {
    /// `user_filter = None` searches across all users (admin only).
    async fn search(
        &self,
        query: &str,
        user_filter: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<KnowledgeItem>>;
}

#[async_trait]
pub trait ArtifactSearch: Send + Sync {
    async fn search(
        &self,
        query: &str,
        user_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<KnowledgeItem>>;
}

pub struct RetrievalStage {
    docs: Option<Arc<dyn DocumentSearch>>,
    chats: Option<Arc<dyn ChatSearch>>,
    artifacts: Option<Arc<dyn ArtifactSearch>>,
    config: RagConfig,
}

impl RetrievalStage {
    pub fn new(
        docs: Option<Arc<dyn DocumentSearch>>,
        chats: Option<Arc<dyn ChatSearch>>,
        artifacts: Option<Arc<dyn ArtifactSearch>>,
        config: RagConfig,
    ) -> Self {
        Self {
            docs,
            chats,
            artifacts,
            config,
        }
    }

    pub fn has_backends(&self) -> bool {
        self.docs.is_some() || self.chats.is_some() || self.artifacts.is_some()
    }

    /// Fan out, join, filter.  Returns `None` when the stage is skipped or
    /// nothing relevant was found.
    pub async fn retrieve(&self, user_message: &str, user: &User) -> Option<RetrievedKnowledge> {
        if !self.config.enabled {
            return None;
        }
        if !self.has_backends() {
            debug!("no retrieval backend available; skipping RAG stage");
            return None;
        }
        let start = Instant::now();

        // Non-admin users get half the documentation budget.
        let doc_budget = if user.is_admin {
            self.config.max_docs
        } else {
            (self.config.max_docs / 2).max(1)
        };
        let anonymous = user.id.is_empty();

        let docs_fut = async {
            match &self.docs {
                Some(backend) => backend
                    .search(user_message, &self.config.collections, doc_budget)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "doc retrieval failed");
                        Vec::new()
                    }),
                None => Vec::new(),
            }
        };
        let chats_fut = async {
            match &self.chats {
                Some(backend) => {
                    let filter = if user.is_admin {
                        None
                    } else {
                        Some(user.id.as_str())
                    };
                    backend
                        .search(user_message, filter, self.config.max_chats)
                        .await
                        .unwrap_or_else(|e| {
                            warn!(error = %e, "chat retrieval failed");
                            Vec::new()
                        })
                }
                None => Vec::new(),
            }
        };
        let artifacts_fut = async {
            match &self.artifacts {
                Some(backend) if self.config.enable_artifact_search && !anonymous => backend
                    .search(user_message, &user.id, self.config.max_artifacts)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "artifact retrieval failed");
                        Vec::new()
                    }),
                _ => Vec::new(),
            }
        };

        let (docs, chats, artifacts) = tokio::join!(docs_fut, chats_fut, artifacts_fut);

        let min = self.config.min_relevance_score;
        let docs = finalize(docs, doc_budget, min);
        let chats = finalize(chats, self.config.max_chats, min);
        let artifacts = finalize(artifacts, self.config.max_artifacts, min);

        let knowledge = RetrievedKnowledge {
            total_results: docs.len() + chats.len() + artifacts.len(),
            collections: self
                .docs
                .as_ref()
                .map(|d| d.collections())
                .unwrap_or_default(),
            retrieval_ms: start.elapsed().as_millis() as u64,
            docs,
            chats,
            artifacts,
        };

        if knowledge.is_empty() {
            None
        } else {
            Some(knowledge)
        }
    }
}

/// Sort by score descending, truncate to the cap, drop below-threshold items,
/// and dedupe identical content.
fn finalize(mut items: Vec<KnowledgeItem>, cap: usize, min_score: f32) -> Vec<KnowledgeItem> {
    items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    items.truncate(cap);
    items.retain(|i| i.score >= min_score);
    let mut seen = std::collections::HashSet::new();
    items.retain(|i| seen.insert(i.content.clone()));
    items
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
