// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

/// Tiered memories supplied by the external memory collaborator.
/// The completion stage treats these as opaque additions to system context.
#[derive(Debug, Clone, Default)]
pub struct TieredMemories {
    pub short_term_summaries: Vec<String>,
    pub domain_knowledge: Vec<String>,
    pub semantic_matches: Vec<String>,
}

impl TieredMemories {
    pub fn is_empty(&self) -> bool {
        self.short_term_summaries.is_empty()
            && self.domain_knowledge.is_empty()
            && self.semantic_matches.is_empty()
    }
}

/// Contract of the memory collaborator.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn recall(
        &self,
        user_id: &str,
        session_id: Option<&str>,
        query: &str,
    ) -> anyhow::Result<TieredMemories>;
}

/// No-op provider for deployments without a memory service.
#[derive(Default)]
pub struct NullMemory;

#[async_trait]
impl MemoryProvider for NullMemory {
    async fn recall(
        &self,
        _user_id: &str,
        _session_id: Option<&str>,
        _query: &str,
    ) -> anyhow::Result<TieredMemories> {
        Ok(TieredMemories::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_memory_recalls_nothing() {
        let m = NullMemory;
        let memories = m.recall("u1", None, "query").await.unwrap();
        assert!(memories.is_empty());
    }
}
