// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;
use tracing::debug;

use maestro_model::{ToolCall, ToolSchema};

/// One tool a user may call this turn.  The model sees `sanitized_name`; the
/// tool-proxy expects `original_name` on `server_id`.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub server_id: String,
    pub original_name: String,
    pub sanitized_name: String,
    pub schema: ToolSchema,
}

/// A tool call resolved against the inventory, ready for dispatch.
#[derive(Debug, Clone)]
pub struct ResolvedToolCall {
    pub tool_call_id: String,
    pub server_id: String,
    pub original_name: String,
    pub normalized_name: String,
    pub arguments: Value,
}

/// The per-turn tool inventory, ordered by the relevance the retrieval-tool
/// stage assigned.
#[derive(Debug, Clone, Default)]
pub struct ToolInventory {
    tools: Vec<ToolDescriptor>,
}

impl ToolInventory {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self { tools }
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Schemas in inventory order, for the provider request.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema.clone()).collect()
    }

    /// Map a model-emitted call onto the inventory.
    ///
    /// Resolution rules, best score wins (ties broken lexicographically by
    /// sanitized name), minimum score 0.3:
    /// 1. exact match on the sanitized name,
    /// 2. normalized equality (lowercase, `-`→`_`, strip other punctuation),
    /// 3. substring containment either direction, scored by length ratio,
    /// 4. token-overlap similarity of at least 0.5.
    ///
    /// An unmatched name is passed through unchanged so the proxy can reject
    /// it with a clear error instead of the pipeline guessing.
    pub fn resolve(&self, call: &ToolCall) -> ResolvedToolCall {
        if let Some(t) = self.tools.iter().find(|t| t.sanitized_name == call.name) {
            return self.resolved(call, t);
        }

        let wanted_norm = normalize(&call.name);
        let mut best: Option<(f32, &ToolDescriptor)> = None;
        for t in &self.tools {
            let score = match_score(&call.name, &wanted_norm, t);
            if score <= 0.3 {
                continue;
            }
            best = match best {
                Some((s, prev)) if score < s => Some((s, prev)),
                Some((s, prev))
                    if (score - s).abs() < f32::EPSILON
                        && prev.sanitized_name <= t.sanitized_name =>
                {
                    Some((s, prev))
                }
                _ => Some((score, t)),
            };
        }

        match best {
            Some((score, t)) => {
                debug!(
                    wanted = %call.name,
                    matched = %t.sanitized_name,
                    score,
                    "resolved invented tool name"
                );
                self.resolved(call, t)
            }
            None => ResolvedToolCall {
                tool_call_id: call.id.clone(),
                server_id: String::new(),
                original_name: call.name.clone(),
                normalized_name: wanted_norm,
                arguments: call.arguments.clone(),
            },
        }
    }

    fn resolved(&self, call: &ToolCall, t: &ToolDescriptor) -> ResolvedToolCall {
        ResolvedToolCall {
            tool_call_id: call.id.clone(),
            server_id: t.server_id.clone(),
            original_name: t.original_name.clone(),
            normalized_name: t.sanitized_name.clone(),
            arguments: call.arguments.clone(),
        }
    }
}

fn normalize(name: &str) -> String {
    name.to_lowercase()
        .replace('-', "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

fn match_score(wanted: &str, wanted_norm: &str, t: &ToolDescriptor) -> f32 {
    let cand = &t.sanitized_name;
    let cand_norm = normalize(cand);

    if wanted_norm == cand_norm {
        return 0.95;
    }

    // Substring containment in either direction, weighted by length ratio so
    // "list_subs" → "list_subscriptions" beats a one-char overlap.
    if !wanted.is_empty() && (cand_norm.contains(wanted_norm) || wanted_norm.contains(&cand_norm)) {
        let (short, long) = if wanted_norm.len() < cand_norm.len() {
            (wanted_norm.len(), cand_norm.len())
        } else {
            (cand_norm.len(), wanted_norm.len())
        };
        if long > 0 {
            return 0.9 * short as f32 / long as f32;
        }
    }

    let overlap = token_overlap(wanted_norm, &cand_norm);
    if overlap >= 0.5 {
        overlap * 0.8
    } else {
        0.0
    }
}

/// Share of tokens in common, measured against the larger token set.
fn token_overlap(a: &str, b: &str) -> f32 {
    let ta: Vec<&str> = a.split('_').filter(|s| !s.is_empty()).collect();
    let tb: Vec<&str> = b.split('_').filter(|s| !s.is_empty()).collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let common = ta.iter().filter(|t| tb.contains(t)).count();
    common as f32 / ta.len().max(tb.len()) as f32
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
