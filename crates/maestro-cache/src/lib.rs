// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod canonical;
mod classify;
mod exact;
mod semantic;

pub use canonical::{args_hash, canonical_json};
pub use classify::{is_cacheable, ttl_for};
pub use exact::ExactCache;
pub use semantic::{
    cosine_similarity, extract_resource_scope, Embedder, ScopeAccess, SemanticCache, SemanticHit,
};
