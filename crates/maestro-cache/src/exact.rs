// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;
use tracing::debug;

struct Entry {
    payload: Value,
    expires_at: Instant,
}

/// Exact tier: per-user, hash-keyed, TTL-bounded.
///
/// Keys are `tool:<name>:<userId>:<argsHash>`; the value is the opaque tool
/// payload.  TTL is the only coherence mechanism — writes are
/// last-writer-wins and expired entries are dropped on read.
pub struct ExactCache {
    inner: Mutex<LruCache<String, Entry>>,
}

impl ExactCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    fn key(tool_name: &str, user_id: &str, arguments: &Value) -> String {
        format!(
            "tool:{tool_name}:{user_id}:{}",
            crate::canonical::args_hash(arguments)
        )
    }

    pub fn get(&self, tool_name: &str, user_id: &str, arguments: &Value) -> Option<Value> {
        let key = Self::key(tool_name, user_id, arguments);
        let mut cache = self.inner.lock().unwrap();
        let live = match cache.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.payload.clone()),
            Some(_) => None,
            None => return None,
        };
        match live {
            Some(payload) => {
                debug!(%key, "exact cache hit");
                Some(payload)
            }
            None => {
                cache.pop(&key);
                None
            }
        }
    }

    pub fn put(&self, tool_name: &str, user_id: &str, arguments: &Value, payload: Value, ttl: Duration) {
        let key = Self::key(tool_name, user_id, arguments);
        let entry = Entry {
            payload,
            expires_at: Instant::now() + ttl,
        };
        self.inner.lock().unwrap().put(key, entry);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
