// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::{CompletionRequest, ModelProvider, ResponseStream};

/// Metadata about a transparent failover, surfaced to the completion stage
/// exactly once per request.
#[derive(Debug, Clone)]
pub struct FailoverInfo {
    pub original_provider: String,
    pub failover_provider: String,
    pub failure_reason: String,
    pub failover_time: DateTime<Utc>,
}

/// Unified streaming interface over an ordered list of LM backends.
///
/// `open_stream` walks the list until one provider accepts the request.  When
/// a non-primary provider ends up serving, the hop is recorded; the caller
/// polls it with [`ProviderManager::take_failover`], which clears the flag so
/// the failover event is emitted at most once.
pub struct ProviderManager {
    providers: Vec<Arc<dyn ModelProvider>>,
    failover: Mutex<Option<FailoverInfo>>,
}

impl ProviderManager {
    pub fn new(providers: Vec<Arc<dyn ModelProvider>>) -> Self {
        Self {
            providers,
            failover: Mutex::new(None),
        }
    }

    pub fn single(provider: Arc<dyn ModelProvider>) -> Self {
        Self::new(vec![provider])
    }

    /// Name of the provider that would serve first.
    pub fn primary_name(&self) -> Option<&str> {
        self.providers.first().map(|p| p.name())
    }

    /// Open a stream on the first provider that accepts the request.
    /// Returns the serving provider's name alongside the stream.
    pub async fn open_stream(
        &self,
        req: CompletionRequest,
    ) -> anyhow::Result<(String, ResponseStream)> {
        let mut first_failure: Option<(String, String)> = None;
        let mut last_err: Option<anyhow::Error> = None;

        for provider in &self.providers {
            match provider.complete(req.clone()).await {
                Ok(stream) => {
                    if let Some((original, reason)) = first_failure.take() {
                        warn!(
                            original = %original,
                            failover = %provider.name(),
                            %reason,
                            "provider failover"
                        );
                        *self.failover.lock().unwrap() = Some(FailoverInfo {
                            original_provider: original,
                            failover_provider: provider.name().to_string(),
                            failure_reason: reason,
                            failover_time: Utc::now(),
                        });
                    }
                    return Ok((provider.name().to_string(), stream));
                }
                Err(e) => {
                    // Schema-complexity rejections are handled by the caller
                    // with a reduced tool set; failing over would just hit the
                    // same limit on the next backend.
                    if matches!(
                        classify_provider_error(&e),
                        ProviderErrorClass::SchemaComplexity
                    ) {
                        return Err(e);
                    }
                    if first_failure.is_none() {
                        first_failure = Some((provider.name().to_string(), e.to_string()));
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no providers configured")))
    }

    /// Return and clear the recorded failover, if any.
    pub fn take_failover(&self) -> Option<FailoverInfo> {
        self.failover.lock().unwrap().take()
    }
}

// ─── Error classification ────────────────────────────────────────────────────

/// Coarse classification of provider failures for metric tagging and the
/// schema-limit retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorClass {
    Timeout,
    RateLimit,
    /// The provider rejected the request because the tool/schema surface was
    /// too large; recoverable by halving the tool set.
    SchemaComplexity,
    Other,
}

pub fn classify_provider_error(e: &anyhow::Error) -> ProviderErrorClass {
    let msg = e.to_string().to_lowercase();
    if msg.contains("too many states")
        || msg.contains("too many tools")
        || msg.contains("too many functions")
    {
        return ProviderErrorClass::SchemaComplexity;
    }
    if msg.contains("timeout") || msg.contains("timed out") || msg.contains("deadline") {
        return ProviderErrorClass::Timeout;
    }
    if msg.contains("429") || msg.contains("rate limit") || msg.contains("quota") {
        return ProviderErrorClass::RateLimit;
    }
    ProviderErrorClass::Other
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
