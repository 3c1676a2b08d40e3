// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, ResponseEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<ResponseEvent>> + Send>>;

/// One concrete LM backend.  Implementations normalize their wire format into
/// [`ResponseEvent`]s; everything upstream is provider-agnostic.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable provider id for routing, metrics, and failover events.
    fn name(&self) -> &str;

    /// Send a completion request and return a streaming response.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream>;
}
