// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod manager;
mod mock;
mod provider;
pub mod router;
mod types;

pub use manager::{classify_provider_error, FailoverInfo, ProviderErrorClass, ProviderManager};
pub use mock::{FailingProvider, MockProvider, ScriptedProvider};
pub use provider::{ModelProvider, ResponseStream};
pub use router::{RouteError, RouteInput, RoutedModel, TaskAnalysis, ToolChoice};
pub use types::*;
