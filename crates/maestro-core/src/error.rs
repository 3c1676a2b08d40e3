// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Kinded pipeline errors.
//!
//! Tool failures, cache failures, audit failures, RAG sub-failures, and
//! incremental persistence failures are local: they are logged where they
//! happen and never reach this type.  Only unrecoverable conditions
//! short-circuit the pipeline.

/// Fatal outcome of a pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Missing default model or required URL; rejected at ingress.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A provider failure the stage could not recover from.
    #[error("completion failed at {stage}: {message}")]
    Completion {
        stage: &'static str,
        message: String,
        retryable: bool,
    },

    /// Client disconnect or explicit interrupt.  Closes the stream cleanly;
    /// never reported as a `completion_error`.
    #[error("client cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn completion(stage: &'static str, err: impl std::fmt::Display, retryable: bool) -> Self {
        Self::Completion {
            stage,
            message: err.to_string(),
            retryable,
        }
    }

    /// Stage name reported in the `completion_error` event.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "ingress",
            Self::Completion { stage, .. } => stage,
            Self::Cancelled => "cancelled",
        }
    }
}
