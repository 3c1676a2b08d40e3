// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model routing: which model serves a request, how its native reasoning is
//! configured, and how the tool set offered to it is shaped.
//!
//! Routing decides *which* model; the provider manager decides *how* it is
//! streamed and whether to fail over.  Keeping the two orthogonal means a new
//! provider needs no router change and a new model only needs routing rules.

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use maestro_config::{PipelineConfig, SliderConfig};

use crate::{effort_for_budget, Message, ReasoningConfig, ToolSchema};

/// Output of the external task-analysis collaborator.
#[derive(Debug, Clone, Default)]
pub struct TaskAnalysis {
    /// Model the analysis recommends for this request, if any.
    pub suggested_model: Option<String>,
    /// The tiered function-calling service decided no tools are needed.
    pub is_pure_chat: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no model configured: set DEFAULT_CHAT_MODEL or pass a model")]
    NoModelConfigured,
}

/// Everything the router looks at for one request.
pub struct RouteInput<'a> {
    /// Explicit model named by the request, if any.
    pub requested_model: Option<&'a str>,
    /// Model configured on the pipeline/session the request belongs to.
    pub pipeline_model: Option<&'a str>,
    pub config: &'a PipelineConfig,
    pub slider: &'a SliderConfig,
    pub analysis: Option<&'a TaskAnalysis>,
    /// Prepared message history (inspected for images and thinking blocks).
    pub messages: &'a [Message],
    /// Per-request extended-thinking toggle; `Some(false)` hard-disables.
    pub enable_extended_thinking: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RoutedModel {
    pub model: String,
    /// Human-readable note on why this model was chosen, kept for metadata.
    pub reason: String,
    pub reasoning: Option<ReasoningConfig>,
}

/// Sentinel model names that mean "let the router decide".
fn is_sentinel(model: &str) -> bool {
    matches!(model, "default" | "model-router")
}

/// Select the model and reasoning configuration for a request.
pub fn route(input: RouteInput<'_>) -> Result<RoutedModel, RouteError> {
    // Cheap-local suggestions are only honoured when the deployment opted in.
    let suggestion = input
        .analysis
        .and_then(|a| a.suggested_model.as_deref())
        .filter(|m| input.config.route_simple_to_ollama || !m.contains("ollama"));

    let (model, reason) = if let Some(m) = input.requested_model.filter(|m| !is_sentinel(m)) {
        (m.to_string(), "explicit request override".to_string())
    } else if input.config.intelligent_routing && suggestion.is_some() {
        (
            suggestion.unwrap().to_string(),
            "task analysis recommendation".to_string(),
        )
    } else if let Some(m) = input.pipeline_model.filter(|m| !is_sentinel(m)) {
        (m.to_string(), "pipeline configuration".to_string())
    } else if let Some(m) = suggestion {
        (m.to_string(), "task analysis fallback".to_string())
    } else if let Some(m) = &input.config.default_chat_model {
        (m.clone(), "configured default".to_string())
    } else {
        return Err(RouteError::NoModelConfigured);
    };

    let model = reroute_for_vision(model, input.messages, input.config);
    let reasoning = reasoning_for(&model, input);

    debug!(model = %model, reason = %reason, "routed model");
    Ok(RoutedModel {
        model,
        reason,
        reasoning,
    })
}

/// Swap to the configured vision model when the history carries images and
/// the chosen model is not known to accept them.
fn reroute_for_vision(model: String, messages: &[Message], config: &PipelineConfig) -> String {
    let has_images = messages.iter().any(Message::has_images);
    if !has_images || config.vision_capable_models.iter().any(|m| m == &model) {
        return model;
    }
    match &config.vision_fallback_model {
        Some(fallback) => {
            debug!(from = %model, to = %fallback, "swapping to vision-capable model");
            fallback.clone()
        }
        None => {
            warn!(
                model = %model,
                "request carries images but no vision fallback is configured"
            );
            model
        }
    }
}

// ─── Reasoning configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelFamily {
    ClaudeLike,
    GeminiLike,
    OSeries,
    Other,
}

fn family_of(model: &str) -> ModelFamily {
    static O_SERIES: OnceLock<Regex> = OnceLock::new();
    let o_series = O_SERIES.get_or_init(|| Regex::new(r"^o\d").unwrap());

    let lower = model.to_lowercase();
    if lower.contains("claude") {
        ModelFamily::ClaudeLike
    } else if lower.contains("gemini") {
        ModelFamily::GeminiLike
    } else if o_series.is_match(&lower) {
        ModelFamily::OSeries
    } else {
        ModelFamily::Other
    }
}

/// Gemini gained a native thinking parameter with the 2.5 generation.
fn gemini_supports_thinking(model: &str) -> bool {
    static GEN: OnceLock<Regex> = OnceLock::new();
    let gen = GEN.get_or_init(|| Regex::new(r"gemini-(2\.[5-9]|[3-9])").unwrap());
    gen.is_match(&model.to_lowercase())
}

/// An assistant turn is thinking-led when it carries no tool calls and its
/// stored metadata preserves the thinking content it opened with.  A history
/// containing any other assistant turn cannot be replayed to a Claude-like
/// model with extended thinking enabled.
fn history_supports_thinking(messages: &[Message]) -> bool {
    messages
        .iter()
        .filter(|m| m.role == crate::Role::Assistant)
        .all(|m| {
            m.tool_calls.is_empty()
                && (m.as_text().map(str::is_empty).unwrap_or(true)
                    || m.metadata.contains_key("thinkingContent"))
        })
}

fn reasoning_for(model: &str, input: RouteInput<'_>) -> Option<ReasoningConfig> {
    let budget = input.slider.effective_thinking_budget();
    match family_of(model) {
        ModelFamily::ClaudeLike => {
            if input.enable_extended_thinking == Some(false)
                || budget == 0
                || !history_supports_thinking(input.messages)
            {
                None
            } else {
                Some(ReasoningConfig::ExtendedThinking {
                    budget_tokens: budget,
                })
            }
        }
        ModelFamily::GeminiLike => {
            if budget > 0 && gemini_supports_thinking(model) {
                Some(ReasoningConfig::Effort(effort_for_budget(budget)))
            } else {
                None
            }
        }
        // o-series models always reason; the budget only tunes the effort.
        ModelFamily::OSeries => Some(ReasoningConfig::Effort(effort_for_budget(budget))),
        ModelFamily::Other => None,
    }
}

// ─── Tool-set shaping ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    /// Pin one tool; the provider must call it.
    Required(String),
}

impl ToolChoice {
    pub fn into_wire(self) -> Option<String> {
        match self {
            ToolChoice::Auto => None,
            ToolChoice::Required(name) => Some(name),
        }
    }
}

/// Shape the tool list offered to the provider for one request.
///
/// Pure-chat requests get no tools at all.  Otherwise the list is capped at
/// the configured limit (order preserved — the retrieval-tool stage already
/// sorted by relevance), and audit-style bulk requests are pinned to the
/// background-job tool when one is available.
pub fn shape_tools(
    tools: Vec<ToolSchema>,
    analysis: Option<&TaskAnalysis>,
    user_message: &str,
    config: &PipelineConfig,
    background_marker: &str,
) -> (Vec<ToolSchema>, ToolChoice) {
    if analysis.map(|a| a.is_pure_chat).unwrap_or(false) {
        return (Vec::new(), ToolChoice::Auto);
    }

    let mut tools = tools;
    if tools.len() > config.tool_limit {
        debug!(
            offered = tools.len(),
            cap = config.tool_limit,
            "truncating tool list to platform limit"
        );
        tools.truncate(config.tool_limit);
    }

    if is_audit_style(user_message) && references_many_entities(user_message) {
        if let Some(bg) = tools
            .iter()
            .find(|t| t.name.to_lowercase().contains(background_marker))
        {
            return (tools.clone(), ToolChoice::Required(bg.name.clone()));
        }
    }

    (tools, ToolChoice::Auto)
}

fn is_audit_style(message: &str) -> bool {
    static PATTERNS: OnceLock<Regex> = OnceLock::new();
    let re = PATTERNS.get_or_init(|| {
        Regex::new(
            r"(?i)\baudit\b|analyze each|comprehensive|subscriptions individually|per subscription|one by one|each of the",
        )
        .unwrap()
    });
    re.is_match(message)
}

/// True when the message references at least ten entities — detected as a
/// numeric literal of two or more digits whose value is ≥ 10.
fn references_many_entities(message: &str) -> bool {
    static NUM: OnceLock<Regex> = OnceLock::new();
    let re = NUM.get_or_init(|| Regex::new(r"\d{2,}").unwrap());
    re.find_iter(message)
        .filter_map(|m| m.as_str().parse::<u64>().ok())
        .any(|n| n >= 10)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use maestro_config::SliderSource;

    fn slider(position: u8) -> SliderConfig {
        SliderConfig {
            position,
            enable_thinking: true,
            max_thinking_budget: 32_768,
            source: SliderSource::Request,
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            default_chat_model: Some("gpt-4o".into()),
            vision_capable_models: vec!["gpt-4o".into(), "gemini-2.5-pro".into()],
            vision_fallback_model: Some("gpt-4o".into()),
            ..PipelineConfig::default()
        }
    }

    fn input<'a>(
        requested: Option<&'a str>,
        pipeline_model: Option<&'a str>,
        config: &'a PipelineConfig,
        slider: &'a SliderConfig,
        analysis: Option<&'a TaskAnalysis>,
        messages: &'a [Message],
    ) -> RouteInput<'a> {
        RouteInput {
            requested_model: requested,
            pipeline_model,
            config,
            slider,
            analysis,
            messages,
            enable_extended_thinking: None,
        }
    }

    // ── Decision order ────────────────────────────────────────────────────────

    #[test]
    fn explicit_request_model_wins() {
        let cfg = config();
        let s = slider(50);
        let analysis = TaskAnalysis {
            suggested_model: Some("cheap-model".into()),
            is_pure_chat: false,
        };
        let r = route(input(
            Some("claude-opus"),
            Some("pipeline-model"),
            &cfg,
            &s,
            Some(&analysis),
            &[],
        ))
        .unwrap();
        assert_eq!(r.model, "claude-opus");
    }

    #[test]
    fn sentinel_model_is_ignored() {
        let cfg = config();
        let s = slider(50);
        let r = route(input(Some("default"), None, &cfg, &s, None, &[])).unwrap();
        assert_eq!(r.model, "gpt-4o");
    }

    #[test]
    fn analysis_suggestion_used_when_intelligent_routing_on() {
        let cfg = config();
        let s = slider(50);
        let analysis = TaskAnalysis {
            suggested_model: Some("cheap-model".into()),
            is_pure_chat: false,
        };
        let r = route(input(None, Some("pipe-model"), &cfg, &s, Some(&analysis), &[])).unwrap();
        assert_eq!(r.model, "cheap-model");
    }

    #[test]
    fn pipeline_model_used_when_routing_disabled() {
        let mut cfg = config();
        cfg.intelligent_routing = false;
        let s = slider(50);
        let analysis = TaskAnalysis {
            suggested_model: Some("cheap-model".into()),
            is_pure_chat: false,
        };
        let r = route(input(None, Some("pipe-model"), &cfg, &s, Some(&analysis), &[])).unwrap();
        assert_eq!(r.model, "pipe-model");
    }

    #[test]
    fn analysis_fallback_before_default() {
        let mut cfg = config();
        cfg.intelligent_routing = false;
        let s = slider(50);
        let analysis = TaskAnalysis {
            suggested_model: Some("cheap-model".into()),
            is_pure_chat: false,
        };
        let r = route(input(None, None, &cfg, &s, Some(&analysis), &[])).unwrap();
        assert_eq!(r.model, "cheap-model");
    }

    #[test]
    fn no_model_anywhere_is_a_configuration_error() {
        let mut cfg = config();
        cfg.default_chat_model = None;
        let s = slider(50);
        let err = route(input(None, None, &cfg, &s, None, &[])).unwrap_err();
        assert!(matches!(err, RouteError::NoModelConfigured));
    }

    // ── Vision routing ────────────────────────────────────────────────────────

    #[test]
    fn image_history_swaps_to_vision_model() {
        let cfg = config();
        let s = slider(50);
        let messages = vec![Message::user_with_parts(vec![crate::ContentPart::Image {
            image_url: "data:image/png;base64,A".into(),
        }])];
        let r = route(input(
            Some("text-only-model"),
            None,
            &cfg,
            &s,
            None,
            &messages,
        ))
        .unwrap();
        assert_eq!(r.model, "gpt-4o");
    }

    #[test]
    fn vision_capable_model_is_kept() {
        let cfg = config();
        let s = slider(50);
        let messages = vec![Message::user_with_parts(vec![crate::ContentPart::Image {
            image_url: "data:image/png;base64,A".into(),
        }])];
        let r = route(input(Some("gemini-2.5-pro"), None, &cfg, &s, None, &messages)).unwrap();
        assert_eq!(r.model, "gemini-2.5-pro");
    }

    #[test]
    fn no_fallback_configured_keeps_model() {
        let mut cfg = config();
        cfg.vision_fallback_model = None;
        let s = slider(50);
        let messages = vec![Message::user_with_parts(vec![crate::ContentPart::Image {
            image_url: "data:image/png;base64,A".into(),
        }])];
        let r = route(input(
            Some("text-only-model"),
            None,
            &cfg,
            &s,
            None,
            &messages,
        ))
        .unwrap();
        assert_eq!(r.model, "text-only-model");
    }

    // ── Reasoning configuration ───────────────────────────────────────────────

    #[test]
    fn claude_gets_extended_thinking_on_clean_history() {
        let cfg = config();
        let s = slider(80);
        let messages = vec![Message::user("hi")];
        let r = route(input(Some("claude-opus"), None, &cfg, &s, None, &messages)).unwrap();
        assert_eq!(
            r.reasoning,
            Some(ReasoningConfig::ExtendedThinking {
                budget_tokens: 32_768
            })
        );
    }

    #[test]
    fn claude_thinking_disabled_by_tool_call_history() {
        let cfg = config();
        let s = slider(80);
        let messages = vec![
            Message::user("hi"),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall {
                    id: "c1".into(),
                    name: "t".into(),
                    arguments: serde_json::json!({}),
                    thought_signature: None,
                }],
            ),
        ];
        let r = route(input(Some("claude-opus"), None, &cfg, &s, None, &messages)).unwrap();
        assert_eq!(r.reasoning, None);
    }

    #[test]
    fn claude_thinking_disabled_by_plain_assistant_text() {
        let cfg = config();
        let s = slider(80);
        let messages = vec![Message::user("hi"), Message::assistant("plain reply")];
        let r = route(input(Some("claude-opus"), None, &cfg, &s, None, &messages)).unwrap();
        assert_eq!(r.reasoning, None);
    }

    #[test]
    fn claude_thinking_kept_when_history_is_thinking_led() {
        let cfg = config();
        let s = slider(80);
        let mut a = Message::assistant("the reply");
        a.metadata.insert(
            "thinkingContent".into(),
            serde_json::Value::String("...".into()),
        );
        let messages = vec![Message::user("hi"), a];
        let r = route(input(Some("claude-opus"), None, &cfg, &s, None, &messages)).unwrap();
        assert!(matches!(
            r.reasoning,
            Some(ReasoningConfig::ExtendedThinking { .. })
        ));
    }

    #[test]
    fn claude_thinking_disabled_by_explicit_toggle() {
        let cfg = config();
        let s = slider(80);
        let mut inp = input(Some("claude-opus"), None, &cfg, &s, None, &[]);
        inp.enable_extended_thinking = Some(false);
        let r = route(inp).unwrap();
        assert_eq!(r.reasoning, None);
    }

    #[test]
    fn gemini_25_maps_budget_to_effort() {
        let cfg = config();
        let s = slider(80); // premium → budget 32768 → high
        let r = route(input(Some("gemini-2.5-pro"), None, &cfg, &s, None, &[])).unwrap();
        assert_eq!(
            r.reasoning,
            Some(ReasoningConfig::Effort(crate::ReasoningEffort::High))
        );
    }

    #[test]
    fn old_gemini_gets_no_reasoning() {
        let cfg = config();
        let s = slider(80);
        let r = route(input(Some("gemini-1.5-pro"), None, &cfg, &s, None, &[])).unwrap();
        assert_eq!(r.reasoning, None);
    }

    #[test]
    fn o_series_always_has_effort() {
        let cfg = config();
        let s = SliderConfig {
            position: 20,
            enable_thinking: false,
            max_thinking_budget: 0,
            source: SliderSource::Default,
        };
        let r = route(input(Some("o3-mini"), None, &cfg, &s, None, &[])).unwrap();
        assert_eq!(
            r.reasoning,
            Some(ReasoningConfig::Effort(crate::ReasoningEffort::Low))
        );
    }

    #[test]
    fn other_models_get_no_reasoning_parameter() {
        let cfg = config();
        let s = slider(80);
        let r = route(input(Some("gpt-4o"), None, &cfg, &s, None, &[])).unwrap();
        assert_eq!(r.reasoning, None);
    }

    // ── Tool shaping ──────────────────────────────────────────────────────────

    fn schemas(n: usize) -> Vec<ToolSchema> {
        (0..n)
            .map(|i| ToolSchema {
                name: format!("tool_{i}"),
                description: String::new(),
                parameters: serde_json::json!({"type": "object"}),
            })
            .collect()
    }

    #[test]
    fn pure_chat_strips_all_tools() {
        let cfg = config();
        let analysis = TaskAnalysis {
            suggested_model: None,
            is_pure_chat: true,
        };
        let (tools, choice) = shape_tools(schemas(5), Some(&analysis), "hi", &cfg, "background");
        assert!(tools.is_empty());
        assert_eq!(choice, ToolChoice::Auto);
    }

    #[test]
    fn tool_list_capped_at_limit_preserving_order() {
        let cfg = config();
        let (tools, _) = shape_tools(schemas(130), None, "hi", &cfg, "background");
        assert_eq!(tools.len(), 127);
        assert_eq!(tools[0].name, "tool_0");
        assert_eq!(tools[126].name, "tool_126");
    }

    #[test]
    fn audit_request_pins_background_tool() {
        let cfg = config();
        let mut tools = schemas(3);
        tools.push(ToolSchema {
            name: "start_background_job".into(),
            description: String::new(),
            parameters: serde_json::json!({"type": "object"}),
        });
        let (_, choice) = shape_tools(
            tools,
            None,
            "Audit all 25 subscriptions individually",
            &cfg,
            "background",
        );
        assert_eq!(choice, ToolChoice::Required("start_background_job".into()));
    }

    #[test]
    fn audit_without_entity_count_stays_auto() {
        let cfg = config();
        let mut tools = schemas(3);
        tools.push(ToolSchema {
            name: "start_background_job".into(),
            description: String::new(),
            parameters: serde_json::json!({"type": "object"}),
        });
        let (_, choice) = shape_tools(tools, None, "please audit my setup", &cfg, "background");
        assert_eq!(choice, ToolChoice::Auto);
    }

    #[test]
    fn audit_without_background_tool_stays_auto() {
        let cfg = config();
        let (_, choice) = shape_tools(
            schemas(3),
            None,
            "Audit all 25 subscriptions individually",
            &cfg,
            "background",
        );
        assert_eq!(choice, ToolChoice::Auto);
    }

    #[test]
    fn entity_detection_requires_two_digit_value() {
        assert!(references_many_entities("check 42 accounts"));
        assert!(!references_many_entities("check 9 accounts"));
        assert!(!references_many_entities("no numbers here"));
    }
}
