use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// Images are data URLs (`data:<mime>;base64,<b64>`) or HTTPS URLs for
/// providers that accept remote references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { image_url: String },
}

/// The content of a message – plain text for most turns, parts when a user
/// turn mixes text with images.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageBody {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Parts(parts) if parts.len() == 1 => match &parts[0] {
                ContentPart::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// Concatenation of all text parts (lossy for images).
    pub fn flat_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn has_images(&self) -> bool {
        matches!(self, Self::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::Image { .. })))
    }
}

impl Default for MessageBody {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Sort rank used to break timestamp ties in a session's message list.
    /// Assistant sorts before user so a sub-millisecond tie keeps the reply
    /// that a user message answers ahead of the message itself.
    pub fn tie_rank(self) -> u8 {
        match self {
            Role::System => 0,
            Role::Assistant => 1,
            Role::Tool => 2,
            Role::User => 3,
        }
    }
}

/// A single message in the conversation history.
///
/// Within a session, `id` is unique and `timestamp` is monotone
/// non-decreasing.  An assistant message with tool calls is followed by one
/// tool message per call (matched by `tool_call_id`), then exactly one more
/// assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub body: MessageBody,
    pub timestamp: DateTime<Utc>,
    /// Tool invocations requested by an assistant turn.  Empty otherwise.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool messages; refers to a call in the preceding assistant turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl Message {
    fn base(role: Role, body: MessageBody) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            body,
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            model: None,
            token_usage: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::base(Role::System, MessageBody::Text(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::base(Role::User, MessageBody::Text(text.into()))
    }

    pub fn user_with_parts(parts: Vec<ContentPart>) -> Self {
        Self::base(Role::User, MessageBody::Parts(parts))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::base(Role::Assistant, MessageBody::Text(text.into()))
    }

    /// Assistant turn carrying the tool calls for one round.
    pub fn assistant_with_tool_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut m = Self::base(Role::Assistant, MessageBody::Text(text.into()));
        m.tool_calls = calls;
        m
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut m = Self::base(Role::Tool, MessageBody::Text(content.into()));
        m.tool_call_id = Some(call_id.into());
        m
    }

    pub fn as_text(&self) -> Option<&str> {
        self.body.as_text()
    }

    pub fn has_images(&self) -> bool {
        self.body.has_images()
    }
}

// ─── Users ────────────────────────────────────────────────────────────────────

/// Authenticated caller identity, borrowed read-only from the authentication
/// collaborator for the lifetime of a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub is_admin: bool,
    /// Tenant the user belongs to; scopes cross-user cache sharing.
    #[serde(default)]
    pub tenant_id: String,
}

impl User {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }

    pub fn admin(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            is_admin: true,
            ..Self::new(id, tenant_id)
        }
    }
}

// ─── Tool calling ─────────────────────────────────────────────────────────────

/// A tool invocation as emitted by the model.  `name` is whatever the model
/// produced and may need resolution against the inventory before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Parsed JSON argument object (opaque to the pipeline).
    pub arguments: Value,
    /// Provider-native reasoning signature attached to the call, forwarded
    /// verbatim on the next request when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

/// A tool schema offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

// ─── Provider request / response ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// Map a thinking-token budget to a discrete effort level.
/// Shared by the Gemini-like and o-series router paths.
pub fn effort_for_budget(budget: u32) -> ReasoningEffort {
    if budget > 16_000 {
        ReasoningEffort::High
    } else if budget > 8_000 {
        ReasoningEffort::Medium
    } else {
        ReasoningEffort::Low
    }
}

/// Provider-native reasoning parameters chosen by the router.
#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningConfig {
    /// Claude-like extended thinking with an explicit token budget.
    ExtendedThinking { budget_tokens: u32 },
    /// Discrete effort level (Gemini 2.5+/3.x, OpenAI o-series).
    Effort(ReasoningEffort),
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    /// `None` = provider default (auto); `Some(name)` pins one tool.
    pub tool_choice: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub reasoning: Option<ReasoningConfig>,
    pub stream: bool,
}

/// A single normalized event from the provider stream.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// A text delta streamed from the model
    TextDelta(String),
    /// A reasoning/thinking delta, kept out of the answer text
    ReasoningDelta(String),
    /// Sparse incremental assembly of the tool call at `index`.
    /// `arguments` fragments are concatenated across deltas.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
        thought_signature: Option<String>,
    },
    /// Final usage statistics
    Usage {
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// The stream finished normally
    Done,
    /// A recoverable error (non-fatal warning)
    Error(String),
}

/// Token usage from one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(rename = "promptTokens")]
    pub prompt_tokens: u32,
    #[serde(rename = "completionTokens")]
    pub completion_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
