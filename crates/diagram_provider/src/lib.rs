//! Provider-neutral contract for one diagram-generation step.
//!
//! This crate defines the message, tool, and stream-part types shared between
//! the chat-turn pipeline and the model backends. It carries no transport
//! details and no knowledge of the diagram tools themselves; the pipeline owns
//! step budgeting, tool-call repair, and event relaying.

use std::fmt;
use std::sync::{atomic::AtomicBool, Arc};

use serde_json::Value;

/// Shared cancellation flag for one generation call.
pub type CancelSignal = Arc<AtomicBool>;

/// Error returned while constructing a backend before any call starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInitError {
    message: String,
}

impl BackendInitError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for BackendInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for BackendInitError {}

impl From<String> for BackendInitError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Error returned by a backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The call observed the cancel signal and stopped.
    Cancelled,
    /// The hosted API answered with a failure.
    Upstream {
        status: Option<u16>,
        message: String,
        body: Option<String>,
    },
    /// The call never reached a usable answer (connect, decode, runtime).
    Transport(String),
    /// The backend does not offer the requested capability.
    Unsupported(String),
}

impl BackendError {
    #[must_use]
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
            body: None,
        }
    }

    /// Returns the upstream HTTP status, if the backend reported one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => *status,
            _ => None,
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("generation was cancelled"),
            Self::Upstream {
                status: Some(status),
                message,
                ..
            } => write!(f, "upstream call failed (HTTP {status}): {message}"),
            Self::Upstream { message, .. } => write!(f, "upstream call failed: {message}"),
            Self::Transport(message) => write!(f, "transport failure: {message}"),
            Self::Unsupported(message) => write!(f, "unsupported: {message}"),
        }
    }
}

impl std::error::Error for BackendError {}

/// Author of a model-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// One typed part of a model-facing message.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// Attachment passed by data URL (or remote URL) with its media type.
    File {
        url: String,
        media_type: Option<String>,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        output: Value,
        is_error: bool,
    },
}

impl ContentPart {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Provider-neutral message sent to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
    /// Marks the end of a reusable prompt prefix for backends that cache.
    pub cache_breakpoint: bool,
}

impl ModelMessage {
    #[must_use]
    pub fn new(role: Role, parts: Vec<ContentPart>) -> Self {
        Self {
            role,
            parts,
            cache_breakpoint: false,
        }
    }

    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    #[must_use]
    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self::new(Role::User, parts)
    }

    #[must_use]
    pub fn assistant(parts: Vec<ContentPart>) -> Self {
        Self::new(Role::Assistant, parts)
    }

    #[must_use]
    pub fn tool(parts: Vec<ContentPart>) -> Self {
        Self::new(Role::Tool, parts)
    }

    #[must_use]
    pub fn with_cache_breakpoint(mut self) -> Self {
        self.cache_breakpoint = true;
        self
    }

    /// Concatenated text parts, in order.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Host-defined tool exposed to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Extended-reasoning settings for backends that support them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThinkingConfig {
    pub include_thoughts: bool,
    pub budget_tokens: Option<u32>,
    pub level: Option<String>,
}

/// Per-request generation options resolved before the call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub reasoning_effort: Option<String>,
    pub reasoning_summary: Option<String>,
    pub thinking: Option<ThinkingConfig>,
    pub candidate_count: Option<u32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
}

/// Input for one generation step.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// 1-based index of this step within the chat turn.
    pub step: u32,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolDefinition>,
    pub options: RequestOptions,
}

/// Why a step stopped producing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Other,
}

impl FinishReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool-calls",
            Self::ContentFilter => "content-filter",
            Self::Error => "error",
            Self::Other => "other",
        }
    }
}

/// Token accounting for one step or a whole turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Input tokens billed without cache reuse.
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
    }

    #[must_use]
    pub fn total_input_tokens(&self) -> u64 {
        self.input_tokens + self.cached_input_tokens
    }
}

/// Incremental output emitted by a backend while a step streams.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamPart {
    TextDelta {
        text: String,
    },
    ReasoningDelta {
        text: String,
    },
    ToolInputStart {
        call_id: String,
        tool_name: String,
    },
    ToolInputDelta {
        call_id: String,
        delta: String,
    },
    /// A completed tool call. `input` is the raw argument text as produced by
    /// the model and may not be valid JSON.
    ToolCall {
        call_id: String,
        tool_name: String,
        input: String,
    },
}

/// Terminal summary of one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub provider_metadata: Option<Value>,
}

impl StepOutcome {
    #[must_use]
    pub fn new(finish_reason: FinishReason) -> Self {
        Self {
            finish_reason,
            usage: Usage::default(),
            provider_metadata: None,
        }
    }
}

/// Input for a grounded web-search call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub model_id: String,
    pub prompt: String,
}

/// Prose summary and citations produced by a grounded search call.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub summary: String,
    pub grounding_metadata: Option<Value>,
}

/// Immutable metadata describing a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    pub provider_id: String,
    pub model_id: String,
    pub supports_prompt_caching: bool,
    pub supports_grounded_search: bool,
}

/// Capability interface implemented once per hosted model family.
pub trait ModelBackend: Send + Sync + 'static {
    /// Returns provider/model identity and capability flags.
    fn profile(&self) -> BackendProfile;

    /// Runs one generation step and emits stream parts in backend order.
    ///
    /// Implementations must poll `cancel` and stop with
    /// [`BackendError::Cancelled`] once it is raised.
    fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(StreamPart),
    ) -> Result<StepOutcome, BackendError>;

    /// Runs a grounded web-search call.
    fn search(
        &self,
        _request: SearchRequest,
        _cancel: CancelSignal,
    ) -> Result<SearchResult, BackendError> {
        Err(BackendError::Unsupported(
            "grounded search is not supported by this backend".to_string(),
        ))
    }

    /// Runs a tool-less step and returns its concatenated text.
    fn complete(
        &self,
        request: GenerationRequest,
        cancel: CancelSignal,
    ) -> Result<String, BackendError> {
        let mut text = String::new();
        self.generate(request, cancel, &mut |part| {
            if let StreamPart::TextDelta { text: delta } = part {
                text.push_str(&delta);
            }
        })?;
        Ok(text)
    }
}
