use serde::{Deserialize, Serialize};

/// Finish reason reported on the last chunk of a choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionFinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

impl CompletionFinishReason {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "stop" | "end_turn" | "STOP" => Self::Stop,
            "length" | "max_tokens" | "MAX_TOKENS" => Self::Length,
            "tool_calls" | "function_call" | "tool_use" => Self::ToolCalls,
            "content_filter" | "SAFETY" => Self::ContentFilter,
            "error" => Self::Error,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
            Self::Error => "error",
        }
    }
}

/// Token usage reported by the trailing usage chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Portion of `prompt_tokens` served from the provider's prompt cache.
    pub cached_tokens: u64,
}

/// Stream event emitted by the parser after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionStreamEvent {
    ContentDelta {
        delta: String,
    },
    ReasoningDelta {
        delta: String,
    },
    /// Fragment of a streamed tool call. `id` and `name` arrive on the first
    /// fragment for an index; later fragments only carry argument text.
    ToolCallDelta {
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    Finished {
        reason: Option<CompletionFinishReason>,
    },
    Usage {
        usage: CompletionUsage,
    },
    Error {
        code: Option<String>,
        message: Option<String>,
    },
}
