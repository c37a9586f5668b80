//! Events of the UI message stream consumed by the diagram front end.
//!
//! Each event serializes to one JSON object tagged by `type`, sent as one
//! server-sent-event `data:` frame.

use serde::Serialize;
use serde_json::Value;

/// Response header announcing the stream protocol version.
pub const STREAM_PROTOCOL_HEADER: &str = "x-vercel-ai-ui-message-stream";
pub const STREAM_PROTOCOL_VERSION: &str = "v1";
/// Final frame payload after the last event.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiEvent {
    Start,
    StartStep,
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputError {
        tool_call_id: String,
        tool_name: String,
        input: Value,
        error_text: String,
    },
    FinishStep,
    #[serde(rename_all = "camelCase")]
    Finish {
        #[serde(skip_serializing_if = "Option::is_none")]
        message_metadata: Option<FinishMetadata>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_text: String,
    },
}

impl UiEvent {
    /// Whether the event carries model output rather than stream framing.
    #[must_use]
    pub fn is_content(&self) -> bool {
        !matches!(self, Self::Start | Self::StartStep)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Error { .. })
    }

    /// Serialized `data:` payload for this event.
    #[must_use]
    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            Err(error) => {
                tracing::error!(%error, "failed to serialize stream event");
                r#"{"type":"error","errorText":"failed to serialize stream event"}"#.to_string()
            }
        }
    }
}

/// Usage summary attached to the terminal `finish` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishMetadata {
    /// Non-cached plus cached input tokens.
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<Value>,
}
