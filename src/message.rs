//! Incoming chat-turn request types.
//!
//! Message parts arrive in the UI stream's shape and are decoded leniently:
//! unknown part kinds survive decoding as [`MessagePart::Unknown`] and are
//! dropped later when history is converted for a backend.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub role: ChatRole,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl ChatMessage {
    /// Text of the first text part, or an empty string.
    #[must_use]
    pub fn first_text(&self) -> &str {
        self.parts
            .iter()
            .find_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .unwrap_or("")
    }

    pub fn files(&self) -> impl Iterator<Item = FileRef<'_>> {
        self.parts.iter().filter_map(|part| match part {
            MessagePart::File {
                url, media_type, ..
            } => Some(FileRef {
                url,
                media_type: media_type.as_deref(),
            }),
            _ => None,
        })
    }

    #[must_use]
    pub fn has_file(&self) -> bool {
        self.files().next().is_some()
    }
}

/// Borrowed view of one attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRef<'a> {
    pub url: &'a str,
    pub media_type: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "Value")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    File {
        url: String,
        media_type: Option<String>,
        filename: Option<String>,
    },
    /// A recorded tool invocation. `input` is whatever the client stored and
    /// may be missing or malformed. `output` is set when the client recorded
    /// the result on the same part.
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        input: Option<Value>,
        output: Option<Value>,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        output: Value,
    },
    Unknown {
        kind: String,
    },
}

impl From<Value> for MessagePart {
    fn from(value: Value) -> Self {
        let kind = string_field(&value, "type").unwrap_or_default();
        match kind.as_str() {
            "text" => Self::Text {
                text: string_field(&value, "text").unwrap_or_default(),
            },
            "reasoning" => Self::Reasoning {
                text: string_field(&value, "text").unwrap_or_default(),
            },
            "file" => match string_field(&value, "url") {
                Some(url) => Self::File {
                    url,
                    media_type: string_field(&value, "mediaType"),
                    filename: string_field(&value, "filename"),
                },
                None => Self::Unknown { kind: kind.clone() },
            },
            "tool-call" => tool_call(&value, string_field(&value, "toolName"), &kind),
            "tool-result" => match (
                string_field(&value, "toolCallId"),
                string_field(&value, "toolName"),
            ) {
                (Some(tool_call_id), Some(tool_name)) => Self::ToolResult {
                    tool_call_id,
                    tool_name,
                    output: value.get("output").cloned().unwrap_or(Value::Null),
                },
                _ => Self::Unknown { kind: kind.clone() },
            },
            "dynamic-tool" => tool_call(&value, string_field(&value, "toolName"), &kind),
            _ => match kind.strip_prefix("tool-") {
                // UI form: `tool-<name>` carries input and output on one part.
                Some(name) if !name.is_empty() => {
                    tool_call(&value, Some(name.to_string()), &kind)
                }
                _ => Self::Unknown { kind: kind.clone() },
            },
        }
    }
}

fn tool_call(value: &Value, tool_name: Option<String>, kind: &str) -> MessagePart {
    match (string_field(value, "toolCallId"), tool_name) {
        (Some(tool_call_id), Some(tool_name)) => MessagePart::ToolCall {
            tool_call_id,
            tool_name,
            input: value.get("input").cloned().filter(|input| !input.is_null()),
            output: value.get("output").cloned().filter(|output| !output.is_null()),
        },
        _ => MessagePart::Unknown {
            kind: kind.to_string(),
        },
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub xml: Option<String>,
    #[serde(default)]
    pub previous_xml: Option<String>,
    /// Kept raw so a non-string value can be reported as a validation error.
    #[serde(default)]
    pub session_id: Option<Value>,
}

impl ChatRequest {
    #[must_use]
    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Text of the newest message's first text part.
    #[must_use]
    pub fn user_text(&self) -> &str {
        self.last_message().map_or("", ChatMessage::first_text)
    }

    #[must_use]
    pub fn canvas_xml(&self) -> &str {
        self.xml.as_deref().unwrap_or("")
    }
}

/// Body of `POST /api/enhance-prompt`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnhanceRequest {
    pub prompt: String,
}
