//! Message list assembly for the main generation call.
//!
//! Order is fixed: tool-use instructions, canvas state, mode block,
//! sanitized history, then the formatted final user turn.

use std::collections::HashSet;

use diagram_provider::{ContentPart, ModelMessage, Role};
use serde_json::{json, Value};

use crate::error::ChatError;
use crate::instructions::{
    diagram_context, format_user_input, mode_instruction, system_instructions,
};
use crate::message::{ChatMessage, ChatRole, MessagePart};
use crate::mode::ToolMode;
use crate::tools::DiagramTool;

pub const MAX_FILES: usize = 5;
pub const MAX_FILE_BYTES: usize = 2 * 1024 * 1024;

pub const HISTORY_XML_PLACEHOLDER: &str =
    "[XML content replaced - see current diagram XML in system context]";

/// Rejects the turn when the newest message carries too many or too large files.
pub fn validate_attachments(last_message: Option<&ChatMessage>) -> Result<(), ChatError> {
    let Some(message) = last_message else {
        return Ok(());
    };

    let files: Vec<_> = message.files().collect();
    if files.len() > MAX_FILES {
        return Err(ChatError::Validation(format!(
            "Too many files. Maximum {MAX_FILES} allowed."
        )));
    }

    for file in files {
        if let Some(size) = data_url_decoded_size(file.url) {
            if size > MAX_FILE_BYTES {
                return Err(ChatError::Validation(format!(
                    "File exceeds {}MB limit.",
                    MAX_FILE_BYTES / 1024 / 1024
                )));
            }
        }
    }
    Ok(())
}

/// Decoded byte estimate of a `data:` URL payload; `None` for other URLs.
fn data_url_decoded_size(url: &str) -> Option<usize> {
    let payload = url.strip_prefix("data:")?.split(',').nth(1)?;
    if payload.is_empty() {
        return None;
    }
    Some((payload.len() * 3).div_ceil(4))
}

/// Converts client history into backend messages.
///
/// Reasoning and unknown parts are dropped. A tool part that recorded its
/// output yields a call on the assistant message plus a result on a
/// following tool message.
#[must_use]
pub fn convert_history(messages: &[ChatMessage]) -> Vec<ModelMessage> {
    let mut converted = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            ChatRole::System => {
                let text = message
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        MessagePart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                converted.push(ModelMessage::new(Role::System, vec![ContentPart::text(text)]));
            }
            ChatRole::User => {
                let parts = message
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        MessagePart::Text { text } => Some(ContentPart::text(text.clone())),
                        MessagePart::File {
                            url, media_type, ..
                        } => Some(ContentPart::File {
                            url: url.clone(),
                            media_type: media_type.clone(),
                        }),
                        _ => None,
                    })
                    .collect();
                converted.push(ModelMessage::user(parts));
            }
            ChatRole::Assistant => {
                let mut parts = Vec::new();
                let mut results = Vec::new();
                for part in &message.parts {
                    match part {
                        MessagePart::Text { text } if !text.is_empty() => {
                            parts.push(ContentPart::text(text.clone()));
                        }
                        MessagePart::ToolCall {
                            tool_call_id,
                            tool_name,
                            input,
                            output,
                        } => {
                            parts.push(ContentPart::ToolCall {
                                call_id: tool_call_id.clone(),
                                tool_name: tool_name.clone(),
                                input: input.clone().unwrap_or(Value::Null),
                            });
                            if let Some(output) = output {
                                results.push(ContentPart::ToolResult {
                                    call_id: tool_call_id.clone(),
                                    tool_name: tool_name.clone(),
                                    output: output.clone(),
                                    is_error: false,
                                });
                            }
                        }
                        MessagePart::ToolResult {
                            tool_call_id,
                            tool_name,
                            output,
                        } => results.push(ContentPart::ToolResult {
                            call_id: tool_call_id.clone(),
                            tool_name: tool_name.clone(),
                            output: output.clone(),
                            is_error: false,
                        }),
                        _ => {}
                    }
                }
                converted.push(ModelMessage::assistant(parts));
                if !results.is_empty() {
                    converted.push(ModelMessage::tool(results));
                }
            }
        }
    }
    converted
}

/// Object inputs with at least one key are the only ones a backend accepts.
#[must_use]
pub fn is_usable_tool_input(input: &Value) -> bool {
    input.as_object().is_some_and(|object| !object.is_empty())
}

/// Drops unusable tool calls (and their results), optionally swaps old
/// diagram payloads for a placeholder, then drops empty messages.
#[must_use]
pub fn sanitize_history(
    messages: Vec<ModelMessage>,
    replace_history_xml: bool,
) -> Vec<ModelMessage> {
    let mut dropped_calls = HashSet::new();

    let messages: Vec<ModelMessage> = messages
        .into_iter()
        .map(|mut message| {
            if message.role != Role::Assistant {
                return message;
            }
            message.parts.retain(|part| match part {
                ContentPart::ToolCall {
                    call_id,
                    tool_name,
                    input,
                } if !is_usable_tool_input(input) => {
                    tracing::warn!(
                        tool = %tool_name,
                        call_id = %call_id,
                        "dropping history tool call with unusable input"
                    );
                    dropped_calls.insert(call_id.clone());
                    false
                }
                _ => true,
            });
            if replace_history_xml {
                for part in &mut message.parts {
                    if let ContentPart::ToolCall {
                        tool_name, input, ..
                    } = part
                    {
                        if DiagramTool::from_name(tool_name)
                            .is_some_and(|tool| tool.produces_diagram_xml())
                        {
                            *input = json!({ "placeholder": HISTORY_XML_PLACEHOLDER });
                        }
                    }
                }
            }
            message
        })
        .collect();

    messages
        .into_iter()
        .map(|mut message| {
            if message.role == Role::Tool {
                message.parts.retain(|part| match part {
                    ContentPart::ToolResult { call_id, .. } => !dropped_calls.contains(call_id),
                    _ => true,
                });
            }
            message
        })
        .filter(|message| !message.parts.is_empty())
        .collect()
}

/// Everything the assembler needs for one turn.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub model_id: &'a str,
    pub minimal_style: bool,
    pub prompt_caching: bool,
    pub replace_history_xml: bool,
    pub xml: &'a str,
    pub previous_xml: Option<&'a str>,
    pub mode: ToolMode,
    pub research_summary: Option<&'a str>,
}

/// Builds the ordered message list for the main call.
#[must_use]
pub fn assemble(messages: &[ChatMessage], inputs: &PromptInputs<'_>) -> Vec<ModelMessage> {
    let mut history = sanitize_history(convert_history(messages), inputs.replace_history_xml);

    if let (Some(last), Some(original)) = (history.last_mut(), messages.last()) {
        if last.role == Role::User && original.role == ChatRole::User {
            let mut parts = vec![ContentPart::text(format_user_input(original.first_text()))];
            parts.extend(original.files().map(|file| ContentPart::File {
                url: file.url.to_string(),
                media_type: file.media_type.map(str::to_string),
            }));
            last.parts = parts;
        }
    }

    if inputs.prompt_caching && history.len() >= 2 {
        let before_last = history.len() - 1;
        if let Some(message) = history[..before_last]
            .iter_mut()
            .rev()
            .find(|message| message.role == Role::Assistant)
        {
            message.cache_breakpoint = true;
        }
    }

    let instructions =
        ModelMessage::system(system_instructions(inputs.model_id, inputs.minimal_style));
    let canvas = ModelMessage::system(diagram_context(inputs.xml, inputs.previous_xml));
    let (instructions, canvas) = if inputs.prompt_caching {
        (instructions.with_cache_breakpoint(), canvas.with_cache_breakpoint())
    } else {
        (instructions, canvas)
    };

    let mut assembled = Vec::with_capacity(history.len() + 3);
    assembled.push(instructions);
    assembled.push(canvas);
    assembled.push(ModelMessage::system(mode_instruction(
        inputs.mode,
        inputs.research_summary,
    )));
    assembled.extend(history);
    assembled
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn message(value: Value) -> ChatMessage {
        serde_json::from_value(value).expect("fixture message decodes")
    }

    fn inputs(prompt_caching: bool) -> PromptInputs<'static> {
        PromptInputs {
            model_id: "gpt-4o",
            minimal_style: false,
            prompt_caching,
            replace_history_xml: false,
            xml: "",
            previous_xml: None,
            mode: ToolMode::DiagramNormal,
            research_summary: None,
        }
    }

    fn file_part(payload_len: usize) -> Value {
        json!({"type": "file", "mediaType": "image/png",
               "url": format!("data:image/png;base64,{}", "A".repeat(payload_len))})
    }

    #[test]
    fn six_files_are_rejected() {
        let parts: Vec<Value> = (0..6).map(|_| file_part(8)).collect();
        let last = message(json!({"role": "user", "parts": parts}));
        assert_eq!(
            validate_attachments(Some(&last)),
            Err(ChatError::Validation("Too many files. Maximum 5 allowed.".to_string()))
        );
    }

    #[test]
    fn oversized_file_is_rejected() {
        // ceil(len * 3 / 4) must exceed 2 MiB.
        let len = MAX_FILE_BYTES / 3 * 4 + 8;
        let last = message(json!({"role": "user", "parts": [file_part(len)]}));
        assert_eq!(
            validate_attachments(Some(&last)),
            Err(ChatError::Validation("File exceeds 2MB limit.".to_string()))
        );
    }

    #[test]
    fn five_small_files_pass() {
        let parts: Vec<Value> = (0..5).map(|_| file_part(1024)).collect();
        let last = message(json!({"role": "user", "parts": parts}));
        assert_eq!(validate_attachments(Some(&last)), Ok(()));
        assert_eq!(validate_attachments(None), Ok(()));
    }

    #[test]
    fn remote_urls_are_not_size_checked() {
        assert_eq!(data_url_decoded_size("https://example.com/cat.png"), None);
        assert_eq!(data_url_decoded_size("data:image/png;base64,"), None);
        assert_eq!(data_url_decoded_size("data:image/png;base64,AAAAA"), Some(4));
    }

    #[test]
    fn unusable_history_tool_calls_are_dropped_with_their_results() {
        let history = vec![
            message(json!({"role": "user", "parts": [{"type": "text", "text": "draw"}]})),
            message(json!({"role": "assistant", "parts": [
                {"type": "tool-display_diagram", "toolCallId": "a", "input": {}, "output": "ok"},
                {"type": "tool-display_diagram", "toolCallId": "b", "input": "{\"xml\":",
                 "output": "ok"},
                {"type": "tool-call", "toolCallId": "c", "toolName": "edit_diagram"},
                {"type": "tool-display_diagram", "toolCallId": "d", "input": {"xml": "<a/>"},
                 "output": "ok"}
            ]})),
        ];

        let sanitized = sanitize_history(convert_history(&history), false);

        assert_eq!(sanitized.len(), 3);
        assert_eq!(
            sanitized[1].parts,
            vec![ContentPart::ToolCall {
                call_id: "d".to_string(),
                tool_name: "display_diagram".to_string(),
                input: json!({"xml": "<a/>"}),
            }]
        );
        assert_eq!(sanitized[2].role, Role::Tool);
        assert_eq!(sanitized[2].parts.len(), 1);
    }

    #[test]
    fn messages_left_empty_are_removed() {
        let history = vec![message(json!({"role": "assistant", "parts": [
            {"type": "reasoning", "text": "thinking"},
            {"type": "tool-call", "toolCallId": "x", "toolName": "display_diagram", "input": null}
        ]}))];

        assert!(sanitize_history(convert_history(&history), false).is_empty());
    }

    #[test]
    fn history_xml_replacement_is_opt_in() {
        let history = vec![message(json!({"role": "assistant", "parts": [
            {"type": "tool-call", "toolCallId": "a", "toolName": "display_diagram",
             "input": {"xml": "<a/>"}},
            {"type": "tool-call", "toolCallId": "b", "toolName": "append_diagram",
             "input": {"xml": "<b/>"}}
        ]}))];

        let kept = sanitize_history(convert_history(&history), false);
        let replaced = sanitize_history(convert_history(&history), true);

        let input_of = |message: &ModelMessage, index: usize| match &message.parts[index] {
            ContentPart::ToolCall { input, .. } => input.clone(),
            other => panic!("expected a tool call, got {other:?}"),
        };
        assert_eq!(input_of(&kept[0], 0), json!({"xml": "<a/>"}));
        assert_eq!(
            input_of(&replaced[0], 0),
            json!({"placeholder": HISTORY_XML_PLACEHOLDER})
        );
        assert_eq!(input_of(&replaced[0], 1), json!({"xml": "<b/>"}));
    }

    #[test]
    fn assemble_orders_system_blocks_before_history() {
        let history = vec![message(json!({"role": "user", "parts": [
            {"type": "text", "text": "draw a cat"},
            {"type": "file", "url": "data:image/png;base64,AAAA", "mediaType": "image/png"}
        ]}))];

        let assembled = assemble(&history, &inputs(false));

        assert_eq!(assembled.len(), 4);
        assert!(assembled[..3].iter().all(|message| message.role == Role::System));
        assert!(assembled[1].text().contains("AUTHORITATIVE"));
        assert!(assembled[2].text().contains("DIAGRAM / NORMAL"));
        assert_eq!(
            assembled[3].parts,
            vec![
                ContentPart::text("User input:\n\"\"\"md\ndraw a cat\n\"\"\""),
                ContentPart::File {
                    url: "data:image/png;base64,AAAA".to_string(),
                    media_type: Some("image/png".to_string()),
                },
            ]
        );
        assert!(assembled.iter().all(|message| !message.cache_breakpoint));
    }

    #[test]
    fn cache_breakpoints_mark_instructions_canvas_and_last_assistant() {
        let history = vec![
            message(json!({"role": "user", "parts": [{"type": "text", "text": "one"}]})),
            message(json!({"role": "assistant", "parts": [{"type": "text", "text": "first"}]})),
            message(json!({"role": "user", "parts": [{"type": "text", "text": "two"}]})),
            message(json!({"role": "assistant", "parts": [{"type": "text", "text": "second"}]})),
            message(json!({"role": "user", "parts": [{"type": "text", "text": "three"}]})),
        ];

        let assembled = assemble(&history, &inputs(true));
        let marked: Vec<usize> = assembled
            .iter()
            .enumerate()
            .filter(|(_, message)| message.cache_breakpoint)
            .map(|(index, _)| index)
            .collect();

        assert_eq!(marked, vec![0, 1, 6]);
        assert_eq!(assembled[6].text(), "second");
    }
}
