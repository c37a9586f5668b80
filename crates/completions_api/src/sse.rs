use serde_json::Value;

use crate::events::{CompletionFinishReason, CompletionStreamEvent, CompletionUsage};

/// Incremental parser for chat-completions SSE streams.
#[derive(Debug, Default)]
pub struct SseStreamParser {
    buffer: String,
    done: bool,
}

impl SseStreamParser {
    /// Feed arbitrary bytes into the parser and drain complete events.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<CompletionStreamEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace("\r\n", "\n");
        }
        let mut events = Vec::new();

        while let Some(split) = self.buffer.find("\n\n") {
            let frame = self.buffer[..split].to_string();
            self.buffer.drain(0..split + 2);

            let Some(payload) = extract_data_payload(&frame) else {
                continue;
            };
            if payload == "[DONE]" {
                self.done = true;
                continue;
            }

            if let Ok(value) = serde_json::from_str::<Value>(&payload) {
                events.extend(map_chunk(&value));
            }
        }

        events
    }

    /// Parse a complete SSE payload string in one shot.
    pub fn parse_frames(input: &str) -> Vec<CompletionStreamEvent> {
        let mut parser = Self::default();
        parser.feed(input.as_bytes())
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.trim().is_empty()
    }

    /// True once the `[DONE]` sentinel has been observed.
    pub fn saw_done(&self) -> bool {
        self.done
    }
}

fn extract_data_payload(frame: &str) -> Option<String> {
    let data_lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .collect();

    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

fn map_chunk(value: &Value) -> Vec<CompletionStreamEvent> {
    let mut events = Vec::new();

    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(|code| match code {
            Value::String(code) => Some(code.clone()),
            Value::Number(code) => Some(code.to_string()),
            _ => None,
        });
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        events.push(CompletionStreamEvent::Error { code, message });
        return events;
    }

    // Only the first choice is consumed; `n > 1` candidates are ignored.
    if let Some(choice) = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
    {
        if let Some(delta) = choice.get("delta") {
            map_delta(delta, &mut events);
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            events.push(CompletionStreamEvent::Finished {
                reason: CompletionFinishReason::parse(reason),
            });
        }
    }

    if let Some(usage) = value.get("usage").filter(|usage| usage.is_object()) {
        events.push(CompletionStreamEvent::Usage {
            usage: map_usage(usage),
        });
    }

    events
}

fn map_delta(delta: &Value, events: &mut Vec<CompletionStreamEvent>) {
    // OpenRouter and DeepSeek-style gateways use `reasoning`, others `reasoning_content`.
    let reasoning = delta
        .get("reasoning_content")
        .or_else(|| delta.get("reasoning"))
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty());
    if let Some(text) = reasoning {
        events.push(CompletionStreamEvent::ReasoningDelta {
            delta: text.to_owned(),
        });
    }

    if let Some(text) = delta
        .get("content")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
    {
        events.push(CompletionStreamEvent::ContentDelta {
            delta: text.to_owned(),
        });
    }

    let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) else {
        return;
    };

    for (position, call) in tool_calls.iter().enumerate() {
        let index = call
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|index| u32::try_from(index).ok())
            .unwrap_or(position as u32);
        let function = call.get("function");
        let name = function
            .and_then(|function| function.get("name"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(ToString::to_string);
        // Some gateways send already-parsed objects instead of argument text.
        let arguments = match function.and_then(|function| function.get("arguments")) {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        events.push(CompletionStreamEvent::ToolCallDelta {
            index,
            id: call
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(ToString::to_string),
            name,
            arguments,
        });
    }
}

fn map_usage(usage: &Value) -> CompletionUsage {
    let read = |value: Option<&Value>| value.and_then(Value::as_u64).unwrap_or(0);

    CompletionUsage {
        prompt_tokens: read(usage.get("prompt_tokens")),
        completion_tokens: read(usage.get("completion_tokens")),
        cached_tokens: read(
            usage
                .get("prompt_tokens_details")
                .and_then(|details| details.get("cached_tokens")),
        ),
    }
}
