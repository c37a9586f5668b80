//! Mapping from provider-neutral messages and options to chat-completions JSON.

use completions_api::ChatCompletionRequest;
use diagram_provider::{
    ContentPart, GenerationRequest, ModelMessage, RequestOptions, Role, ToolDefinition,
};
use serde_json::{json, Map, Value};

/// Builds the wire request for one generation step.
pub(crate) fn build_chat_request(
    model_id: &str,
    request: &GenerationRequest,
    prompt_caching: bool,
) -> ChatCompletionRequest {
    let messages = request
        .messages
        .iter()
        .flat_map(|message| convert_message(message, prompt_caching))
        .collect();
    let tools = request.tools.iter().map(convert_tool).collect();

    let mut payload = ChatCompletionRequest::new(model_id, messages).with_tools(tools);
    apply_options(&mut payload, &request.options);
    payload
}

fn convert_tool(tool: &ToolDefinition) -> Value {
    let mut function = Map::new();
    function.insert("name".to_owned(), Value::String(tool.name.clone()));
    if let Some(description) = &tool.description {
        function.insert("description".to_owned(), Value::String(description.clone()));
    }
    function.insert("parameters".to_owned(), tool.input_schema.clone());

    json!({ "type": "function", "function": function })
}

/// One neutral message can expand into several wire messages: every tool
/// result becomes its own `tool` message.
fn convert_message(message: &ModelMessage, prompt_caching: bool) -> Vec<Value> {
    let mark_cache = prompt_caching && message.cache_breakpoint;

    match message.role {
        Role::System => vec![json!({
            "role": "system",
            "content": text_content(&message.text(), mark_cache),
        })],
        Role::User => vec![json!({
            "role": "user",
            "content": user_content(&message.parts, mark_cache),
        })],
        Role::Assistant => vec![assistant_message(message, mark_cache)],
        Role::Tool => message
            .parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::ToolResult {
                    call_id, output, ..
                } => Some(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": tool_output_text(output),
                })),
                _ => None,
            })
            .collect(),
    }
}

fn text_content(text: &str, mark_cache: bool) -> Value {
    if !mark_cache {
        return Value::String(text.to_owned());
    }
    json!([{
        "type": "text",
        "text": text,
        "cache_control": { "type": "ephemeral" },
    }])
}

fn user_content(parts: &[ContentPart], mark_cache: bool) -> Value {
    let mut content: Vec<Value> = parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
            ContentPart::File { url, media_type } => Some(file_part(url, media_type.as_deref())),
            _ => None,
        })
        .collect();

    if mark_cache {
        if let Some(Value::Object(last)) = content.last_mut() {
            last.insert("cache_control".to_owned(), json!({ "type": "ephemeral" }));
        }
    }

    Value::Array(content)
}

fn file_part(url: &str, media_type: Option<&str>) -> Value {
    let is_image = media_type.map_or(true, |media_type| media_type.starts_with("image/"));
    if is_image {
        json!({ "type": "image_url", "image_url": { "url": url } })
    } else {
        json!({ "type": "file", "file": { "file_data": url } })
    }
}

fn assistant_message(message: &ModelMessage, mark_cache: bool) -> Value {
    let text = message.text();
    let tool_calls: Vec<Value> = message
        .parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::ToolCall {
                call_id,
                tool_name,
                input,
            } => Some(json!({
                "id": call_id,
                "type": "function",
                "function": { "name": tool_name, "arguments": input.to_string() },
            })),
            _ => None,
        })
        .collect();

    let mut wire = Map::new();
    wire.insert("role".to_owned(), Value::String("assistant".to_owned()));
    let content = if text.is_empty() && !tool_calls.is_empty() {
        Value::Null
    } else {
        text_content(&text, mark_cache)
    };
    wire.insert("content".to_owned(), content);
    if !tool_calls.is_empty() {
        wire.insert("tool_calls".to_owned(), Value::Array(tool_calls));
    }
    Value::Object(wire)
}

fn tool_output_text(output: &Value) -> String {
    match output {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn apply_options(payload: &mut ChatCompletionRequest, options: &RequestOptions) {
    payload.max_tokens = options.max_output_tokens;
    payload.temperature = options.temperature;
    payload.top_p = options.top_p;
    payload.reasoning_effort = options.reasoning_effort.clone();
    payload.n = options.candidate_count;

    if let Some(top_k) = options.top_k {
        payload.extra.insert("top_k".to_owned(), json!(top_k));
    }

    // Gemini's compatibility layer takes thinking settings under `extra_body`.
    if let Some(thinking) = &options.thinking {
        let mut config = Map::new();
        config.insert(
            "include_thoughts".to_owned(),
            Value::Bool(thinking.include_thoughts),
        );
        if let Some(budget) = thinking.budget_tokens {
            config.insert("thinking_budget".to_owned(), json!(budget));
        }
        if let Some(level) = &thinking.level {
            config.insert("thinking_level".to_owned(), Value::String(level.clone()));
        }
        payload.extra.insert(
            "extra_body".to_owned(),
            json!({ "google": { "thinking_config": config } }),
        );
    }

    if let Some(summary) = &options.reasoning_summary {
        tracing::debug!(summary, "reasoning summary is not sent on chat completions");
    }
}

#[cfg(test)]
mod tests {
    use diagram_provider::ThinkingConfig;
    use pretty_assertions::assert_eq;

    use super::*;

    fn request(messages: Vec<ModelMessage>, options: RequestOptions) -> GenerationRequest {
        GenerationRequest {
            step: 1,
            messages,
            tools: vec![ToolDefinition {
                name: "display_diagram".to_owned(),
                description: Some("Show a diagram".to_owned()),
                input_schema: json!({"type": "object"}),
            }],
            options,
        }
    }

    #[test]
    fn cache_breakpoints_become_cache_control_only_when_enabled() {
        let messages = vec![
            ModelMessage::system("rules").with_cache_breakpoint(),
            ModelMessage::system("canvas"),
        ];

        let cached =
            build_chat_request("claude", &request(messages.clone(), Default::default()), true);
        assert_eq!(
            cached.messages[0]["content"],
            json!([{"type": "text", "text": "rules", "cache_control": {"type": "ephemeral"}}])
        );
        assert_eq!(cached.messages[1]["content"], json!("canvas"));

        let plain = build_chat_request("gpt-4o", &request(messages, Default::default()), false);
        assert_eq!(plain.messages[0]["content"], json!("rules"));
    }

    #[test]
    fn user_files_map_to_image_and_file_parts() {
        let message = ModelMessage::user(vec![
            ContentPart::text("look"),
            ContentPart::File {
                url: "data:image/png;base64,AAAA".to_owned(),
                media_type: Some("image/png".to_owned()),
            },
            ContentPart::File {
                url: "data:application/pdf;base64,AAAA".to_owned(),
                media_type: Some("application/pdf".to_owned()),
            },
        ]);

        let wire = build_chat_request("gpt-4o", &request(vec![message], Default::default()), false);
        let content = &wire.messages[0]["content"];
        assert_eq!(content[0], json!({"type": "text", "text": "look"}));
        assert_eq!(content[1]["type"], "image_url");
        assert_eq!(content[2]["type"], "file");
    }

    #[test]
    fn assistant_tool_calls_and_tool_results_round_out_history() {
        let messages = vec![
            ModelMessage::assistant(vec![ContentPart::ToolCall {
                call_id: "call_1".to_owned(),
                tool_name: "display_diagram".to_owned(),
                input: json!({"xml": "<mxCell id=\"2\"/>"}),
            }]),
            ModelMessage::tool(vec![ContentPart::ToolResult {
                call_id: "call_1".to_owned(),
                tool_name: "display_diagram".to_owned(),
                output: json!("ok"),
                is_error: false,
            }]),
        ];

        let wire = build_chat_request("gpt-4o", &request(messages, Default::default()), false);
        assert_eq!(wire.messages[0]["content"], Value::Null);
        assert_eq!(wire.messages[0]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            wire.messages[0]["tool_calls"][0]["function"]["arguments"],
            "{\"xml\":\"<mxCell id=\\\"2\\\"/>\"}"
        );
        assert_eq!(
            wire.messages[1],
            json!({"role": "tool", "tool_call_id": "call_1", "content": "ok"})
        );
    }

    #[test]
    fn options_map_to_wire_fields_and_google_thinking() {
        let options = RequestOptions {
            max_output_tokens: Some(4096),
            temperature: Some(0.5),
            candidate_count: Some(2),
            top_k: Some(40),
            thinking: Some(ThinkingConfig {
                include_thoughts: true,
                budget_tokens: Some(2048),
                level: None,
            }),
            ..RequestOptions::default()
        };

        let system_only = request(vec![ModelMessage::system("s")], options);
        let wire = build_chat_request("gemini-2.5-pro", &system_only, false);
        let body = serde_json::to_value(&wire).expect("serialize");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["n"], 2);
        assert_eq!(body["top_k"], 40);
        assert_eq!(
            body["extra_body"]["google"]["thinking_config"],
            json!({"include_thoughts": true, "thinking_budget": 2048})
        );
        assert_eq!(body["tools"][0]["function"]["name"], "display_diagram");
        assert_eq!(body["tool_choice"], "auto");
    }
}
