use completions_api::{ChatCompletionRequest, CompletionsApiClient, CompletionsApiConfig};
use serde_json::json;

#[test]
fn payload_serializes_stream_options_and_skips_unset_fields() {
    let request = ChatCompletionRequest::new(
        "gpt-4o",
        vec![json!({"role": "user", "content": "hi"})],
    );

    let value = serde_json::to_value(&request).expect("serialize");
    assert_eq!(value["stream"], true);
    assert_eq!(value["stream_options"]["include_usage"], true);
    assert!(value.get("tools").is_none());
    assert!(value.get("tool_choice").is_none());
    assert!(value.get("temperature").is_none());
}

#[test]
fn payload_flattens_provider_extras_into_body() {
    let request = ChatCompletionRequest::new("gemini-2.5-pro", vec![json!({"role": "user"})])
        .insert_extra(
            "extra_body",
            json!({"google": {"thinking_config": {"include_thoughts": true}}}),
        );

    let value = serde_json::to_value(&request).expect("serialize");
    assert_eq!(
        value["extra_body"]["google"]["thinking_config"]["include_thoughts"],
        true
    );
}

#[test]
fn payload_with_tools_selects_auto_tool_choice() {
    let request = ChatCompletionRequest::new("gpt-4o", vec![json!({"role": "user"})])
        .with_tools(vec![json!({"type": "function", "function": {"name": "display_diagram"}})]);

    assert_eq!(request.tool_choice.as_deref(), Some("auto"));
}

#[test]
fn build_request_targets_completions_endpoint() {
    let config = CompletionsApiConfig::new("sk").with_base_url("https://openrouter.ai/api/v1");
    let client = CompletionsApiClient::new(config).expect("client");
    let request = ChatCompletionRequest::new("openai/gpt-4o", vec![json!({"role": "user"})]);

    let http_request = client
        .build_request(&request)
        .expect("build request")
        .build()
        .expect("request");

    assert_eq!(
        http_request.url().as_str(),
        "https://openrouter.ai/api/v1/chat/completions"
    );
    assert_eq!(http_request.method(), "POST");
}

#[test]
fn build_request_rejects_empty_messages() {
    let client = CompletionsApiClient::new(CompletionsApiConfig::new("sk")).expect("client");
    let request = ChatCompletionRequest::new("gpt-4o", Vec::new());

    let error = client.build_request(&request).expect_err("empty messages");
    assert!(error.to_string().contains("'messages'"));
}
