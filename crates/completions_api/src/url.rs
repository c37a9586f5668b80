/// Default base URL for OpenAI-compatible requests.
pub const DEFAULT_COMPLETIONS_BASE_URL: &str = "https://api.openai.com/v1";
/// Default base URL for native Gemini requests.
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Normalize a base URL to a chat-completions endpoint.
///
/// Keeps `/chat/completions` unchanged, otherwise appends it.
pub fn normalize_completions_url(input: &str) -> String {
    let base = if input.trim().is_empty() {
        DEFAULT_COMPLETIONS_BASE_URL
    } else {
        input.trim()
    };

    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        return trimmed.to_string();
    }
    format!("{trimmed}/chat/completions")
}

/// Build the native Gemini `generateContent` endpoint for `model_id`.
pub fn normalize_generate_content_url(input: Option<&str>, model_id: &str) -> String {
    let base = input
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_GEMINI_BASE_URL)
        .trim_end_matches('/');
    let model = model_id.trim().trim_start_matches("models/");
    format!("{base}/models/{model}:generateContent")
}
