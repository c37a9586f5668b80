use completions_api::{normalize_completions_url, normalize_generate_content_url};

#[test]
fn url_normalization_keeps_existing_completions_endpoint() {
    assert_eq!(
        normalize_completions_url("https://openrouter.ai/api/v1/chat/completions"),
        "https://openrouter.ai/api/v1/chat/completions"
    );
}

#[test]
fn url_normalization_appends_completions_to_base() {
    assert_eq!(
        normalize_completions_url("https://api.openai.com/v1/"),
        "https://api.openai.com/v1/chat/completions"
    );
}

#[test]
fn url_normalization_uses_default_for_blank_base() {
    assert_eq!(
        normalize_completions_url("   "),
        "https://api.openai.com/v1/chat/completions"
    );
}

#[test]
fn generate_content_url_defaults_to_gemini_api() {
    assert_eq!(
        normalize_generate_content_url(None, "models/gemini-2.5-flash-lite"),
        "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash-lite:generateContent"
    );
    assert_eq!(
        normalize_generate_content_url(Some("http://127.0.0.1:9000/"), "gemini-2.5-flash"),
        "http://127.0.0.1:9000/models/gemini-2.5-flash:generateContent"
    );
}
