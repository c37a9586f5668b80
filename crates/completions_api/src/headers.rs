use std::collections::BTreeMap;

use crate::config::CompletionsApiConfig;
use crate::error::CompletionsApiError;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_GOOG_API_KEY: &str = "x-goog-api-key";
pub const HEADER_USER_AGENT: &str = "user-agent";

/// Authentication style of the target endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>` (OpenAI-compatible endpoints).
    Bearer,
    /// `x-goog-api-key: <key>` (native Gemini endpoints).
    GoogApiKey,
}

/// Build a deterministic header map for a transport request.
pub fn build_headers(
    config: &CompletionsApiConfig,
    scheme: AuthScheme,
    streaming: bool,
) -> Result<BTreeMap<String, String>, CompletionsApiError> {
    let api_key = config.api_key.trim();
    if api_key.is_empty() {
        return Err(CompletionsApiError::MissingApiKey);
    }

    let mut headers = BTreeMap::new();
    match scheme {
        AuthScheme::Bearer => {
            headers.insert(HEADER_AUTHORIZATION.to_owned(), format!("Bearer {api_key}"));
        }
        AuthScheme::GoogApiKey => {
            headers.insert(HEADER_GOOG_API_KEY.to_owned(), api_key.to_owned());
        }
    }

    let accept = if streaming {
        "text/event-stream"
    } else {
        "application/json"
    };
    headers.insert(HEADER_ACCEPT.to_owned(), accept.to_owned());
    headers.insert(
        HEADER_CONTENT_TYPE.to_owned(),
        "application/json".to_owned(),
    );

    let user_agent = config
        .user_agent
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(default_user_agent);
    headers.insert(HEADER_USER_AGENT.to_owned(), user_agent);

    for (key, value) in &config.extra_headers {
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_owned());
    }

    Ok(headers)
}

fn default_user_agent() -> String {
    format!(
        "clarify/{} ({}; {})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}
