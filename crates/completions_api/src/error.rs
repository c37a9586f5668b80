use std::fmt;

pub use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{Error as JsonError, Value};

#[derive(Debug)]
pub enum CompletionsApiError {
    MissingApiKey,
    InvalidHeader(String),
    InvalidRequestPayload(String),
    Request(reqwest::Error),
    Status {
        status: StatusCode,
        message: String,
        body: String,
    },
    Serde(JsonError),
    RetryExhausted {
        status: Option<StatusCode>,
        last_error: Option<String>,
    },
    StreamFailed {
        code: Option<String>,
        message: String,
    },
    Cancelled,
    Unknown(String),
}

impl CompletionsApiError {
    /// HTTP status reported by the upstream API, when there was one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::RetryExhausted { status, .. } => *status,
            Self::Request(error) => error.status(),
            _ => None,
        }
    }
}

/// Error envelope shared by OpenAI, OpenRouter, and Gemini.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorEnvelope {
    Single(ErrorPayload),
    // Gemini occasionally wraps the payload in a one-element array.
    List(Vec<ErrorPayload>),
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorPayload {
    #[serde(rename = "error")]
    pub value: Option<ErrorPayloadFields>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorPayloadFields {
    pub message: Option<String>,
    /// String for OpenAI-style errors, number for Gemini.
    pub code: Option<Value>,
    #[serde(rename = "type")]
    pub type_: Option<String>,
    pub status: Option<String>,
}

impl ErrorPayloadFields {
    fn code_text(&self) -> Option<String> {
        match &self.code {
            Some(Value::String(code)) => non_empty_string(code).map(str::to_owned),
            Some(Value::Number(code)) => Some(code.to_string()),
            _ => None,
        }
    }

    pub fn rate_limit_message(&self, status: StatusCode) -> Option<String> {
        let code = self
            .code_text()
            .or_else(|| self.type_.as_deref().and_then(non_empty_string).map(str::to_owned))
            .or_else(|| self.status.as_deref().and_then(non_empty_string).map(str::to_owned))
            .unwrap_or_default();
        if !matches_rate_limit(&code, status) {
            return None;
        }

        let detail = self
            .message
            .as_deref()
            .and_then(non_empty_string)
            .map(|message| format!(" {message}"))
            .unwrap_or_default();
        Some(format!("Rate limit reached for this model.{detail}"))
    }

    pub fn message_or_fallback(&self) -> Option<String> {
        self.message
            .as_deref()
            .and_then(non_empty_string)
            .map(str::to_owned)
    }
}

impl fmt::Display for CompletionsApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingApiKey => write!(f, "API key is required"),
            Self::InvalidHeader(message) => write!(f, "invalid header: {message}"),
            Self::InvalidRequestPayload(message) => {
                write!(f, "invalid request payload: {message}")
            }
            Self::Request(error) => write!(f, "request error: {error}"),
            Self::Status {
                status, message, ..
            } => write!(f, "HTTP {status} {message}"),
            Self::Serde(error) => write!(f, "serialization error: {error}"),
            Self::RetryExhausted { status, last_error } => {
                let status = status
                    .map(|status| status.as_u16().to_string())
                    .unwrap_or_else(|| "n/a".to_owned());
                write!(
                    f,
                    "retry exhausted after max attempts (status: {status}, last_error: {last_error:?})"
                )
            }
            Self::StreamFailed { code, message } => match code {
                Some(code) if !code.trim().is_empty() => {
                    write!(f, "stream failed ({code}): {message}")
                }
                _ => write!(f, "stream failed: {message}"),
            },
            Self::Cancelled => write!(f, "request was cancelled"),
            Self::Unknown(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for CompletionsApiError {}

impl From<reqwest::Error> for CompletionsApiError {
    fn from(error: reqwest::Error) -> Self {
        Self::Request(error)
    }
}

impl From<JsonError> for CompletionsApiError {
    fn from(error: JsonError) -> Self {
        Self::Serde(error)
    }
}

/// Extract a human-readable message from an upstream error body.
pub fn parse_error_message(status: StatusCode, body: &str) -> String {
    let fields = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope::Single(payload)) => payload.value,
        Ok(ErrorEnvelope::List(payloads)) => payloads.into_iter().find_map(|payload| payload.value),
        Err(_) => None,
    };

    if let Some(error) = fields {
        if let Some(message) = error.rate_limit_message(status) {
            return message;
        }
        if let Some(message) = error.message_or_fallback() {
            return message;
        }
    }

    if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        body.to_string()
    }
}

pub(crate) fn has_rate_limit_message(message: &str) -> bool {
    message.starts_with("Rate limit reached")
}

fn matches_rate_limit(code: &str, status: StatusCode) -> bool {
    matches!(status, StatusCode::TOO_MANY_REQUESTS)
        || code.eq_ignore_ascii_case("rate_limit_exceeded")
        || code.eq_ignore_ascii_case("insufficient_quota")
        || code.eq_ignore_ascii_case("RESOURCE_EXHAUSTED")
}

fn non_empty_string(value: &str) -> Option<&str> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
