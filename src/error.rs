//! Request-level failures and their HTTP rendering.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use diagram_provider::BackendError;
use serde::Serialize;
use thiserror::Error;

pub const REDACTED_MESSAGE: &str = "Authentication failed. Please check your credentials.";

const SENSITIVE_MARKERS: [&str; 7] = [
    "key",
    "token",
    "sig",
    "signature",
    "secret",
    "password",
    "credential",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Missing or ambiguous provider setup. `client_supplied` marks problems
    /// with credentials the client sent itself.
    #[error("{message}")]
    Configuration {
        message: String,
        client_supplied: bool,
    },
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Authentication(String),
    #[error("{message}")]
    Upstream {
        status: Option<u16>,
        message: String,
        body: Option<String>,
    },
    #[error("The request exceeded the maximum duration of {0} seconds.")]
    Timeout(u64),
    #[error("{0}")]
    Internal(String),
}

impl ChatError {
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            client_supplied: false,
        }
    }

    #[must_use]
    pub fn client_configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            client_supplied: true,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Configuration {
                client_supplied: true,
                ..
            }
            | Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Configuration { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Upstream { status, .. } => status
                .and_then(|status| StatusCode::from_u16(status).ok())
                .filter(|status| status.is_client_error() || status.is_server_error())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Message safe to show outside the process.
    #[must_use]
    pub fn public_message(&self) -> String {
        redact(&self.to_string())
    }

    /// Full diagnostic text, only ever rendered in development mode.
    #[must_use]
    pub fn details(&self) -> String {
        match self {
            Self::Upstream {
                body: Some(body), ..
            } => format!("{self}\n{body}"),
            _ => self.to_string(),
        }
    }

    /// JSON error response; `details` is attached only when `development`.
    #[must_use]
    pub fn into_response_with(self, development: bool) -> Response {
        let status = self.status();
        let body = ErrorBody {
            error: self.public_message(),
            details: development.then(|| self.details()),
        };
        (status, Json(body)).into_response()
    }
}

impl From<BackendError> for ChatError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::Upstream {
                status: Some(401 | 403),
                message,
                ..
            } => Self::Authentication(message),
            BackendError::Upstream {
                status,
                message,
                body,
            } => Self::Upstream {
                status,
                message,
                body,
            },
            BackendError::Cancelled => Self::Internal("generation was cancelled".to_string()),
            BackendError::Transport(message) | BackendError::Unsupported(message) => {
                Self::Upstream {
                    status: None,
                    message,
                    body: None,
                }
            }
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        self.into_response_with(false)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

/// Failures of prompt enhancement. Messages are fixed and never carry
/// upstream detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnhanceError {
    #[error("Invalid or missing access code. Please configure it in Settings.")]
    AccessDenied,
    #[error("Google API key is not configured for prompt enhancement.")]
    NotConfigured,
    #[error("Invalid request body for prompt enhancement.")]
    InvalidBody,
    #[error("Failed to enhance prompt. Please try again.")]
    Failed,
}

impl EnhanceError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AccessDenied => StatusCode::UNAUTHORIZED,
            Self::InvalidBody => StatusCode::BAD_REQUEST,
            Self::NotConfigured | Self::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EnhanceError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            details: None,
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Replaces messages that mention credential-like words.
#[must_use]
pub fn redact(message: &str) -> String {
    let lower = message.to_lowercase();
    if SENSITIVE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        REDACTED_MESSAGE.to_string()
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_error_class() {
        assert_eq!(
            ChatError::configuration("no provider").status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ChatError::client_configuration("missing").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ChatError::Validation("bad".to_string()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ChatError::Timeout(120).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ChatError::Upstream {
                status: Some(429),
                message: "slow down".to_string(),
                body: None,
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ChatError::Upstream {
                status: None,
                message: "reset".to_string(),
                body: None,
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn upstream_success_status_still_maps_to_failure() {
        let error = ChatError::Upstream {
            status: Some(200),
            message: "stream ended early".to_string(),
            body: None,
        };
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn credential_words_are_redacted_case_insensitively() {
        assert_eq!(redact("Invalid API Key provided: sk-123"), REDACTED_MESSAGE);
        assert_eq!(redact("bad TOKEN"), REDACTED_MESSAGE);
        assert_eq!(redact("Password mismatch"), REDACTED_MESSAGE);
        let harmless = "Too many files. Maximum 5 allowed.";
        assert_eq!(redact(harmless), harmless);
    }

    #[test]
    fn backend_auth_failures_become_authentication_errors() {
        let error = ChatError::from(BackendError::upstream(Some(401), "Incorrect API key"));
        assert_eq!(error.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error.public_message(), REDACTED_MESSAGE);
    }

    #[test]
    fn enhance_errors_keep_fixed_messages() {
        assert_eq!(EnhanceError::NotConfigured.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(EnhanceError::InvalidBody.status(), StatusCode::BAD_REQUEST);
        assert_eq!(EnhanceError::AccessDenied.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            EnhanceError::NotConfigured.to_string(),
            "Google API key is not configured for prompt enhancement."
        );
    }

    #[test]
    fn upstream_details_include_body() {
        let error = ChatError::Upstream {
            status: Some(500),
            message: "overloaded".to_string(),
            body: Some("{\"error\":\"overloaded\"}".to_string()),
        };
        assert_eq!(error.details(), "overloaded\n{\"error\":\"overloaded\"}");
    }
}
