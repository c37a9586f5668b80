//! Native Gemini `generateContent` call with the `google_search` tool.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One grounded web-search request.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundedSearchRequest {
    pub model_id: String,
    pub prompt: String,
}

impl GroundedSearchRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
        }
    }

    /// Wire body for `models/{model}:generateContent`.
    pub fn to_body(&self) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{ "text": self.prompt }],
            }],
            "tools": [{ "google_search": {} }],
        })
    }
}

/// Concatenated answer text plus the raw grounding metadata, if any.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroundedSearchResponse {
    pub text: String,
    pub grounding_metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    grounding_metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

impl GroundedSearchResponse {
    /// Parse a `generateContent` response body. Only the first candidate counts.
    pub fn from_body(body: &str) -> Result<Self, serde_json::Error> {
        let response = serde_json::from_str::<GenerateContentResponse>(body)?;
        let Some(candidate) = response.candidates.into_iter().next() else {
            return Ok(Self::default());
        };

        let text = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter(|part| !part.thought)
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default();

        Ok(Self {
            text,
            grounding_metadata: candidate
                .grounding_metadata
                .filter(|metadata| !metadata.is_null()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_text_parts_and_skips_thoughts() {
        let body = r#"{
            "candidates": [{
                "content": {"parts": [
                    {"text": "plan", "thought": true},
                    {"text": "Sunny, "},
                    {"text": "22C"}
                ]},
                "groundingMetadata": {"webSearchQueries": ["weather paris"]}
            }]
        }"#;

        let response = GroundedSearchResponse::from_body(body).expect("parse");
        assert_eq!(response.text, "Sunny, 22C");
        assert_eq!(
            response.grounding_metadata,
            Some(json!({"webSearchQueries": ["weather paris"]}))
        );
    }

    #[test]
    fn empty_candidates_produce_empty_text() {
        let response = GroundedSearchResponse::from_body(r#"{"candidates": []}"#).expect("parse");
        assert_eq!(response, GroundedSearchResponse::default());
    }

    #[test]
    fn request_body_enables_google_search_tool() {
        let body = GroundedSearchRequest::new("gemini-2.5-flash-lite", "latest news").to_body();
        assert_eq!(body["tools"][0], json!({"google_search": {}}));
        assert_eq!(body["contents"][0]["parts"][0]["text"], "latest news");
    }
}
