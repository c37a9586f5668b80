//! Per-turn choice between plain diagramming and search-then-diagram.

use std::fmt;

use diagram_provider::{CancelSignal, ModelBackend, SearchRequest};
use serde_json::Value;

use crate::instructions::{search_fallback_note, search_prompt};

/// Lightweight model used for the grounded research call.
pub const SEARCH_MODEL_ID: &str = "gemini-2.5-flash-lite";

/// Lowercased substrings that suggest the user wants fresh external facts.
pub const SEARCH_KEYWORDS: [&str; 7] = [
    "search",
    "google",
    "latest",
    "news",
    "current event",
    "weather",
    "stock price",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolMode {
    DiagramNormal,
    DiagramWithResearch,
}

impl ToolMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DiagramNormal => "diagram-normal",
            Self::DiagramWithResearch => "diagram-with-research",
        }
    }
}

impl fmt::Display for ToolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads `x-search-enabled`. Any value other than `true` is an explicit no.
#[must_use]
pub fn search_intent_from_header(value: Option<&str>) -> Option<bool> {
    value.map(|value| value.trim() == "true")
}

#[must_use]
pub fn heuristic_search_intent(user_text: &str) -> bool {
    let lower = user_text.to_lowercase();
    SEARCH_KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}

/// Explicit signal beats the heuristic; search needs a capable provider.
#[must_use]
pub fn select_mode(signal: Option<bool>, user_text: &str, search_capable: bool) -> ToolMode {
    if !search_capable {
        return ToolMode::DiagramNormal;
    }
    let wants_search = signal.unwrap_or_else(|| heuristic_search_intent(user_text));
    if wants_search {
        ToolMode::DiagramWithResearch
    } else {
        ToolMode::DiagramNormal
    }
}

/// Output of the research step, handed to the mode instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Research {
    pub summary: String,
    pub grounding_metadata: Option<Value>,
    /// False when the summary is the fallback note.
    pub succeeded: bool,
}

/// Runs the grounded search call once. Never fails the turn.
pub fn run_research(backend: &dyn ModelBackend, user_text: &str, cancel: CancelSignal) -> Research {
    tracing::info!(model = SEARCH_MODEL_ID, "running research step");
    let request = SearchRequest {
        model_id: SEARCH_MODEL_ID.to_string(),
        prompt: search_prompt(user_text),
    };

    match backend.search(request, cancel) {
        Ok(result) if !result.summary.trim().is_empty() => {
            tracing::info!(summary_len = result.summary.len(), "research step complete");
            Research {
                summary: result.summary,
                grounding_metadata: result.grounding_metadata,
                succeeded: true,
            }
        }
        Ok(_) => {
            tracing::warn!("research step returned an empty summary");
            Research::fallback(user_text)
        }
        Err(error) => {
            tracing::warn!(%error, "research step failed");
            Research::fallback(user_text)
        }
    }
}

impl Research {
    /// Stand-in used when the research call fails or cannot be made.
    #[must_use]
    pub fn fallback(user_text: &str) -> Self {
        Self {
            summary: search_fallback_note(user_text),
            grounding_metadata: None,
            succeeded: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use diagram_provider::{BackendError, SearchResult};
    use diagram_provider_mock::{MockBackend, MockSearch};
    use pretty_assertions::assert_eq;

    use super::*;

    fn cancel() -> CancelSignal {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn header_parsing() {
        assert_eq!(search_intent_from_header(Some("true")), Some(true));
        assert_eq!(search_intent_from_header(Some("false")), Some(false));
        assert_eq!(search_intent_from_header(Some("yes")), Some(false));
        assert_eq!(search_intent_from_header(None), None);
    }

    #[test]
    fn explicit_false_overrides_keywords() {
        assert_eq!(
            select_mode(Some(false), "show me the latest news", true),
            ToolMode::DiagramNormal
        );
    }

    #[test]
    fn heuristic_applies_without_signal() {
        assert_eq!(
            select_mode(None, "What's the Weather in Oslo?", true),
            ToolMode::DiagramWithResearch
        );
        assert_eq!(select_mode(None, "draw a flowchart", true), ToolMode::DiagramNormal);
    }

    #[test]
    fn search_requires_capable_provider() {
        assert_eq!(select_mode(Some(true), "search", false), ToolMode::DiagramNormal);
        assert_eq!(select_mode(None, "latest news", false), ToolMode::DiagramNormal);
    }

    #[test]
    fn research_uses_search_model_and_prompt() {
        let backend = MockBackend::default().with_search(MockSearch::Answer(SearchResult {
            summary: "- Oslo: rain".to_string(),
            grounding_metadata: None,
        }));

        let research = run_research(&backend, "weather in Oslo", cancel());

        assert!(research.succeeded);
        assert_eq!(research.summary, "- Oslo: rain");
        assert_eq!(backend.search_calls(), 1);
        let request = &backend.search_requests()[0];
        assert_eq!(request.model_id, SEARCH_MODEL_ID);
        assert!(request.prompt.contains("\"weather in Oslo\""));
    }

    #[test]
    fn failed_research_becomes_fallback_note() {
        let backend = MockBackend::default()
            .with_search(MockSearch::Fail(BackendError::upstream(Some(503), "unavailable")));

        let research = run_research(&backend, "stock price of ACME", cancel());

        assert!(!research.succeeded);
        assert_eq!(
            research.summary,
            "[Search failed. Please proceed with general knowledge about: stock price of ACME]"
        );
    }

    #[test]
    fn empty_summary_becomes_fallback_note() {
        let backend = MockBackend::default().with_search(MockSearch::Answer(SearchResult {
            summary: "  ".to_string(),
            grounding_metadata: None,
        }));

        assert!(!run_research(&backend, "news", cancel()).succeeded);
    }
}
