//! Deterministic mock implementation of the shared `diagram_provider` contract.
//!
//! Steps are scripted up front. When a turn asks for more steps than the script
//! holds, the last scripted step repeats, which lets tests model a backend that
//! never stops requesting tools.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use diagram_provider::{
    BackendError, BackendProfile, CancelSignal, FinishReason, GenerationRequest, ModelBackend,
    SearchRequest, SearchResult, StepOutcome, StreamPart, Usage,
};
use serde_json::json;

/// Stable provider identifier used for explicit server selection.
pub const MOCK_PROVIDER_ID: &str = "mock";

/// One scripted generation step.
#[derive(Debug, Clone, PartialEq)]
pub struct MockStep {
    pub parts: Vec<StreamPart>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl MockStep {
    /// A step that streams `text` in word-sized chunks and stops.
    #[must_use]
    pub fn text(text: &str) -> Self {
        Self {
            parts: chunk_words(text)
                .into_iter()
                .map(|text| StreamPart::TextDelta { text })
                .collect(),
            finish_reason: FinishReason::Stop,
            usage: Usage {
                input_tokens: 12,
                output_tokens: 8,
                cached_input_tokens: 0,
            },
        }
    }

    /// A step that streams one tool call with the given raw input text.
    #[must_use]
    pub fn tool_call(call_id: &str, tool_name: &str, raw_input: &str) -> Self {
        let mut parts = vec![StreamPart::ToolInputStart {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
        }];
        parts.extend(chunk_words(raw_input).into_iter().map(|delta| {
            StreamPart::ToolInputDelta {
                call_id: call_id.to_string(),
                delta,
            }
        }));
        parts.push(StreamPart::ToolCall {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            input: raw_input.to_string(),
        });

        Self {
            parts,
            finish_reason: FinishReason::ToolCalls,
            usage: Usage {
                input_tokens: 20,
                output_tokens: 40,
                cached_input_tokens: 0,
            },
        }
    }

    /// Streams `self` then `next` in one step, finishing like `next`.
    #[must_use]
    pub fn followed_by(mut self, next: MockStep) -> Self {
        self.parts.extend(next.parts);
        self.finish_reason = next.finish_reason;
        self.usage.add(next.usage);
        self
    }

    #[must_use]
    pub fn with_finish_reason(mut self, finish_reason: FinishReason) -> Self {
        self.finish_reason = finish_reason;
        self
    }

    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }
}

/// Scripted outcome for grounded search calls.
#[derive(Debug, Clone, PartialEq)]
pub enum MockSearch {
    Answer(SearchResult),
    Fail(BackendError),
}

/// Deterministic mock backend used by pipeline tests and local runs.
#[derive(Debug)]
pub struct MockBackend {
    model_id: String,
    steps: Vec<MockStep>,
    search: MockSearch,
    supports_prompt_caching: bool,
    supports_grounded_search: bool,
    generate_calls: AtomicUsize,
    search_calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
    search_requests: Mutex<Vec<SearchRequest>>,
}

impl MockBackend {
    #[must_use]
    pub fn new(steps: Vec<MockStep>) -> Self {
        Self {
            model_id: "mock".to_string(),
            steps,
            search: MockSearch::Answer(SearchResult {
                summary: "- mock finding one\n- mock finding two".to_string(),
                grounding_metadata: Some(json!({"webSearchQueries": ["mock"]})),
            }),
            supports_prompt_caching: false,
            supports_grounded_search: false,
            generate_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            search_requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        let model_id = model_id.into();
        if !model_id.trim().is_empty() {
            self.model_id = model_id.trim().to_string();
        }
        self
    }

    #[must_use]
    pub fn with_search(mut self, search: MockSearch) -> Self {
        self.search = search;
        self
    }

    #[must_use]
    pub fn with_prompt_caching(mut self, enabled: bool) -> Self {
        self.supports_prompt_caching = enabled;
        self
    }

    #[must_use]
    pub fn with_grounded_search(mut self, enabled: bool) -> Self {
        self.supports_grounded_search = enabled;
        self
    }

    /// Number of `generate` calls observed so far.
    #[must_use]
    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    /// Number of `search` calls observed so far.
    #[must_use]
    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    /// Requests received by `generate`, in call order.
    #[must_use]
    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    #[must_use]
    pub fn search_requests(&self) -> Vec<SearchRequest> {
        lock_unpoisoned(&self.search_requests).clone()
    }

    fn step_for_call(&self, call_index: usize) -> MockStep {
        self.steps
            .get(call_index)
            .or_else(|| self.steps.last())
            .cloned()
            .unwrap_or_else(|| MockStep::text(""))
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(vec![MockStep::text("Here is a small two-step flow. ").followed_by(
            MockStep::tool_call(
                "mock-call-1",
                "display_diagram",
                r#"{"xml":"<mxCell id=\"2\" value=\"Start\" style=\"rounded=1;\" vertex=\"1\" parent=\"1\"><mxGeometry x=\"40\" y=\"40\" width=\"120\" height=\"40\" as=\"geometry\"/></mxCell><mxCell id=\"3\" value=\"Done\" style=\"rounded=1;\" vertex=\"1\" parent=\"1\"><mxGeometry x=\"240\" y=\"40\" width=\"120\" height=\"40\" as=\"geometry\"/></mxCell><mxCell id=\"4\" edge=\"1\" parent=\"1\" source=\"2\" target=\"3\"><mxGeometry relative=\"1\" as=\"geometry\"/></mxCell>"}"#,
            ),
        )])
    }
}

impl ModelBackend for MockBackend {
    fn profile(&self) -> BackendProfile {
        BackendProfile {
            provider_id: MOCK_PROVIDER_ID.to_string(),
            model_id: self.model_id.clone(),
            supports_prompt_caching: self.supports_prompt_caching,
            supports_grounded_search: self.supports_grounded_search,
        }
    }

    fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(StreamPart),
    ) -> Result<StepOutcome, BackendError> {
        let call_index = self.generate_calls.fetch_add(1, Ordering::SeqCst);
        lock_unpoisoned(&self.requests).push(request);

        let step = self.step_for_call(call_index);
        for part in step.parts {
            if cancel.load(Ordering::SeqCst) {
                return Err(BackendError::Cancelled);
            }
            emit(part);
        }

        if cancel.load(Ordering::SeqCst) {
            return Err(BackendError::Cancelled);
        }

        Ok(StepOutcome {
            finish_reason: step.finish_reason,
            usage: step.usage,
            provider_metadata: None,
        })
    }

    fn search(
        &self,
        request: SearchRequest,
        cancel: CancelSignal,
    ) -> Result<SearchResult, BackendError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        lock_unpoisoned(&self.search_requests).push(request);

        if cancel.load(Ordering::SeqCst) {
            return Err(BackendError::Cancelled);
        }

        match &self.search {
            MockSearch::Answer(result) => Ok(result.clone()),
            MockSearch::Fail(error) => Err(error.clone()),
        }
    }
}

fn chunk_words(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut pending = String::new();
    for ch in text.chars() {
        pending.push(ch);
        if matches!(ch, ' ' | '\n') {
            chunks.push(std::mem::take(&mut pending));
        }
    }
    if !pending.is_empty() {
        chunks.push(pending);
    }
    chunks
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
