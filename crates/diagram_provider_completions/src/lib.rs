//! Chat-completions implementation of the shared `diagram_provider` contract.
//!
//! This adapter translates `completions_api` stream events into ordered
//! `StreamPart`s. Tool-call argument fragments are relayed as they arrive and
//! the assembled raw argument text is emitted once the stream ends; parsing
//! and repairing that text is left to the pipeline.

mod convert;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use completions_api::{
    ChatCompletionRequest, CompletionFinishReason, CompletionStreamEvent, CompletionUsage,
    CompletionsApiClient, CompletionsApiConfig, CompletionsApiError, GroundedSearchRequest,
    GroundedSearchResponse,
};
use diagram_provider::{
    BackendError, BackendInitError, BackendProfile, CancelSignal, FinishReason,
    GenerationRequest, ModelBackend, SearchRequest, SearchResult, StepOutcome, StreamPart, Usage,
};

/// Runtime configuration for one completions-backed model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionsBackendConfig {
    pub provider_id: String,
    pub model_id: String,
    pub api_key: String,
    pub base_url: Option<String>,
    pub search_base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub prompt_caching: bool,
    pub grounded_search: bool,
    pub extra_headers: BTreeMap<String, String>,
}

impl CompletionsBackendConfig {
    #[must_use]
    pub fn new(
        provider_id: impl Into<String>,
        model_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            model_id: model_id.into(),
            api_key: api_key.into(),
            base_url: None,
            search_base_url: None,
            timeout: None,
            prompt_caching: false,
            grounded_search: false,
            extra_headers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_search_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.search_base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_prompt_caching(mut self, enabled: bool) -> Self {
        self.prompt_caching = enabled;
        self
    }

    #[must_use]
    pub fn with_grounded_search(mut self, enabled: bool) -> Self {
        self.grounded_search = enabled;
        self
    }

    #[must_use]
    pub fn insert_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(key.into(), value.into());
        self
    }

    fn to_api_config(&self) -> CompletionsApiConfig {
        let mut config = CompletionsApiConfig::new(self.api_key.clone());

        if let Some(base_url) = &self.base_url {
            config = config.with_base_url(base_url.clone());
        }

        if let Some(search_base_url) = &self.search_base_url {
            config = config.with_search_base_url(search_base_url.clone());
        }

        if let Some(timeout) = self.timeout {
            config = config.with_timeout(timeout);
        }

        for (key, value) in &self.extra_headers {
            config = config.insert_header(key.clone(), value.clone());
        }

        config
    }
}

trait StreamClient: Send + Sync {
    fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancel: &CancelSignal,
        on_event: &mut dyn FnMut(CompletionStreamEvent),
    ) -> Result<Option<CompletionFinishReason>, CompletionsApiError>;

    fn grounded_search(
        &self,
        request: &GroundedSearchRequest,
        cancel: &CancelSignal,
    ) -> Result<GroundedSearchResponse, CompletionsApiError>;
}

#[derive(Debug)]
struct DefaultStreamClient {
    client: CompletionsApiClient,
}

impl DefaultStreamClient {
    fn runtime() -> Result<tokio::runtime::Runtime, CompletionsApiError> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|error| {
                CompletionsApiError::Unknown(format!("failed to initialize tokio runtime: {error}"))
            })
    }
}

impl StreamClient for DefaultStreamClient {
    fn stream(
        &self,
        request: &ChatCompletionRequest,
        cancel: &CancelSignal,
        on_event: &mut dyn FnMut(CompletionStreamEvent),
    ) -> Result<Option<CompletionFinishReason>, CompletionsApiError> {
        Self::runtime()?.block_on(self.client.stream_with_handler(
            request,
            Some(cancel),
            |event| on_event(event),
        ))
    }

    fn grounded_search(
        &self,
        request: &GroundedSearchRequest,
        cancel: &CancelSignal,
    ) -> Result<GroundedSearchResponse, CompletionsApiError> {
        Self::runtime()?.block_on(self.client.grounded_search(request, Some(cancel)))
    }
}

/// `ModelBackend` adapter backed by `completions_api` transport primitives.
pub struct CompletionsBackend {
    config: CompletionsBackendConfig,
    stream_client: Arc<dyn StreamClient>,
}

impl CompletionsBackend {
    /// Creates a backend using real HTTP transport.
    pub fn new(config: CompletionsBackendConfig) -> Result<Self, BackendInitError> {
        if config.model_id.trim().is_empty() {
            return Err(BackendInitError::new(format!(
                "Failed to initialize {} backend: model id is required",
                config.provider_id
            )));
        }

        let client = CompletionsApiClient::new(config.to_api_config()).map_err(|error| {
            BackendInitError::new(format!(
                "Failed to initialize {} backend: {error}",
                config.provider_id
            ))
        })?;

        Ok(Self {
            config,
            stream_client: Arc::new(DefaultStreamClient { client }),
        })
    }

    #[cfg(test)]
    fn with_stream_client_for_tests(
        config: CompletionsBackendConfig,
        stream_client: Arc<dyn StreamClient>,
    ) -> Self {
        Self {
            config,
            stream_client,
        }
    }
}

impl ModelBackend for CompletionsBackend {
    fn profile(&self) -> BackendProfile {
        BackendProfile {
            provider_id: self.config.provider_id.clone(),
            model_id: self.config.model_id.clone(),
            supports_prompt_caching: self.config.prompt_caching,
            supports_grounded_search: self.config.grounded_search,
        }
    }

    fn generate(
        &self,
        request: GenerationRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(StreamPart),
    ) -> Result<StepOutcome, BackendError> {
        if cancel.load(Ordering::Acquire) {
            return Err(BackendError::Cancelled);
        }

        let payload = convert::build_chat_request(
            &self.config.model_id,
            &request,
            self.config.prompt_caching,
        );
        let mut calls = ToolCallAssembler::default();
        let mut usage = Usage::default();

        let finish = self
            .stream_client
            .stream(&payload, &cancel, &mut |event| match event {
                CompletionStreamEvent::ContentDelta { delta } => {
                    emit(StreamPart::TextDelta { text: delta });
                }
                CompletionStreamEvent::ReasoningDelta { delta } => {
                    emit(StreamPart::ReasoningDelta { text: delta });
                }
                CompletionStreamEvent::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments,
                } => calls.push_fragment(index, id, name, arguments, &mut *emit),
                CompletionStreamEvent::Usage { usage: reported } => {
                    usage = map_usage(reported);
                }
                CompletionStreamEvent::Finished { .. } | CompletionStreamEvent::Error { .. } => {}
            })
            .map_err(map_api_error)?;

        let had_tool_calls = calls.finish(emit);
        let finish_reason = map_finish_reason(finish, had_tool_calls);
        tracing::debug!(
            provider = %self.config.provider_id,
            model = %self.config.model_id,
            step = request.step,
            finish_reason = finish_reason.as_str(),
            "completions step finished"
        );

        Ok(StepOutcome {
            finish_reason,
            usage,
            provider_metadata: None,
        })
    }

    fn search(
        &self,
        request: SearchRequest,
        cancel: CancelSignal,
    ) -> Result<SearchResult, BackendError> {
        if !self.config.grounded_search {
            return Err(BackendError::Unsupported(format!(
                "provider '{}' has no grounded search",
                self.config.provider_id
            )));
        }
        if cancel.load(Ordering::Acquire) {
            return Err(BackendError::Cancelled);
        }

        let response = self
            .stream_client
            .grounded_search(
                &GroundedSearchRequest::new(request.model_id, request.prompt),
                &cancel,
            )
            .map_err(map_api_error)?;

        Ok(SearchResult {
            summary: response.text,
            grounding_metadata: response.grounding_metadata,
        })
    }
}

#[derive(Debug, Default)]
struct PendingToolCall {
    call_id: Option<String>,
    tool_name: Option<String>,
    arguments: String,
    started: bool,
}

/// Collects tool-call fragments keyed by stream index.
#[derive(Debug, Default)]
struct ToolCallAssembler {
    calls: BTreeMap<u32, PendingToolCall>,
}

impl ToolCallAssembler {
    fn push_fragment(
        &mut self,
        index: u32,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
        emit: &mut dyn FnMut(StreamPart),
    ) {
        let call = self.calls.entry(index).or_default();
        if call.call_id.is_none() {
            call.call_id = id;
        }
        if call.tool_name.is_none() {
            call.tool_name = name;
        }
        call.arguments.push_str(&arguments);

        if !call.started {
            // Arguments seen before the name are replayed as one delta.
            let Some(tool_name) = call.tool_name.clone() else {
                return;
            };
            let call_id = call_id_or_generated(&mut call.call_id);
            call.started = true;
            emit(StreamPart::ToolInputStart {
                call_id: call_id.clone(),
                tool_name,
            });
            if !call.arguments.is_empty() {
                emit(StreamPart::ToolInputDelta {
                    call_id,
                    delta: call.arguments.clone(),
                });
            }
            return;
        }

        if !arguments.is_empty() {
            emit(StreamPart::ToolInputDelta {
                call_id: call_id_or_generated(&mut call.call_id),
                delta: arguments,
            });
        }
    }

    /// Emits completed calls in index order. Returns whether any call was seen.
    fn finish(self, emit: &mut dyn FnMut(StreamPart)) -> bool {
        let mut any = false;
        for (index, mut call) in self.calls {
            let Some(tool_name) = call.tool_name.take() else {
                tracing::warn!(index, "dropping tool call fragment without a tool name");
                continue;
            };
            any = true;
            emit(StreamPart::ToolCall {
                call_id: call_id_or_generated(&mut call.call_id),
                tool_name,
                input: call.arguments,
            });
        }
        any
    }
}

fn call_id_or_generated(call_id: &mut Option<String>) -> String {
    call_id
        .get_or_insert_with(|| format!("call_{}", uuid::Uuid::new_v4().simple()))
        .clone()
}

fn map_finish_reason(
    reason: Option<CompletionFinishReason>,
    had_tool_calls: bool,
) -> FinishReason {
    // Gemini's compatibility layer reports `stop` even when it issued tool calls.
    if had_tool_calls && matches!(reason, None | Some(CompletionFinishReason::Stop)) {
        return FinishReason::ToolCalls;
    }
    match reason {
        Some(CompletionFinishReason::Stop) => FinishReason::Stop,
        Some(CompletionFinishReason::Length) => FinishReason::Length,
        Some(CompletionFinishReason::ToolCalls) => FinishReason::ToolCalls,
        Some(CompletionFinishReason::ContentFilter) => FinishReason::ContentFilter,
        Some(CompletionFinishReason::Error) => FinishReason::Error,
        None => FinishReason::Other,
    }
}

fn map_usage(usage: CompletionUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens.saturating_sub(usage.cached_tokens),
        output_tokens: usage.completion_tokens,
        cached_input_tokens: usage.cached_tokens,
    }
}

fn map_api_error(error: CompletionsApiError) -> BackendError {
    match error {
        CompletionsApiError::Cancelled => BackendError::Cancelled,
        CompletionsApiError::Status {
            status,
            message,
            body,
        } => BackendError::Upstream {
            status: Some(status.as_u16()),
            message,
            body: Some(body),
        },
        CompletionsApiError::RetryExhausted { status, last_error } => BackendError::Upstream {
            status: status.map(|status| status.as_u16()),
            message: last_error.unwrap_or_else(|| "request failed after retries".to_owned()),
            body: None,
        },
        CompletionsApiError::StreamFailed { code, message } => BackendError::Upstream {
            status: code.as_deref().and_then(|code| code.parse::<u16>().ok()),
            message,
            body: None,
        },
        CompletionsApiError::MissingApiKey => {
            BackendError::upstream(Some(401), CompletionsApiError::MissingApiKey.to_string())
        }
        other => BackendError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::{Mutex, MutexGuard};

    use completions_api::GroundedSearchResponse;
    use diagram_provider::{ContentPart, ModelMessage, RequestOptions};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    enum FakeOutcome {
        Stream(Vec<CompletionStreamEvent>, Option<CompletionFinishReason>),
        Search(GroundedSearchResponse),
        Error(CompletionsApiError),
    }

    struct FakeStreamClient {
        observed_model: Mutex<Option<String>>,
        outcome: Mutex<Option<FakeOutcome>>,
    }

    impl FakeStreamClient {
        fn new(outcome: FakeOutcome) -> Arc<Self> {
            Arc::new(Self {
                observed_model: Mutex::new(None),
                outcome: Mutex::new(Some(outcome)),
            })
        }

        fn observed_model(&self) -> Option<String> {
            lock_unpoisoned(&self.observed_model).clone()
        }
    }

    impl StreamClient for FakeStreamClient {
        fn stream(
            &self,
            request: &ChatCompletionRequest,
            _cancel: &CancelSignal,
            on_event: &mut dyn FnMut(CompletionStreamEvent),
        ) -> Result<Option<CompletionFinishReason>, CompletionsApiError> {
            *lock_unpoisoned(&self.observed_model) = Some(request.model.clone());

            match lock_unpoisoned(&self.outcome).take() {
                Some(FakeOutcome::Stream(events, finish)) => {
                    events.into_iter().for_each(|event| on_event(event));
                    Ok(finish)
                }
                Some(FakeOutcome::Error(error)) => Err(error),
                _ => panic!("fake stream outcome should be consumed exactly once"),
            }
        }

        fn grounded_search(
            &self,
            request: &GroundedSearchRequest,
            _cancel: &CancelSignal,
        ) -> Result<GroundedSearchResponse, CompletionsApiError> {
            *lock_unpoisoned(&self.observed_model) = Some(request.model_id.clone());

            match lock_unpoisoned(&self.outcome).take() {
                Some(FakeOutcome::Search(response)) => Ok(response),
                Some(FakeOutcome::Error(error)) => Err(error),
                _ => panic!("fake search outcome should be consumed exactly once"),
            }
        }
    }

    fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn backend(outcome: FakeOutcome) -> (CompletionsBackend, Arc<FakeStreamClient>) {
        let client = FakeStreamClient::new(outcome);
        let config = CompletionsBackendConfig::new("google", "gemini-2.5-flash", "key")
            .with_grounded_search(true);
        let backend = CompletionsBackend::with_stream_client_for_tests(
            config,
            Arc::clone(&client) as Arc<dyn StreamClient>,
        );
        (backend, client)
    }

    type Generated = (Vec<StreamPart>, Result<StepOutcome, BackendError>);

    fn generate(backend: &CompletionsBackend) -> Generated {
        let mut parts = Vec::new();
        let result = backend.generate(
            GenerationRequest {
                step: 1,
                messages: vec![ModelMessage::user(vec![ContentPart::text("draw")])],
                tools: Vec::new(),
                options: RequestOptions::default(),
            },
            Arc::new(AtomicBool::new(false)),
            &mut |part| parts.push(part),
        );
        (parts, result)
    }

    #[test]
    fn generate_relays_text_reasoning_and_usage() {
        let (backend, client) = backend(FakeOutcome::Stream(
            vec![
                CompletionStreamEvent::ReasoningDelta {
                    delta: "hmm".to_owned(),
                },
                CompletionStreamEvent::ContentDelta {
                    delta: "Hello".to_owned(),
                },
                CompletionStreamEvent::Usage {
                    usage: CompletionUsage {
                        prompt_tokens: 100,
                        completion_tokens: 7,
                        cached_tokens: 60,
                    },
                },
            ],
            Some(CompletionFinishReason::Stop),
        ));

        let (parts, outcome) = generate(&backend);
        let outcome = outcome.expect("step should succeed");

        assert_eq!(client.observed_model().as_deref(), Some("gemini-2.5-flash"));
        assert_eq!(
            parts,
            vec![
                StreamPart::ReasoningDelta {
                    text: "hmm".to_owned()
                },
                StreamPart::TextDelta {
                    text: "Hello".to_owned()
                },
            ]
        );
        assert_eq!(outcome.finish_reason, FinishReason::Stop);
        assert_eq!(
            outcome.usage,
            Usage {
                input_tokens: 40,
                output_tokens: 7,
                cached_input_tokens: 60,
            }
        );
    }

    #[test]
    fn generate_assembles_tool_call_fragments_in_index_order() {
        let (backend, _) = backend(FakeOutcome::Stream(
            vec![
                CompletionStreamEvent::ToolCallDelta {
                    index: 0,
                    id: Some("call_a".to_owned()),
                    name: Some("display_diagram".to_owned()),
                    arguments: String::new(),
                },
                CompletionStreamEvent::ToolCallDelta {
                    index: 0,
                    id: None,
                    name: None,
                    arguments: "{\"xml\":".to_owned(),
                },
                CompletionStreamEvent::ToolCallDelta {
                    index: 0,
                    id: None,
                    name: None,
                    arguments: "\"<a/>\"}".to_owned(),
                },
            ],
            Some(CompletionFinishReason::Stop),
        ));

        let (parts, outcome) = generate(&backend);

        assert_eq!(
            parts,
            vec![
                StreamPart::ToolInputStart {
                    call_id: "call_a".to_owned(),
                    tool_name: "display_diagram".to_owned(),
                },
                StreamPart::ToolInputDelta {
                    call_id: "call_a".to_owned(),
                    delta: "{\"xml\":".to_owned(),
                },
                StreamPart::ToolInputDelta {
                    call_id: "call_a".to_owned(),
                    delta: "\"<a/>\"}".to_owned(),
                },
                StreamPart::ToolCall {
                    call_id: "call_a".to_owned(),
                    tool_name: "display_diagram".to_owned(),
                    input: "{\"xml\":\"<a/>\"}".to_owned(),
                },
            ]
        );
        assert_eq!(
            outcome.expect("step should succeed").finish_reason,
            FinishReason::ToolCalls
        );
    }

    #[test]
    fn generate_fills_missing_call_ids() {
        let (backend, _) = backend(FakeOutcome::Stream(
            vec![CompletionStreamEvent::ToolCallDelta {
                index: 0,
                id: None,
                name: Some("edit_diagram".to_owned()),
                arguments: "{}".to_owned(),
            }],
            Some(CompletionFinishReason::ToolCalls),
        ));

        let (parts, _) = generate(&backend);
        let StreamPart::ToolCall { call_id, .. } = parts.last().expect("tool call") else {
            panic!("last part should be the completed call");
        };
        assert!(call_id.starts_with("call_"));
    }

    #[test]
    fn generate_maps_status_errors_to_upstream() {
        let (backend, _) = backend(FakeOutcome::Error(CompletionsApiError::Status {
            status: reqwest_status(429),
            message: "Rate limit reached for this model.".to_owned(),
            body: "{}".to_owned(),
        }));

        let (_, outcome) = generate(&backend);
        let error = outcome.expect_err("status should fail the step");
        assert_eq!(error.status(), Some(429));
    }

    #[test]
    fn generate_maps_cancelled_transport_to_cancelled() {
        let (backend, _) = backend(FakeOutcome::Error(CompletionsApiError::Cancelled));

        let (_, outcome) = generate(&backend);
        assert_eq!(outcome, Err(BackendError::Cancelled));
    }

    #[test]
    fn search_returns_summary_and_grounding() {
        let (backend, client) = backend(FakeOutcome::Search(GroundedSearchResponse {
            text: "Sunny".to_owned(),
            grounding_metadata: Some(json!({"webSearchQueries": ["weather"]})),
        }));

        let result = backend
            .search(
                SearchRequest {
                    model_id: "gemini-2.5-flash-lite".to_owned(),
                    prompt: "weather".to_owned(),
                },
                Arc::new(AtomicBool::new(false)),
            )
            .expect("search should succeed");

        assert_eq!(client.observed_model().as_deref(), Some("gemini-2.5-flash-lite"));
        assert_eq!(result.summary, "Sunny");
        assert!(result.grounding_metadata.is_some());
    }

    #[test]
    fn search_is_unsupported_without_grounding_capability() {
        let client = FakeStreamClient::new(FakeOutcome::Stream(Vec::new(), None));
        let backend = CompletionsBackend::with_stream_client_for_tests(
            CompletionsBackendConfig::new("openai", "gpt-4o", "key"),
            client,
        );

        let error = backend
            .search(
                SearchRequest {
                    model_id: "gemini-2.5-flash-lite".to_owned(),
                    prompt: "weather".to_owned(),
                },
                Arc::new(AtomicBool::new(false)),
            )
            .expect_err("openai backend has no grounded search");
        assert!(matches!(error, BackendError::Unsupported(_)));
    }

    #[test]
    fn finish_without_reason_and_without_calls_is_other() {
        assert_eq!(map_finish_reason(None, false), FinishReason::Other);
        assert_eq!(
            map_finish_reason(Some(CompletionFinishReason::Length), true),
            FinishReason::Length
        );
    }

    fn reqwest_status(code: u16) -> completions_api::error::StatusCode {
        completions_api::error::StatusCode::from_u16(code).expect("valid status")
    }
}
