//! The chat-turn pipeline behind the HTTP routes.
//!
//! [`ChatService::prepare`] runs the fast checks that may still reject the
//! request with a status code: access gate, body and session validation,
//! attachment limits, the cache shortcut, and provider resolution.
//! [`ChatService::execute`] then runs the blocking part: the optional research
//! step, prompt assembly, and the generation steps.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use diagram_provider::{
    CancelSignal, ContentPart, GenerationRequest, ModelBackend, ModelMessage, RequestOptions,
};
use serde::Serialize;
use serde_json::Value;

use crate::cache::{self, CacheTable};
use crate::config::ServerConfig;
use crate::error::{ChatError, EnhanceError};
use crate::instructions::enhance_instructions;
use crate::logging::TELEMETRY_TARGET;
use crate::message::{ChatRequest, EnhanceRequest};
use crate::mode::{run_research, select_mode, Research, ToolMode};
use crate::orchestrator::{run_turn, TurnPlan, TurnSummary};
use crate::prompt::{assemble, validate_attachments, PromptInputs};
use crate::resolver::{resolve, BackendFactory, ClientOverrides, ProviderSelection};
use crate::stream::UiEvent;

pub const ACCESS_DENIED_MESSAGE: &str =
    "Invalid or missing access code. Please configure it in Settings.";
pub const MAX_SESSION_ID_CHARS: usize = 200;
pub const MAX_ENHANCE_PROMPT_CHARS: usize = 4000;
pub const ENHANCE_TEMPERATURE: f32 = 0.5;

/// Request headers the pipeline reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnHeaders {
    pub access_code: Option<String>,
    pub overrides: ClientOverrides,
    pub minimal_style: bool,
    /// Parsed `x-search-enabled`.
    pub search_intent: Option<bool>,
    pub forwarded_for: Option<String>,
}

impl TurnHeaders {
    /// First `x-forwarded-for` entry, or `anonymous`.
    #[must_use]
    pub fn user_id(&self) -> String {
        self.forwarded_for
            .as_deref()
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("anonymous")
            .to_string()
    }
}

/// A validated turn ready for generation.
pub struct PreparedTurn {
    request: ChatRequest,
    selection: ProviderSelection,
    backend: Arc<dyn ModelBackend>,
    minimal_style: bool,
    search_intent: Option<bool>,
    session_id: Option<String>,
    user_id: String,
}

impl PreparedTurn {
    #[must_use]
    pub fn selection(&self) -> &ProviderSelection {
        &self.selection
    }
}

pub enum TurnStart {
    /// Recorded diagram replayed without a backend call.
    Cached(Vec<UiEvent>),
    Generate(Box<PreparedTurn>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhanceResponse {
    pub enhanced_prompt: String,
    pub model: String,
}

pub struct ChatService {
    config: Arc<ServerConfig>,
    cache: CacheTable,
    backends: Arc<dyn BackendFactory>,
}

impl ChatService {
    #[must_use]
    pub fn new(
        config: Arc<ServerConfig>,
        cache: CacheTable,
        backends: Arc<dyn BackendFactory>,
    ) -> Self {
        Self {
            config,
            cache,
            backends,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn access_granted(&self, code: Option<&str>) -> bool {
        if !self.config.access_gate_enabled() {
            return true;
        }
        code.is_some_and(|code| self.config.access_codes.iter().any(|allowed| allowed == code))
    }

    pub fn check_access(&self, code: Option<&str>) -> Result<(), ChatError> {
        if self.access_granted(code) {
            Ok(())
        } else {
            tracing::warn!("rejected request with invalid access code");
            Err(ChatError::Authentication(ACCESS_DENIED_MESSAGE.to_string()))
        }
    }

    /// Validates the turn and either answers it from the cache or resolves
    /// the backend that will generate it.
    pub fn prepare(&self, headers: TurnHeaders, body: &[u8]) -> Result<TurnStart, ChatError> {
        self.check_access(headers.access_code.as_deref())?;

        let request: ChatRequest = serde_json::from_slice(body)
            .map_err(|error| ChatError::Validation(format!("Invalid request body: {error}")))?;
        if request.messages.is_empty() {
            return Err(ChatError::Validation(
                "Request must contain at least one message.".to_string(),
            ));
        }

        let user_id = headers.user_id();
        let session_id = validate_session_id(request.session_id.as_ref())?;
        tracing::info!(
            target: TELEMETRY_TARGET,
            input = request.user_text(),
            session_id = session_id.as_deref(),
            user_id = %user_id,
            "trace input"
        );

        validate_attachments(request.last_message())?;

        if cache::is_eligible(request.messages.len(), request.canvas_xml()) {
            let has_attachment = request.messages[0].has_file();
            if let Some(entry) = self.cache.lookup(request.user_text(), has_attachment) {
                tracing::info!(prompt = %entry.prompt, "serving cached diagram");
                return Ok(TurnStart::Cached(cache::replay_events(&entry.xml)));
            }
        }

        let selection = resolve(&headers.overrides, &self.config)?;
        tracing::info!(
            model = %selection.model_id,
            prompt_caching = selection.supports_prompt_caching(),
            "prompt caching {}",
            if selection.supports_prompt_caching() { "enabled" } else { "disabled" }
        );
        let backend = self.backends.chat_backend(&selection)?;

        Ok(TurnStart::Generate(Box::new(PreparedTurn {
            request,
            selection,
            backend,
            minimal_style: headers.minimal_style,
            search_intent: headers.search_intent,
            session_id,
            user_id,
        })))
    }

    /// Runs the research step (when selected) and the generation steps.
    /// Blocks the calling thread.
    pub fn execute(
        &self,
        turn: PreparedTurn,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(UiEvent),
    ) -> Result<TurnSummary, ChatError> {
        let PreparedTurn {
            request,
            selection,
            backend,
            minimal_style,
            search_intent,
            session_id,
            user_id,
        } = turn;
        let user_text = request.user_text();

        let mode = select_mode(search_intent, user_text, selection.supports_grounded_search());
        tracing::info!(
            %mode,
            search_capable = selection.supports_grounded_search(),
            ?search_intent,
            "selected tool mode"
        );

        let research = match mode {
            ToolMode::DiagramWithResearch => Some(match self.backends.search_backend(&selection) {
                Ok(search) => run_research(search.as_ref(), user_text, Arc::clone(&cancel)),
                Err(error) => {
                    tracing::warn!(%error, "research backend unavailable");
                    Research::fallback(user_text)
                }
            }),
            ToolMode::DiagramNormal => None,
        };

        let messages = assemble(
            &request.messages,
            &PromptInputs {
                model_id: &selection.model_id,
                minimal_style,
                prompt_caching: selection.supports_prompt_caching(),
                replace_history_xml: self.config.replace_history_xml,
                xml: request.canvas_xml(),
                previous_xml: request.previous_xml.as_deref(),
                mode,
                research_summary: research.as_ref().map(|research| research.summary.as_str()),
            },
        );

        let plan = TurnPlan {
            messages,
            options: selection.main_call_options(),
            grounding_metadata: research.and_then(|research| research.grounding_metadata),
        };
        let summary = run_turn(backend.as_ref(), plan, cancel, emit)?;

        tracing::info!(
            target: TELEMETRY_TARGET,
            output = %summary.text,
            input_tokens = summary.usage.total_input_tokens(),
            output_tokens = summary.usage.output_tokens,
            finish_reason = summary.finish_reason.as_str(),
            steps = summary.steps,
            session_id = session_id.as_deref(),
            user_id = %user_id,
            "trace output"
        );
        Ok(summary)
    }

    /// Rewrites a short prompt into a more detailed one. Blocks the calling
    /// thread.
    pub fn enhance(
        &self,
        access_code: Option<&str>,
        body: &[u8],
    ) -> Result<EnhanceResponse, EnhanceError> {
        if !self.access_granted(access_code) {
            return Err(EnhanceError::AccessDenied);
        }

        let backend = self.backends.enhance_backend().map_err(|error| {
            tracing::warn!(%error, "prompt enhancement is not configured");
            EnhanceError::NotConfigured
        })?;

        let prompt = serde_json::from_slice::<EnhanceRequest>(body)
            .ok()
            .map(|request| request.prompt.trim().to_string())
            .filter(|prompt| (1..=MAX_ENHANCE_PROMPT_CHARS).contains(&prompt.chars().count()))
            .ok_or(EnhanceError::InvalidBody)?;

        let request = GenerationRequest {
            step: 1,
            messages: vec![
                ModelMessage::system(enhance_instructions()),
                ModelMessage::user(vec![ContentPart::text(prompt)]),
            ],
            tools: Vec::new(),
            options: RequestOptions {
                temperature: Some(ENHANCE_TEMPERATURE),
                ..RequestOptions::default()
            },
        };

        let text = backend
            .complete(request, Arc::new(AtomicBool::new(false)))
            .map_err(|error| {
                tracing::error!(%error, "prompt enhancement failed");
                EnhanceError::Failed
            })?;

        Ok(EnhanceResponse {
            enhanced_prompt: text.trim().to_string(),
            model: backend.profile().model_id,
        })
    }
}

/// `sessionId` must be a string of at most 200 characters when present.
fn validate_session_id(value: Option<&Value>) -> Result<Option<String>, ChatError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(id)) if id.chars().count() <= MAX_SESSION_ID_CHARS => {
            Ok(Some(id.clone()))
        }
        Some(_) => Err(ChatError::Validation(format!(
            "Invalid session ID. Expected a string of at most {MAX_SESSION_ID_CHARS} characters."
        ))),
    }
}
