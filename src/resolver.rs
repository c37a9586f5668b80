//! Provider and model resolution for one chat turn.

use std::sync::Arc;
use std::time::Duration;

use diagram_provider::{ModelBackend, RequestOptions, ThinkingConfig};
use diagram_provider_completions::{CompletionsBackend, CompletionsBackendConfig};
use diagram_provider_mock::MockBackend;

use crate::config::{ProviderKind, ServerConfig};
use crate::error::ChatError;
use crate::mode::SEARCH_MODEL_ID;

pub const DEFAULT_GOOGLE_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// App name reported to OpenRouter with every request.
pub const OPENROUTER_APP_TITLE: &str = "Clarify";

/// Per-request provider settings sent as `x-ai-*` headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOverrides {
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model_id: Option<String>,
}

/// The single provider/model choice for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSelection {
    pub provider: ProviderKind,
    pub model_id: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub options: RequestOptions,
    /// Client sent both a provider and a key; server credentials were not checked.
    pub client_override: bool,
}

impl ProviderSelection {
    #[must_use]
    pub fn supports_prompt_caching(&self) -> bool {
        supports_prompt_caching(&self.model_id)
    }

    #[must_use]
    pub fn supports_grounded_search(&self) -> bool {
        supports_grounded_search(self.provider, &self.model_id)
    }

    /// Options for the main call. Search-capable providers reject extended
    /// thinking combined with function tools.
    #[must_use]
    pub fn main_call_options(&self) -> RequestOptions {
        let mut options = self.options.clone();
        if self.supports_grounded_search() {
            options.thinking = None;
        }
        options
    }
}

/// Models that accept cache-control markers.
#[must_use]
pub fn supports_prompt_caching(model_id: &str) -> bool {
    let lower = model_id.to_lowercase();
    lower.contains("claude") || lower.contains("anthropic")
}

#[must_use]
pub fn supports_grounded_search(provider: ProviderKind, model_id: &str) -> bool {
    provider == ProviderKind::Google
        || model_id.contains("gemini")
        || model_id.contains("google")
}

pub fn resolve(
    overrides: &ClientOverrides,
    config: &ServerConfig,
) -> Result<ProviderSelection, ChatError> {
    if overrides.base_url.is_some() && overrides.api_key.is_none() {
        return Err(ChatError::client_configuration(
            "API key is required when using a custom base URL. Please provide your own API key in Settings.",
        ));
    }

    let client_override = overrides.provider.is_some() && overrides.api_key.is_some();

    let model_id = match overrides.model_id.as_ref().or(config.default_model.as_ref()) {
        Some(model_id) => model_id.clone(),
        None if client_override => {
            return Err(ChatError::configuration(
                "Model ID is required when using custom AI provider. Please specify a model in Settings.",
            ))
        }
        None => {
            return Err(ChatError::configuration(
                "AI_MODEL environment variable is required. Example: AI_MODEL=claude-sonnet-4-5",
            ))
        }
    };

    let provider = match overrides.provider.as_deref() {
        Some(name) => ProviderKind::parse(name)
            .filter(|provider| ProviderKind::CLIENT_ALLOWED.contains(provider))
            .ok_or_else(|| {
                ChatError::configuration(format!(
                    "Invalid provider: {name}. Allowed providers: {}",
                    allowed_provider_list()
                ))
            })?,
        None => match config.default_provider {
            Some(provider) => provider,
            None => detect_provider(config)?,
        },
    };

    if !client_override {
        if let Some(var) = provider.api_key_var() {
            if config.api_key(provider).is_none() {
                return Err(ChatError::configuration(format!(
                    "{var} environment variable is required for {} provider. Please set it in your .env.local file.",
                    provider.as_str()
                )));
            }
        }
    }

    let credentials = config.credentials(provider);
    let api_key = overrides
        .api_key
        .clone()
        .or_else(|| credentials.and_then(|credentials| credentials.api_key.clone()));
    let base_url = overrides
        .base_url
        .clone()
        .or_else(|| credentials.and_then(|credentials| credentials.base_url.clone()));

    tracing::info!(
        provider = provider.as_str(),
        model = %model_id,
        client_override,
        "resolved provider"
    );

    Ok(ProviderSelection {
        options: request_options(provider, &model_id, config),
        provider,
        model_id,
        api_key,
        base_url,
        client_override,
    })
}

fn allowed_provider_list() -> String {
    ProviderKind::CLIENT_ALLOWED
        .iter()
        .map(ProviderKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn detect_provider(config: &ServerConfig) -> Result<ProviderKind, ChatError> {
    let configured = config.configured_providers();
    match configured.as_slice() {
        [provider] => {
            tracing::info!(provider = provider.as_str(), "auto-detected provider");
            Ok(*provider)
        }
        [] => {
            let mut message = String::from(
                "No AI provider configured. Please set one of the following API keys in your .env.local file:",
            );
            for provider in ProviderKind::CLIENT_ALLOWED {
                if let Some(var) = provider.api_key_var() {
                    message.push_str(&format!("\n- {var} for {}", provider.display_name()));
                }
            }
            Err(ChatError::configuration(message))
        }
        several => Err(ChatError::configuration(format!(
            "Multiple AI providers configured ({}). Please set AI_PROVIDER to specify which one to use.",
            several
                .iter()
                .map(ProviderKind::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// Reasoning and sampling options for `model_id` on `provider`.
#[must_use]
pub fn request_options(
    provider: ProviderKind,
    model_id: &str,
    config: &ServerConfig,
) -> RequestOptions {
    let reasoning = &config.reasoning;
    let mut options = RequestOptions {
        max_output_tokens: config.max_output_tokens,
        ..RequestOptions::default()
    };

    match provider {
        ProviderKind::OpenAi => {
            let reasoning_model = ["o1", "o3", "gpt-5"]
                .iter()
                .any(|family| model_id.contains(family));
            options.reasoning_effort = reasoning.openai_reasoning_effort.clone();
            options.reasoning_summary = if reasoning_model {
                Some(
                    reasoning
                        .openai_reasoning_summary
                        .clone()
                        .unwrap_or_else(|| "detailed".to_string()),
                )
            } else {
                reasoning.openai_reasoning_summary.clone()
            };
        }
        ProviderKind::Google => {
            let thinking_model = ["gemini-2", "gemini-3", "gemini2", "gemini3"]
                .iter()
                .any(|family| model_id.contains(family));
            if thinking_model {
                let mut thinking = ThinkingConfig {
                    include_thoughts: true,
                    ..ThinkingConfig::default()
                };
                let budget_model = model_id.contains("2.5") || model_id.contains("2-5");
                let level_model = model_id.contains("gemini-3") || model_id.contains("gemini3");
                match (reasoning.google_thinking_budget, &reasoning.google_thinking_level) {
                    (Some(budget), _) if budget_model => thinking.budget_tokens = Some(budget),
                    (_, Some(level)) if level_model => thinking.level = Some(level.clone()),
                    _ => {}
                }
                options.thinking = Some(thinking);
            } else {
                options.reasoning_effort = reasoning.google_reasoning_effort.clone();
            }
            options.candidate_count = reasoning.google_candidate_count;
            options.top_k = reasoning.google_top_k;
            options.top_p = reasoning.google_top_p;
        }
        ProviderKind::OpenRouter | ProviderKind::Mock => {}
    }

    options
}

/// Builds backends for resolved selections.
pub trait BackendFactory: Send + Sync {
    fn chat_backend(
        &self,
        selection: &ProviderSelection,
    ) -> Result<Arc<dyn ModelBackend>, ChatError>;

    /// Backend for the grounded research call; needs a google credential.
    fn search_backend(
        &self,
        selection: &ProviderSelection,
    ) -> Result<Arc<dyn ModelBackend>, ChatError>;

    /// Backend for prompt enhancement with the lightweight google model.
    fn enhance_backend(&self) -> Result<Arc<dyn ModelBackend>, ChatError>;
}

/// Factory backed by the completions adapter and the server configuration.
pub struct DefaultBackendFactory {
    config: Arc<ServerConfig>,
}

impl DefaultBackendFactory {
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    fn request_timeout(&self) -> Duration {
        self.config.max_duration
    }

    fn google_backend(
        &self,
        model_id: &str,
        api_key: String,
        base_url: Option<&str>,
    ) -> Result<Arc<dyn ModelBackend>, ChatError> {
        let native = base_url
            .or(self.config.google.base_url.as_deref())
            .unwrap_or(DEFAULT_GOOGLE_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let config =
            CompletionsBackendConfig::new(ProviderKind::Google.as_str(), model_id, api_key)
                .with_base_url(format!("{native}/openai"))
                .with_search_base_url(native)
                .with_timeout(self.request_timeout())
                .with_grounded_search(true);
        build(config)
    }

    /// Chat config for the OpenAI-compatible providers.
    fn completions_config(
        &self,
        selection: &ProviderSelection,
        api_key: String,
    ) -> CompletionsBackendConfig {
        let mut config =
            CompletionsBackendConfig::new(selection.provider.as_str(), &selection.model_id, api_key)
                .with_timeout(self.request_timeout())
                .with_prompt_caching(selection.supports_prompt_caching());
        if let Some(base_url) = &selection.base_url {
            config = config.with_base_url(base_url.clone());
        }
        if selection.provider == ProviderKind::OpenRouter {
            if selection.base_url.is_none() {
                config = config.with_base_url(DEFAULT_OPENROUTER_BASE_URL);
            }
            config = config.insert_header("X-Title", OPENROUTER_APP_TITLE);
        }
        config
    }
}

fn build(config: CompletionsBackendConfig) -> Result<Arc<dyn ModelBackend>, ChatError> {
    CompletionsBackend::new(config)
        .map(|backend| Arc::new(backend) as Arc<dyn ModelBackend>)
        .map_err(|error| ChatError::configuration(error.to_string()))
}

impl BackendFactory for DefaultBackendFactory {
    fn chat_backend(
        &self,
        selection: &ProviderSelection,
    ) -> Result<Arc<dyn ModelBackend>, ChatError> {
        if selection.provider == ProviderKind::Mock {
            return Ok(Arc::new(
                MockBackend::default()
                    .with_model_id(selection.model_id.clone())
                    .with_grounded_search(selection.supports_grounded_search()),
            ));
        }

        let api_key = selection.api_key.clone().ok_or_else(|| {
            ChatError::configuration(format!(
                "No API key available for {} provider.",
                selection.provider.as_str()
            ))
        })?;

        if selection.provider == ProviderKind::Google {
            return self.google_backend(
                &selection.model_id,
                api_key,
                selection.base_url.as_deref(),
            );
        }

        build(self.completions_config(selection, api_key))
    }

    fn search_backend(
        &self,
        selection: &ProviderSelection,
    ) -> Result<Arc<dyn ModelBackend>, ChatError> {
        if selection.provider == ProviderKind::Mock {
            return self.chat_backend(selection);
        }

        let (api_key, base_url) = if selection.provider == ProviderKind::Google {
            (selection.api_key.clone(), selection.base_url.as_deref())
        } else {
            (self.config.api_key(ProviderKind::Google).map(str::to_string), None)
        };
        let api_key = api_key.ok_or_else(|| {
            ChatError::configuration("Google API key is not configured for search.")
        })?;
        self.google_backend(SEARCH_MODEL_ID, api_key, base_url)
    }

    fn enhance_backend(&self) -> Result<Arc<dyn ModelBackend>, ChatError> {
        let api_key = self
            .config
            .api_key(ProviderKind::Google)
            .ok_or_else(|| {
                ChatError::configuration("Google API key is not configured for prompt enhancement.")
            })?
            .to_string();
        self.google_backend(SEARCH_MODEL_ID, api_key, None)
    }
}
