//! Process configuration.
//!
//! Built once at start from an injectable variable source and shared by `Arc`.
//! Numeric settings are validated eagerly so a bad value stops the server
//! instead of failing the first request.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:6002";
pub const DEFAULT_MAX_DURATION_SECS: u64 = 120;

/// Hosted model families the service can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    Google,
    OpenRouter,
    /// Scripted local backend; only selectable through `AI_PROVIDER`.
    Mock,
}

impl ProviderKind {
    /// Providers a client may name in `x-ai-provider`, in detection order.
    pub const CLIENT_ALLOWED: [ProviderKind; 3] =
        [ProviderKind::OpenAi, ProviderKind::Google, ProviderKind::OpenRouter];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Google => "google",
            Self::OpenRouter => "openrouter",
            Self::Mock => "mock",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "openai" => Some(Self::OpenAi),
            "google" => Some(Self::Google),
            "openrouter" => Some(Self::OpenRouter),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }

    /// Environment variable holding the server-side credential.
    #[must_use]
    pub fn api_key_var(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Google => Some("GOOGLE_GENERATIVE_AI_API_KEY"),
            Self::OpenRouter => Some("OPENROUTER_API_KEY"),
            Self::Mock => None,
        }
    }

    #[must_use]
    pub fn base_url_var(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_BASE_URL"),
            Self::Google => Some("GOOGLE_BASE_URL"),
            Self::OpenRouter => Some("OPENROUTER_BASE_URL"),
            Self::Mock => None,
        }
    }

    /// Human-readable name used in configuration hints.
    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Google => "Google",
            Self::OpenRouter => "OpenRouter",
            Self::Mock => "Mock",
        }
    }
}

/// Server-side credential and endpoint for one provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

/// Reasoning and sampling knobs that feed per-request options.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReasoningSettings {
    pub openai_reasoning_effort: Option<String>,
    pub openai_reasoning_summary: Option<String>,
    pub google_reasoning_effort: Option<String>,
    pub google_thinking_budget: Option<u32>,
    pub google_thinking_level: Option<String>,
    pub google_candidate_count: Option<u32>,
    pub google_top_k: Option<u32>,
    pub google_top_p: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} must be a valid integer, got: {value}")]
    InvalidInteger { var: &'static str, value: String },
    #[error("{var} must be >= {min}, got: {value}")]
    BelowMinimum {
        var: &'static str,
        min: u32,
        value: u32,
    },
    #[error("{var} must be <= {max}, got: {value}")]
    AboveMaximum {
        var: &'static str,
        max: u32,
        value: u32,
    },
    #[error("GOOGLE_TOP_P must be a number between 0 and 1, got: {0}")]
    InvalidTopP(String),
    #[error("Unknown AI provider: {0}. Supported providers: openai, google, openrouter, mock")]
    UnknownProvider(String),
    #[error("CLARIFY_LISTEN must be a socket address like 127.0.0.1:6002, got: {0}")]
    InvalidListenAddr(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub default_provider: Option<ProviderKind>,
    pub default_model: Option<String>,
    pub openai: ProviderCredentials,
    pub google: ProviderCredentials,
    pub openrouter: ProviderCredentials,
    pub reasoning: ReasoningSettings,
    pub max_output_tokens: Option<u32>,
    /// Empty list disables the access-code gate.
    pub access_codes: Vec<String>,
    pub replace_history_xml: bool,
    pub max_duration: Duration,
    /// Adds diagnostic detail to error bodies.
    pub development: bool,
    pub cache_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 6002)),
            default_provider: None,
            default_model: None,
            openai: ProviderCredentials::default(),
            google: ProviderCredentials::default(),
            openrouter: ProviderCredentials::default(),
            reasoning: ReasoningSettings::default(),
            max_output_tokens: None,
            access_codes: Vec::new(),
            replace_history_xml: false,
            max_duration: Duration::from_secs(DEFAULT_MAX_DURATION_SECS),
            development: false,
            cache_path: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(env::vars())
    }

    /// Builds the configuration from explicit `(name, value)` pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = VarSource::new(vars);

        let listen_addr = match vars.string("CLARIFY_LISTEN") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidListenAddr(raw.clone()))?,
            None => SocketAddr::from(([127, 0, 0, 1], 6002)),
        };

        let default_provider = match vars.string("AI_PROVIDER") {
            Some(raw) => Some(
                ProviderKind::parse(&raw).ok_or_else(|| ConfigError::UnknownProvider(raw.clone()))?,
            ),
            None => None,
        };

        let reasoning = ReasoningSettings {
            openai_reasoning_effort: vars.string("OPENAI_REASONING_EFFORT"),
            openai_reasoning_summary: vars.string("OPENAI_REASONING_SUMMARY"),
            google_reasoning_effort: vars.string("GOOGLE_REASONING_EFFORT"),
            google_thinking_budget: vars.bounded_u32("GOOGLE_THINKING_BUDGET", 1024, 100_000)?,
            google_thinking_level: vars.string("GOOGLE_THINKING_LEVEL"),
            google_candidate_count: vars.bounded_u32("GOOGLE_CANDIDATE_COUNT", 1, 8)?,
            google_top_k: vars.bounded_u32("GOOGLE_TOP_K", 1, 100)?,
            google_top_p: vars.top_p("GOOGLE_TOP_P")?,
        };

        let max_duration_secs = vars
            .bounded_u32("CLARIFY_MAX_DURATION_SECS", 1, 3600)?
            .map_or(DEFAULT_MAX_DURATION_SECS, u64::from);

        Ok(Self {
            listen_addr,
            default_provider,
            default_model: vars.string("AI_MODEL"),
            openai: vars.credentials(ProviderKind::OpenAi),
            google: vars.credentials(ProviderKind::Google),
            openrouter: vars.credentials(ProviderKind::OpenRouter),
            reasoning,
            max_output_tokens: vars.bounded_u32("MAX_OUTPUT_TOKENS", 1, u32::MAX)?,
            access_codes: vars
                .string("ACCESS_CODE_LIST")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|code| !code.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            replace_history_xml: vars.flag("ENABLE_HISTORY_XML_REPLACE"),
            max_duration: Duration::from_secs(max_duration_secs),
            development: vars.string("CLARIFY_ENV").as_deref() == Some("development"),
            cache_path: vars.string("CLARIFY_CACHE_PATH").map(PathBuf::from),
        })
    }

    /// Server-side credentials for `provider`; the mock provider has none.
    #[must_use]
    pub fn credentials(&self, provider: ProviderKind) -> Option<&ProviderCredentials> {
        match provider {
            ProviderKind::OpenAi => Some(&self.openai),
            ProviderKind::Google => Some(&self.google),
            ProviderKind::OpenRouter => Some(&self.openrouter),
            ProviderKind::Mock => None,
        }
    }

    #[must_use]
    pub fn api_key(&self, provider: ProviderKind) -> Option<&str> {
        self.credentials(provider)
            .and_then(|credentials| credentials.api_key.as_deref())
    }

    /// Providers with a server-side key, in detection order.
    #[must_use]
    pub fn configured_providers(&self) -> Vec<ProviderKind> {
        ProviderKind::CLIENT_ALLOWED
            .into_iter()
            .filter(|provider| self.api_key(*provider).is_some())
            .collect()
    }

    #[must_use]
    pub fn access_gate_enabled(&self) -> bool {
        !self.access_codes.is_empty()
    }
}

struct VarSource {
    vars: HashMap<String, String>,
}

impl VarSource {
    fn new<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    fn string(&self, key: &str) -> Option<String> {
        self.vars.get(key).and_then(|value| {
            let value = value.trim();
            if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            }
        })
    }

    fn flag(&self, key: &str) -> bool {
        self.string(key).as_deref() == Some("true")
    }

    fn credentials(&self, provider: ProviderKind) -> ProviderCredentials {
        ProviderCredentials {
            api_key: provider.api_key_var().and_then(|var| self.string(var)),
            base_url: provider.base_url_var().and_then(|var| self.string(var)),
        }
    }

    fn bounded_u32(
        &self,
        var: &'static str,
        min: u32,
        max: u32,
    ) -> Result<Option<u32>, ConfigError> {
        let Some(raw) = self.string(var) else {
            return Ok(None);
        };
        let value = raw.parse::<u32>().map_err(|_| ConfigError::InvalidInteger {
            var,
            value: raw.clone(),
        })?;
        if value < min {
            return Err(ConfigError::BelowMinimum { var, min, value });
        }
        if value > max {
            return Err(ConfigError::AboveMaximum { var, max, value });
        }
        Ok(Some(value))
    }

    fn top_p(&self, var: &'static str) -> Result<Option<f32>, ConfigError> {
        let Some(raw) = self.string(var) else {
            return Ok(None);
        };
        match raw.parse::<f32>() {
            Ok(value) if (0.0..=1.0).contains(&value) => Ok(Some(value)),
            _ => Err(ConfigError::InvalidTopP(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        ServerConfig::from_vars(vars.iter().map(|(key, value)| (*key, *value)))
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config(&[]).expect("empty environment is valid");

        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.max_duration, Duration::from_secs(120));
        assert!(config.default_provider.is_none());
        assert!(!config.replace_history_xml);
        assert!(!config.development);
        assert!(!config.access_gate_enabled());
        assert!(config.configured_providers().is_empty());
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = config(&[("AI_MODEL", "  "), ("OPENAI_API_KEY", "")]).expect("valid");

        assert!(config.default_model.is_none());
        assert!(config.openai.api_key.is_none());
    }

    #[test]
    fn access_codes_are_trimmed_and_split() {
        let config = config(&[("ACCESS_CODE_LIST", " alpha, ,beta ")]).expect("valid");

        assert_eq!(config.access_codes, vec!["alpha", "beta"]);
        assert!(config.access_gate_enabled());
    }

    #[test]
    fn history_replace_requires_literal_true() {
        assert!(config(&[("ENABLE_HISTORY_XML_REPLACE", "true")])
            .expect("valid")
            .replace_history_xml);
        assert!(!config(&[("ENABLE_HISTORY_XML_REPLACE", "1")])
            .expect("valid")
            .replace_history_xml);
    }

    #[test]
    fn provider_credentials_and_detection_order() {
        let config = config(&[
            ("OPENROUTER_API_KEY", "or-key"),
            ("GOOGLE_GENERATIVE_AI_API_KEY", "g-key"),
            ("GOOGLE_BASE_URL", "https://proxy.example/v1beta"),
        ])
        .expect("valid");

        assert_eq!(
            config.configured_providers(),
            vec![ProviderKind::Google, ProviderKind::OpenRouter]
        );
        assert_eq!(
            config.google.base_url.as_deref(),
            Some("https://proxy.example/v1beta")
        );
        assert_eq!(config.api_key(ProviderKind::Mock), None);
    }

    #[test]
    fn unknown_default_provider_is_rejected() {
        let error = config(&[("AI_PROVIDER", "bedrock")]).expect_err("bedrock is unknown");
        assert_eq!(error, ConfigError::UnknownProvider("bedrock".to_string()));
    }

    #[test]
    fn mock_provider_is_a_valid_server_default() {
        let config = config(&[("AI_PROVIDER", "mock")]).expect("valid");
        assert_eq!(config.default_provider, Some(ProviderKind::Mock));
    }

    #[test]
    fn integer_settings_are_range_checked() {
        let error = config(&[("GOOGLE_CANDIDATE_COUNT", "9")]).expect_err("above range");
        assert_eq!(error.to_string(), "GOOGLE_CANDIDATE_COUNT must be <= 8, got: 9");

        let error = config(&[("GOOGLE_THINKING_BUDGET", "512")]).expect_err("below range");
        assert_eq!(
            error.to_string(),
            "GOOGLE_THINKING_BUDGET must be >= 1024, got: 512"
        );

        let error = config(&[("GOOGLE_TOP_K", "many")]).expect_err("not a number");
        assert_eq!(
            error.to_string(),
            "GOOGLE_TOP_K must be a valid integer, got: many"
        );
    }

    #[test]
    fn top_p_must_be_a_unit_fraction() {
        assert_eq!(
            config(&[("GOOGLE_TOP_P", "0.9")]).expect("valid").reasoning.google_top_p,
            Some(0.9)
        );
        assert_eq!(
            config(&[("GOOGLE_TOP_P", "1.5")]).expect_err("out of range"),
            ConfigError::InvalidTopP("1.5".to_string())
        );
    }

    #[test]
    fn listen_address_and_duration_overrides() {
        let config = config(&[
            ("CLARIFY_LISTEN", "0.0.0.0:8080"),
            ("CLARIFY_MAX_DURATION_SECS", "30"),
            ("CLARIFY_ENV", "development"),
            ("CLARIFY_CACHE_PATH", "/tmp/cache.json"),
        ])
        .expect("valid");

        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.max_duration, Duration::from_secs(30));
        assert!(config.development);
        assert_eq!(config.cache_path, Some(PathBuf::from("/tmp/cache.json")));

        assert!(matches!(
            self::config(&[("CLARIFY_LISTEN", "localhost")]),
            Err(ConfigError::InvalidListenAddr(_))
        ));
    }
}
