//! Model backend resolution with an environment override and a two-provider
//! fallback chain.
//!
//! Order of attempts:
//! 1. `LLM_MODEL` override (`provider:model`, or a bare OpenAI model name)
//! 2. [`PRIMARY_DEFAULT`]
//! 3. [`SECONDARY_DEFAULT`], whose failure is returned to the caller
//!
//! Every attempt constructs the client eagerly, so a handle is only ever
//! returned for a backend whose provider and credentials were verified.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{ChatMessage, ChatOptions, ChatResponse, GeminiClient, LlmClient, OpenAiClient, ToolDefinition};

pub const PRIMARY_DEFAULT: &str = "openai:gpt-4o-mini";
pub const SECONDARY_DEFAULT: &str = "google_genai:gemini-flash-latest";

/// Model provider family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAi,
    GoogleGenAi,
    /// Any other OpenAI-compatible endpoint, named by its prefix.
    Other(String),
}

impl Provider {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Self::OpenAi,
            "google_genai" | "google" | "gemini" => Self::GoogleGenAi,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::OpenAi => "openai",
            Self::GoogleGenAi => "google_genai",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(provider, model)` pair parsed from a model string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub provider: Provider,
    pub model: String,
}

impl ModelSpec {
    /// `provider:model` selects the provider explicitly; a bare name is
    /// assumed to be an OpenAI model.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.split_once(':') {
            Some((provider, model)) => Self {
                provider: Provider::parse(provider),
                model: model.trim().to_string(),
            },
            None => Self {
                provider: Provider::OpenAi,
                model: raw.to_string(),
            },
        }
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

/// Fully resolved model parameters; immutable once a handle is built.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub provider: Provider,
    pub model_name: String,
    pub temperature: Option<f64>,
    pub extra: Map<String, Value>,
}

impl ModelConfig {
    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            temperature: self.temperature,
            extra: self.extra.clone(),
            ..Default::default()
        }
    }
}

/// What the model is for; selects default sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleHint {
    Supervisor,
    Navigator,
    Coder,
    Analyst,
    Browser,
}

impl RoleHint {
    fn default_temperature(self) -> Option<f64> {
        match self {
            Self::Supervisor | Self::Coder | Self::Analyst => Some(0.2),
            Self::Browser => Some(0.0),
            Self::Navigator => None,
        }
    }
}

/// Caller-supplied parameters that win over role defaults.
#[derive(Debug, Clone, Default)]
pub struct ModelOverrides {
    pub temperature: Option<f64>,
    pub extra: Map<String, Value>,
}

/// Which step of the fallback chain produced a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    Override,
    PrimaryDefault,
    SecondaryDefault,
}

/// Failure to construct a model client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("empty model name")]
    EmptyModel,
    #[error("missing credential {var} for provider {provider}")]
    MissingCredential { provider: String, var: String },
    #[error("provider {0} is not configured (set {1})")]
    UnconfiguredProvider(String, String),
}

/// Builds clients for a model config, verifying it eagerly.
pub trait ModelFactory: Send + Sync {
    fn build(&self, config: &ModelConfig) -> Result<Arc<dyn LlmClient>, ResolveError>;
}

/// Factory reading provider credentials from environment variables.
pub struct EnvModelFactory {
    vars: HashMap<String, String>,
}

impl EnvModelFactory {
    /// Snapshot the process environment.
    pub fn from_env() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn with_vars(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }

    fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn require(&self, provider: &Provider, name: &str) -> Result<&str, ResolveError> {
        self.var(name).ok_or_else(|| ResolveError::MissingCredential {
            provider: provider.to_string(),
            var: name.to_string(),
        })
    }
}

impl ModelFactory for EnvModelFactory {
    fn build(&self, config: &ModelConfig) -> Result<Arc<dyn LlmClient>, ResolveError> {
        if config.model_name.is_empty() {
            return Err(ResolveError::EmptyModel);
        }
        match &config.provider {
            Provider::OpenAi => {
                let key = self.require(&config.provider, "OPENAI_API_KEY")?;
                let client = match self.var("OPENAI_BASE_URL") {
                    Some(base) => OpenAiClient::with_base_url(key.to_string(), base),
                    None => OpenAiClient::new(key.to_string()),
                };
                Ok(Arc::new(client))
            }
            Provider::GoogleGenAi => {
                let key = self
                    .var("GOOGLE_API_KEY")
                    .or_else(|| self.var("GEMINI_API_KEY"))
                    .ok_or_else(|| ResolveError::MissingCredential {
                        provider: config.provider.to_string(),
                        var: "GOOGLE_API_KEY".to_string(),
                    })?;
                Ok(Arc::new(GeminiClient::new(key.to_string())))
            }
            Provider::Other(name) => {
                let prefix = name.to_ascii_uppercase().replace('-', "_");
                let base_var = format!("{}_BASE_URL", prefix);
                let base = self.var(&base_var).ok_or_else(|| {
                    ResolveError::UnconfiguredProvider(name.clone(), base_var.clone())
                })?;
                let key = self.require(&config.provider, &format!("{}_API_KEY", prefix))?;
                Ok(Arc::new(OpenAiClient::with_base_url(key.to_string(), base)))
            }
        }
    }
}

/// A constructed, verified model backend bound to its config.
#[derive(Clone)]
pub struct ModelHandle {
    client: Arc<dyn LlmClient>,
    config: ModelConfig,
    source: ModelSource,
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("config", &self.config)
            .field("source", &self.source)
            .finish()
    }
}

impl ModelHandle {
    pub fn new(client: Arc<dyn LlmClient>, config: ModelConfig, source: ModelSource) -> Self {
        Self {
            client,
            config,
            source,
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn source(&self) -> ModelSource {
        self.source
    }

    /// One chat turn with the bound model and its sampling parameters.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ChatResponse> {
        self.client
            .chat_completion_with_options(&self.config.model_name, messages, tools, self.config.chat_options())
            .await
    }

    /// Stream a text-only turn; deltas go to `tx`, the full text is returned.
    pub async fn stream(&self, messages: &[ChatMessage], tx: mpsc::Sender<String>) -> anyhow::Result<String> {
        self.client
            .stream_completion(&self.config.model_name, messages, self.config.chat_options(), tx)
            .await
    }
}

/// Resolves model handles per role.
#[derive(Clone)]
pub struct ModelResolver {
    override_model: Option<String>,
    factory: Arc<dyn ModelFactory>,
}

impl ModelResolver {
    pub fn new(override_model: Option<String>, factory: Arc<dyn ModelFactory>) -> Self {
        Self {
            override_model: override_model.filter(|m| !m.trim().is_empty()),
            factory,
        }
    }

    fn attempt(
        &self,
        spec: &ModelSpec,
        role: RoleHint,
        overrides: &ModelOverrides,
        source: ModelSource,
    ) -> Result<ModelHandle, ResolveError> {
        let mut extra = overrides.extra.clone();
        // Callers cannot smuggle a different model through extra params.
        extra.remove("model");
        let config = ModelConfig {
            provider: spec.provider.clone(),
            model_name: spec.model.clone(),
            temperature: overrides.temperature.or_else(|| role.default_temperature()),
            extra,
        };
        let client = self.factory.build(&config)?;
        Ok(ModelHandle::new(client, config, source))
    }

    /// Resolve a handle for `role`.
    ///
    /// Errors only when the secondary default cannot be constructed either.
    pub fn resolve(&self, role: RoleHint, overrides: &ModelOverrides) -> Result<ModelHandle, ResolveError> {
        if let Some(raw) = &self.override_model {
            let spec = ModelSpec::parse(raw);
            match self.attempt(&spec, role, overrides, ModelSource::Override) {
                Ok(handle) => {
                    tracing::info!(role = ?role, model = %spec, "Using model from LLM_MODEL");
                    return Ok(handle);
                }
                Err(e) => {
                    tracing::warn!(
                        role = ?role,
                        "Failed to init LLM_MODEL {}, trying defaults: {}",
                        raw,
                        e
                    );
                }
            }
        }

        let primary = ModelSpec::parse(PRIMARY_DEFAULT);
        match self.attempt(&primary, role, overrides, ModelSource::PrimaryDefault) {
            Ok(handle) => {
                tracing::info!(role = ?role, model = %primary, "Using primary default model");
                return Ok(handle);
            }
            Err(e) => {
                tracing::warn!(role = ?role, "Failed to init {}, falling back: {}", primary, e);
            }
        }

        let secondary = ModelSpec::parse(SECONDARY_DEFAULT);
        let handle = self.attempt(&secondary, role, overrides, ModelSource::SecondaryDefault)?;
        tracing::info!(role = ?role, model = %secondary, "Using secondary default model");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedLlm;
    use std::sync::Mutex;

    /// Factory that fails for chosen providers and records every attempt.
    struct RecordingFactory {
        failing: Vec<Provider>,
        attempts: Mutex<Vec<String>>,
    }

    impl RecordingFactory {
        fn failing(failing: Vec<Provider>) -> Arc<Self> {
            Arc::new(Self {
                failing,
                attempts: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    impl ModelFactory for RecordingFactory {
        fn build(&self, config: &ModelConfig) -> Result<Arc<dyn LlmClient>, ResolveError> {
            self.attempts
                .lock()
                .unwrap()
                .push(format!("{}:{}", config.provider, config.model_name));
            if self.failing.contains(&config.provider) {
                return Err(ResolveError::MissingCredential {
                    provider: config.provider.to_string(),
                    var: "KEY".to_string(),
                });
            }
            Ok(Arc::new(ScriptedLlm::new(Vec::new())))
        }
    }

    #[test]
    fn test_parse_model_spec() {
        assert_eq!(
            ModelSpec::parse("google_genai:gemini-flash-latest"),
            ModelSpec {
                provider: Provider::GoogleGenAi,
                model: "gemini-flash-latest".to_string()
            }
        );
        assert_eq!(ModelSpec::parse("gpt-4o").provider, Provider::OpenAi);
        assert_eq!(
            ModelSpec::parse("groq:llama-3.1").provider,
            Provider::Other("groq".to_string())
        );
    }

    #[test]
    fn test_override_wins_when_constructible() {
        let factory = RecordingFactory::failing(vec![]);
        let resolver = ModelResolver::new(Some("google_genai:gemini-pro".into()), factory.clone());
        let handle = resolver
            .resolve(RoleHint::Coder, &ModelOverrides::default())
            .unwrap();
        assert_eq!(handle.source(), ModelSource::Override);
        assert_eq!(handle.config().model_name, "gemini-pro");
        assert_eq!(handle.config().temperature, Some(0.2));
        assert_eq!(factory.attempts(), vec!["google_genai:gemini-pro"]);
    }

    #[test]
    fn test_secondary_attempted_exactly_once_after_failures() {
        let factory = RecordingFactory::failing(vec![Provider::OpenAi]);
        let resolver = ModelResolver::new(Some("gpt-bogus".into()), factory.clone());
        let handle = resolver
            .resolve(RoleHint::Navigator, &ModelOverrides::default())
            .unwrap();
        assert_eq!(handle.source(), ModelSource::SecondaryDefault);
        assert_eq!(
            factory.attempts(),
            vec![
                "openai:gpt-bogus".to_string(),
                "openai:gpt-4o-mini".to_string(),
                "google_genai:gemini-flash-latest".to_string(),
            ]
        );
    }

    #[test]
    fn test_all_failures_propagate() {
        let factory = RecordingFactory::failing(vec![Provider::OpenAi, Provider::GoogleGenAi]);
        let resolver = ModelResolver::new(None, factory.clone());
        let err = resolver
            .resolve(RoleHint::Analyst, &ModelOverrides::default())
            .unwrap_err();
        assert!(matches!(err, ResolveError::MissingCredential { .. }));
        assert_eq!(factory.attempts().len(), 2);
    }

    #[test]
    fn test_overrides_beat_role_defaults() {
        let factory = RecordingFactory::failing(vec![]);
        let resolver = ModelResolver::new(None, factory);
        let overrides = ModelOverrides {
            temperature: Some(0.9),
            ..Default::default()
        };
        let handle = resolver.resolve(RoleHint::Browser, &overrides).unwrap();
        assert_eq!(handle.config().temperature, Some(0.9));
        assert_eq!(handle.source(), ModelSource::PrimaryDefault);
    }

    #[test]
    fn test_env_factory_checks_credentials() {
        let config = |provider: Provider| ModelConfig {
            provider,
            model_name: "m".to_string(),
            temperature: None,
            extra: Map::new(),
        };

        let empty = EnvModelFactory::with_vars(HashMap::new());
        assert!(empty.build(&config(Provider::OpenAi)).is_err());
        assert!(empty.build(&config(Provider::GoogleGenAi)).is_err());
        assert!(matches!(
            empty.build(&config(Provider::Other("groq".into()))),
            Err(ResolveError::UnconfiguredProvider(..))
        ));

        let vars = HashMap::from([
            ("OPENAI_API_KEY".to_string(), "sk-test".to_string()),
            ("GEMINI_API_KEY".to_string(), "g-test".to_string()),
            ("GROQ_BASE_URL".to_string(), "https://api.groq.com/openai/v1".to_string()),
            ("GROQ_API_KEY".to_string(), "gq".to_string()),
        ]);
        let factory = EnvModelFactory::with_vars(vars);
        assert!(factory.build(&config(Provider::OpenAi)).is_ok());
        assert!(factory.build(&config(Provider::GoogleGenAi)).is_ok());
        assert!(factory.build(&config(Provider::Other("groq".into()))).is_ok());
    }
}
