//! Layered configuration for the research engine.
//!
//! Options are loaded from environment variables (optionally via a `.env`
//! file through `dotenvy`) into one validated [`EngineConfig`]. Unknown
//! `engine.*`/`llm.*`/`search.*`/`store.*` keys are a startup error rather
//! than a silently ignored one, matching the rest of the workflow's
//! fail-fast posture.

use std::collections::HashSet;
use std::env;

use miette::Diagnostic;
use thiserror::Error;

use crate::store::Depth;

/// Errors raised while assembling [`EngineConfig`] from the environment.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid value for `{key}`: {value}")]
    #[diagnostic(code(deepresearch::config::invalid_value))]
    InvalidValue { key: &'static str, value: String },

    #[error("unrecognised configuration key: {key}")]
    #[diagnostic(
        code(deepresearch::config::unknown_key),
        help("Remove `{key}` or check for a typo against a recognised `engine.*`/`llm.*`/`search.*`/`store.*` key.")
    )]
    UnknownKey { key: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// LLM provider routing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Local,
    OpenAiCompatible,
    Hybrid,
}

impl LlmProvider {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "local" => Ok(Self::Local),
            "openai-compatible" => Ok(Self::OpenAiCompatible),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(ConfigError::InvalidValue {
                key: "llm.provider",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub local_endpoint: Option<String>,
    pub openai_endpoint: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub stream_enabled: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Local,
            local_endpoint: Some("http://localhost:11434/v1".to_string()),
            openai_endpoint: None,
            model: "llama3.1".to_string(),
            api_key: None,
            request_timeout_ms: 60_000,
            stream_enabled: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub max_results: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: None,
            max_results: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// `sqlite:<path>` or `memory:` (the in-memory backend).
    pub url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "memory:".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_iterations_by_depth: [u32; 3], // shallow, medium, deep
    pub slot_timeout_ms: u64,
    pub content_truncation: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_iterations_by_depth: [3, 4, 6],
            slot_timeout_ms: 120_000,
            content_truncation: 500,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn max_iterations(&self, depth: Depth) -> u32 {
        match depth {
            Depth::Shallow => self.max_iterations_by_depth[0],
            Depth::Medium => self.max_iterations_by_depth[1],
            Depth::Deep => self.max_iterations_by_depth[2],
        }
    }
}

/// Aggregated, validated configuration for one engine instance.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
    pub log_level: String,
}

const KNOWN_KEYS: &[&str] = &[
    "LLM_PROVIDER",
    "LLM_LOCAL_ENDPOINT",
    "LLM_OPENAI_ENDPOINT",
    "LLM_MODEL",
    "LLM_API_KEY",
    "LLM_REQUEST_TIMEOUT_MS",
    "LLM_STREAM_ENABLED",
    "SEARCH_API_KEY",
    "SEARCH_ENDPOINT",
    "SEARCH_MAX_RESULTS",
    "STORE_URL",
    "ENGINE_SLOT_TIMEOUT_MS",
    "ENGINE_CONTENT_TRUNCATION",
    "ENGINE_MAX_ITERATIONS_SHALLOW",
    "ENGINE_MAX_ITERATIONS_MEDIUM",
    "ENGINE_MAX_ITERATIONS_DEEP",
    "LOG_LEVEL",
];

impl EngineConfig {
    /// Load configuration from the process environment, having first loaded
    /// any `.env` file found via `dotenvy` (a missing file is not an error).
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_env_vars(env::vars())
    }

    /// Build configuration from an explicit iterator of key/value pairs,
    /// rejecting any `DEEPRESEARCH_`-prefixed key not in [`KNOWN_KEYS`].
    ///
    /// Non-prefixed environment variables (PATH, HOME, ...) are ignored;
    /// only the `DEEPRESEARCH_`-namespaced surface is validated.
    pub fn from_env_vars(vars: impl Iterator<Item = (String, String)>) -> Result<Self> {
        const PREFIX: &str = "DEEPRESEARCH_";
        let known: HashSet<&str> = KNOWN_KEYS.iter().copied().collect();
        let mut raw = std::collections::HashMap::new();
        for (key, value) in vars {
            let Some(suffix) = key.strip_prefix(PREFIX) else {
                continue;
            };
            if !known.contains(suffix) {
                return Err(ConfigError::UnknownKey {
                    key: key.clone(),
                });
            }
            raw.insert(suffix.to_string(), value);
        }

        let mut cfg = EngineConfig::default();

        if let Some(v) = raw.get("LLM_PROVIDER") {
            cfg.llm.provider = LlmProvider::parse(v)?;
        }
        if let Some(v) = raw.get("LLM_LOCAL_ENDPOINT") {
            cfg.llm.local_endpoint = Some(v.clone());
        }
        if let Some(v) = raw.get("LLM_OPENAI_ENDPOINT") {
            cfg.llm.openai_endpoint = Some(v.clone());
        }
        if let Some(v) = raw.get("LLM_MODEL") {
            cfg.llm.model = v.clone();
        }
        if let Some(v) = raw.get("LLM_API_KEY") {
            cfg.llm.api_key = Some(v.clone());
        }
        if let Some(v) = raw.get("LLM_REQUEST_TIMEOUT_MS") {
            cfg.llm.request_timeout_ms = parse_u64(v, "llm.request_timeout_ms")?;
        }
        if let Some(v) = raw.get("LLM_STREAM_ENABLED") {
            cfg.llm.stream_enabled = parse_bool(v, "llm.stream_enabled")?;
        }
        if let Some(v) = raw.get("SEARCH_API_KEY") {
            cfg.search.api_key = Some(v.clone());
        }
        if let Some(v) = raw.get("SEARCH_ENDPOINT") {
            cfg.search.endpoint = Some(v.clone());
        }
        if let Some(v) = raw.get("SEARCH_MAX_RESULTS") {
            cfg.search.max_results = parse_u64(v, "search.max_results")? as usize;
        }
        if let Some(v) = raw.get("STORE_URL") {
            cfg.store.url = v.clone();
        }
        if let Some(v) = raw.get("ENGINE_SLOT_TIMEOUT_MS") {
            cfg.scheduler.slot_timeout_ms = parse_u64(v, "engine.slot_timeout_ms")?;
        }
        if let Some(v) = raw.get("ENGINE_CONTENT_TRUNCATION") {
            cfg.scheduler.content_truncation = parse_u64(v, "engine.content_truncation")? as usize;
        }
        if let Some(v) = raw.get("ENGINE_MAX_ITERATIONS_SHALLOW") {
            cfg.scheduler.max_iterations_by_depth[0] =
                parse_u64(v, "engine.max_iterations_shallow")? as u32;
        }
        if let Some(v) = raw.get("ENGINE_MAX_ITERATIONS_MEDIUM") {
            cfg.scheduler.max_iterations_by_depth[1] =
                parse_u64(v, "engine.max_iterations_medium")? as u32;
        }
        if let Some(v) = raw.get("ENGINE_MAX_ITERATIONS_DEEP") {
            cfg.scheduler.max_iterations_by_depth[2] =
                parse_u64(v, "engine.max_iterations_deep")? as u32;
        }
        if let Some(v) = raw.get("LOG_LEVEL") {
            cfg.log_level = v.clone();
        } else if cfg.log_level.is_empty() {
            cfg.log_level = "info".to_string();
        }

        Ok(cfg)
    }
}

fn parse_u64(value: &str, key: &'static str) -> Result<u64> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_bool(value: &str, key: &'static str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key,
            value: other.to_string(),
        }),
    }
}
