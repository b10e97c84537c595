//! Uniform text generation across one or more LLM backends.
//!
//! The gateway hides provider selection, per-stage temperature profiles, and
//! fallback behind one [`LlmGateway`] trait. [`HttpLlmGateway`] is the
//! concrete implementation, speaking to any OpenAI-compatible chat
//! completion endpoint (including local inference servers that implement
//! the same wire shape) over a pooled `reqwest::Client`.

use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::config::{LlmConfig, LlmProvider};
use crate::registry::Language;

/// The stage a generation call is being made on behalf of. Each stage has a
/// fixed temperature profile and governs which prompt template is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Summarization,
    Research,
    Compression,
    FinalReport,
}

impl Stage {
    #[must_use]
    pub fn temperature(self) -> f32 {
        match self {
            Stage::Summarization => 0.1,
            Stage::Research => 0.3,
            Stage::Compression => 0.2,
            Stage::FinalReport => 0.4,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Summarization => "summarization",
            Stage::Research => "research",
            Stage::Compression => "compression",
            Stage::FinalReport => "final_report",
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum LlmGatewayError {
    #[error("all configured LLM providers failed")]
    #[diagnostic(
        code(deepresearch::llm::unavailable),
        help("Verify `llm.local_endpoint`/`llm.openai_endpoint` are reachable and the model name is correct.")
    )]
    Unavailable { attempts: Vec<String> },

    #[error("request to provider `{provider}` timed out")]
    #[diagnostic(code(deepresearch::llm::timeout))]
    Timeout { provider: &'static str },

    #[error("provider `{provider}` returned an error: {message}")]
    #[diagnostic(code(deepresearch::llm::provider))]
    Provider { provider: &'static str, message: String },

    #[error("no provider is configured for stage `{stage}`")]
    #[diagnostic(code(deepresearch::llm::not_configured))]
    NotConfigured { stage: &'static str },
}

pub type Result<T> = std::result::Result<T, LlmGatewayError>;

/// Bound on a health-check probe against any backend; unrelated to a
/// generation call's own request timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Uniform generation contract consumed by the Workflow Engine and the
/// research scheduler.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn generate(
        &self,
        stage: Stage,
        prompt: &str,
        language: Language,
    ) -> Result<String>;

    /// Whether some configured provider answers a minimal probe within a
    /// bounded window. Used for health reporting only.
    async fn probe(&self) -> bool {
        tokio::time::timeout(PROBE_TIMEOUT, self.generate(Stage::Research, "ping", Language::En))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}

#[derive(Debug, Clone, Copy)]
enum ProviderKind {
    Local,
    OpenAi,
}

impl ProviderKind {
    fn label(self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::OpenAi => "openai-compatible",
        }
    }
}

/// Default gateway implementation: an ordered list of OpenAI-compatible
/// endpoints tried in sequence, falling back on error or timeout.
pub struct HttpLlmGateway {
    client: reqwest::Client,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    providers: Vec<(ProviderKind, String)>,
}

impl HttpLlmGateway {
    #[must_use]
    pub fn new(config: &LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let mut providers = Vec::new();
        match config.provider {
            LlmProvider::Local => {
                if let Some(url) = &config.local_endpoint {
                    providers.push((ProviderKind::Local, url.clone()));
                }
            }
            LlmProvider::OpenAiCompatible => {
                if let Some(url) = &config.openai_endpoint {
                    providers.push((ProviderKind::OpenAi, url.clone()));
                }
            }
            LlmProvider::Hybrid => {
                if let Some(url) = &config.local_endpoint {
                    providers.push((ProviderKind::Local, url.clone()));
                }
                if let Some(url) = &config.openai_endpoint {
                    providers.push((ProviderKind::OpenAi, url.clone()));
                }
            }
        }

        Self {
            client,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_millis(config.request_timeout_ms),
            providers,
        }
    }

    async fn call_provider(&self, url: &str, stage: Stage, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: self.model.clone(),
            temperature: stage.temperature(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt.to_string(),
            }],
        };

        let mut request = self
            .client
            .post(format!("{}/chat/completions", url.trim_end_matches('/')))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let label = "http";
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| LlmGatewayError::Timeout { provider: label })?
            .map_err(|e| LlmGatewayError::Provider {
                provider: label,
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(LlmGatewayError::Provider {
                provider: label,
                message: format!("HTTP {}", response.status()),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| LlmGatewayError::Provider {
            provider: label,
            message: e.to_string(),
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(LlmGatewayError::Provider {
                provider: label,
                message: "empty choices array".to_string(),
            })
    }
}

#[async_trait]
impl LlmGateway for HttpLlmGateway {
    #[instrument(skip(self, prompt), fields(stage = stage.as_str()), err)]
    async fn generate(&self, stage: Stage, prompt: &str, _language: Language) -> Result<String> {
        if self.providers.is_empty() {
            return Err(LlmGatewayError::NotConfigured { stage: stage.as_str() });
        }

        let mut attempts = Vec::new();
        for (kind, url) in &self.providers {
            match self.call_provider(url, stage, prompt).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(provider = kind.label(), error = %e, "llm provider failed, trying fallback");
                    attempts.push(format!("{}: {e}", kind.label()));
                }
            }
        }
        Err(LlmGatewayError::Unavailable { attempts })
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    messages: Vec<ChatMessage>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_temperatures_match_profile() {
        assert_eq!(Stage::Summarization.temperature(), 0.1);
        assert_eq!(Stage::Research.temperature(), 0.3);
        assert_eq!(Stage::Compression.temperature(), 0.2);
        assert_eq!(Stage::FinalReport.temperature(), 0.4);
    }

    #[tokio::test]
    async fn generate_without_providers_is_not_configured() {
        let cfg = LlmConfig {
            local_endpoint: None,
            openai_endpoint: None,
            ..LlmConfig::default()
        };
        let gateway = HttpLlmGateway::new(&cfg);
        let err = gateway
            .generate(Stage::Research, "hi", Language::En)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmGatewayError::NotConfigured { .. }));
    }

    #[tokio::test]
    async fn probe_is_false_without_providers() {
        let cfg = LlmConfig {
            local_endpoint: None,
            openai_endpoint: None,
            ..LlmConfig::default()
        };
        let gateway = HttpLlmGateway::new(&cfg);
        assert!(!gateway.probe().await);
    }
}
