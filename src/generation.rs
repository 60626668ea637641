//! Text generation behind the [`Generator`] trait.
//!
//! The pipelines never talk HTTP directly: they build a list of
//! [`ChatMessage`]s, pick a [`GenerationProfile`] (chat or Q&A), and hand
//! both to whichever generator was created at startup.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{GenerationConfig, ProfileConfig};
use crate::error::{BotError, BotResult};
use crate::http::{client_with_timeout, post_json, CallError, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Model and sampling settings for one kind of request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationProfile {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl From<&ProfileConfig> for GenerationProfile {
    fn from(cfg: &ProfileConfig) -> Self {
        Self {
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        }
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a completion. Errors and timeouts are [`BotError::Generation`].
    async fn generate(
        &self,
        profile: &GenerationProfile,
        messages: &[ChatMessage],
    ) -> BotResult<String>;
}

fn generation_error(err: CallError) -> BotError {
    if err.is_timeout() {
        BotError::Generation(format!("timed out: {}", err))
    } else {
        BotError::Generation(err.to_string())
    }
}

// ============ Disabled ============

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate(
        &self,
        _profile: &GenerationProfile,
        _messages: &[ChatMessage],
    ) -> BotResult<String> {
        Err(BotError::Generation(
            "generation provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI ============

/// Chat completions against an OpenAI-compatible API
/// (`POST {url}/chat/completions`, default `https://api.openai.com/v1`).
pub struct OpenAiGenerator {
    client: reqwest::Client,
    url: String,
    api_key: String,
    policy: RetryPolicy,
}

impl OpenAiGenerator {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
        policy: RetryPolicy,
    ) -> Self {
        let url = url.into();
        Self {
            client: client_with_timeout(timeout),
            url: url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            policy,
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self::new(
            config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            Duration::from_secs(config.timeout_secs),
            RetryPolicy {
                max_retries: config.max_retries,
                backoff_ms: config.retry_backoff_ms,
            },
        ))
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(
        &self,
        profile: &GenerationProfile,
        messages: &[ChatMessage],
    ) -> BotResult<String> {
        let body = serde_json::json!({
            "model": profile.model,
            "messages": messages,
            "max_tokens": profile.max_tokens,
            "temperature": profile.temperature,
        });

        let json = post_json(
            &self.client,
            &format!("{}/chat/completions", self.url),
            Some(&self.api_key),
            &body,
            &self.policy,
            "OpenAI",
        )
        .await
        .map_err(generation_error)?;

        parse_openai_completion(&json)
    }
}

fn parse_openai_completion(json: &serde_json::Value) -> BotResult<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            BotError::Generation("invalid completion response: missing content".to_string())
        })
}

// ============ Ollama ============

/// Chat against a local Ollama instance (`POST {url}/api/chat`, non-streaming).
pub struct OllamaGenerator {
    client: reqwest::Client,
    url: String,
    policy: RetryPolicy,
}

impl OllamaGenerator {
    pub fn from_config(config: &GenerationConfig) -> Self {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Self {
            client: client_with_timeout(Duration::from_secs(config.timeout_secs)),
            url: url.trim_end_matches('/').to_string(),
            policy: RetryPolicy {
                max_retries: config.max_retries,
                backoff_ms: config.retry_backoff_ms,
            },
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(
        &self,
        profile: &GenerationProfile,
        messages: &[ChatMessage],
    ) -> BotResult<String> {
        let body = serde_json::json!({
            "model": profile.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": profile.temperature,
                "num_predict": profile.max_tokens,
            },
        });

        let json = post_json(
            &self.client,
            &format!("{}/api/chat", self.url),
            None,
            &body,
            &self.policy,
            "Ollama",
        )
        .await
        .map_err(generation_error)?;

        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                BotError::Generation("invalid Ollama response: missing message".to_string())
            })
    }
}

/// Create the [`Generator`] named by `generation.provider`.
pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "openai" => Ok(Arc::new(OpenAiGenerator::from_config(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::from_config(config))),
        other => bail!("Unknown generation provider: {}", other),
    }
}

/// Run `generate` under an overall deadline covering all retries.
pub async fn generate_with_timeout(
    generator: &dyn Generator,
    profile: &GenerationProfile,
    messages: &[ChatMessage],
    timeout: Duration,
) -> BotResult<String> {
    match tokio::time::timeout(timeout, generator.generate(profile, messages)).await {
        Ok(result) => result,
        Err(_) => Err(BotError::Generation(format!(
            "timed out after {}s",
            timeout.as_secs_f64()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_serialize_openai_shape() {
        let json = serde_json::to_value(vec![
            ChatMessage::system("be kind"),
            ChatMessage::user("hi"),
        ])
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                { "role": "system", "content": "be kind" },
                { "role": "user", "content": "hi" }
            ])
        );
    }

    #[test]
    fn test_parse_completion_trims() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "  Paris.\n" } }]
        });
        assert_eq!(parse_openai_completion(&json).unwrap(), "Paris.");
    }

    #[test]
    fn test_parse_completion_missing_content() {
        let json = serde_json::json!({ "choices": [] });
        assert!(matches!(
            parse_openai_completion(&json),
            Err(BotError::Generation(_))
        ));
    }

    struct Stalls;

    #[async_trait]
    impl Generator for Stalls {
        fn name(&self) -> &str {
            "stalls"
        }
        async fn generate(
            &self,
            _profile: &GenerationProfile,
            _messages: &[ChatMessage],
        ) -> BotResult<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".to_string())
        }
    }

    #[tokio::test]
    async fn test_deadline_maps_to_generation_error() {
        let profile = GenerationProfile {
            model: "m".to_string(),
            temperature: 0.0,
            max_tokens: 10,
        };
        let err = generate_with_timeout(&Stalls, &profile, &[], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BotError::Generation(msg) if msg.contains("timed out")));
    }
}
