//! TOML configuration with environment overrides.
//!
//! Every section is optional; a missing key falls back to the defaults the
//! bot has always shipped with (5 requests per minute, 30 per hour,
//! `gpt-4o-mini` for chat, `gpt-4` for Q&A). After the file is parsed, the
//! environment-style keys listed in [`apply_env_overrides`] are applied on
//! top, so a deployment can be tuned without editing the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::extract::FileFormat;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub moderation: ModerationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/edue.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct BotConfig {
    /// Invocation prefix for commands, e.g. `!ask`.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// The bot's own user id, used to recognise mentions.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Users allowed to run admin commands (`rlstats`, `rlreset`, `reindex`).
    #[serde(default)]
    pub admins: Vec<String>,
    #[serde(default = "default_max_reply_chars")]
    pub max_reply_chars: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            user_id: None,
            admins: Vec::new(),
            max_reply_chars: default_max_reply_chars(),
        }
    }
}

fn default_prefix() -> String {
    "!".to_string()
}
fn default_max_reply_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    #[serde(default = "default_content_root")]
    pub root: PathBuf,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            root: default_content_root(),
            max_file_bytes: default_max_file_bytes(),
            extensions: default_extensions(),
        }
    }
}

fn default_content_root() -> PathBuf {
    PathBuf::from("./content")
}
fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_extensions() -> Vec<String> {
    ["pdf", "docx", "txt", "md"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    350
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the provider API (OpenAI-compatible or Ollama).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_timeout_secs(),
            api_key: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_chat_profile")]
    pub chat: ProfileConfig,
    #[serde(default = "default_qa_profile")]
    pub qa: ProfileConfig,
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            url: None,
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_timeout_secs(),
            chat: default_chat_profile(),
            qa: default_qa_profile(),
            api_key: None,
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}

/// Model, sampling temperature and output cap for one pipeline.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProfileConfig {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_profile_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_profile_max_tokens() -> u32 {
    500
}

fn default_chat_profile() -> ProfileConfig {
    ProfileConfig {
        model: "gpt-4o-mini".to_string(),
        temperature: 0.7,
        max_tokens: 500,
    }
}

fn default_qa_profile() -> ProfileConfig {
    ProfileConfig {
        model: "gpt-4".to_string(),
        temperature: 0.1,
        max_tokens: 800,
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_context_budget")]
    pub context_budget_tokens: usize,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_integrity_check")]
    pub integrity_check: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            context_budget_tokens: default_context_budget(),
            history_turns: default_history_turns(),
            max_sources: default_max_sources(),
            timeout_secs: default_retrieval_timeout(),
            integrity_check: default_integrity_check(),
        }
    }
}

fn default_top_k() -> usize {
    3
}
fn default_context_budget() -> usize {
    3000
}
fn default_history_turns() -> usize {
    6
}
fn default_max_sources() -> usize {
    3
}
fn default_retrieval_timeout() -> u64 {
    15
}
fn default_integrity_check() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
        }
    }
}

fn default_per_minute() -> u32 {
    5
}
fn default_per_hour() -> u32 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Channels quiet for this long are forgotten by the server.
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            idle_minutes: default_idle_minutes(),
        }
    }
}

fn default_max_turns() -> usize {
    10
}
fn default_idle_minutes() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModerationConfig {
    #[serde(default)]
    pub blacklist: Option<PathBuf>,
    #[serde(default)]
    pub whitelist: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

/// Load, override and validate a configuration file.
///
/// A `.env` file next to the working directory is loaded first (outside
/// tests), then the TOML file, then [`apply_env_overrides`] with the process
/// environment.
pub fn load_config(path: &Path) -> Result<Config> {
    if !cfg!(test) {
        dotenvy::dotenv().ok();
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;

    Ok(config)
}

/// Apply environment-style overrides using the given lookup.
///
/// | Key | Field |
/// |-----|-------|
/// | `COMMAND_PREFIX` | `bot.prefix` |
/// | `BOT_USER_ID` | `bot.user_id` |
/// | `RATE_LIMIT_PER_MINUTE` | `rate_limit.per_minute` |
/// | `RATE_LIMIT_PER_HOUR` | `rate_limit.per_hour` |
/// | `CHAT_MODEL` | `generation.chat.model` |
/// | `QA_MODEL` | `generation.qa.model` |
/// | `MAX_FILE_SIZE` | `content.max_file_bytes` |
/// | `SUPPORTED_EXTENSIONS` | `content.extensions` (comma separated) |
/// | `OPENAI_API_KEY` | API key for both OpenAI clients |
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(prefix) = lookup("COMMAND_PREFIX") {
        config.bot.prefix = prefix;
    }
    if let Some(id) = lookup("BOT_USER_ID") {
        config.bot.user_id = Some(id);
    }
    if let Some(v) = lookup("RATE_LIMIT_PER_MINUTE") {
        config.rate_limit.per_minute = parse_number("RATE_LIMIT_PER_MINUTE", &v)?;
    }
    if let Some(v) = lookup("RATE_LIMIT_PER_HOUR") {
        config.rate_limit.per_hour = parse_number("RATE_LIMIT_PER_HOUR", &v)?;
    }
    if let Some(model) = lookup("CHAT_MODEL") {
        config.generation.chat.model = model;
    }
    if let Some(model) = lookup("QA_MODEL") {
        config.generation.qa.model = model;
    }
    if let Some(v) = lookup("MAX_FILE_SIZE") {
        config.content.max_file_bytes = parse_number("MAX_FILE_SIZE", &v)?;
    }
    if let Some(v) = lookup("SUPPORTED_EXTENSIONS") {
        config.content.extensions = v
            .split(',')
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
    }
    if let Some(key) = lookup("OPENAI_API_KEY") {
        config.generation.api_key = Some(key.clone());
        config.embedding.api_key = Some(key);
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("{} must be a non-negative integer, got '{}'", key, value))
}

pub fn validate(config: &Config) -> Result<()> {
    if config.bot.prefix.trim().is_empty() {
        bail!("bot.prefix must not be empty");
    }
    if config.bot.max_reply_chars < 100 {
        bail!("bot.max_reply_chars must be >= 100");
    }

    if config.rate_limit.per_minute == 0 || config.rate_limit.per_hour == 0 {
        bail!("rate_limit.per_minute and rate_limit.per_hour must be > 0");
    }

    if config.conversation.idle_minutes == 0 {
        bail!("conversation.idle_minutes must be > 0");
    }

    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.context_budget_tokens == 0 {
        bail!("retrieval.context_budget_tokens must be > 0");
    }

    if config.content.extensions.is_empty() {
        bail!("content.extensions must list at least one extension");
    }
    for ext in &config.content.extensions {
        if FileFormat::from_extension(ext).is_none() {
            bail!(
                "Unsupported extension in content.extensions: '{}'. Known: pdf, docx, txt, md, markdown",
                ext
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
            other
        ),
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama")
        && config.embedding.model.is_none()
    {
        bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    match config.generation.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown generation provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(toml_src: &str) -> Config {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let cfg = parse("");
        assert_eq!(cfg.bot.prefix, "!");
        assert_eq!(cfg.rate_limit.per_minute, 5);
        assert_eq!(cfg.rate_limit.per_hour, 30);
        assert_eq!(cfg.generation.chat.model, "gpt-4o-mini");
        assert_eq!(cfg.generation.qa.model, "gpt-4");
        assert_eq!(cfg.retrieval.top_k, 3);
        assert_eq!(cfg.conversation.idle_minutes, 60);
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn test_profile_defaults_fill_missing_keys() {
        let cfg = parse(
            r#"
            [generation.chat]
            model = "small-model"
            "#,
        );
        assert_eq!(cfg.generation.chat.model, "small-model");
        assert_eq!(cfg.generation.chat.max_tokens, 500);
        assert_eq!(cfg.generation.qa.model, "gpt-4");
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = parse("");
        let env: HashMap<&str, &str> = [
            ("COMMAND_PREFIX", "?"),
            ("RATE_LIMIT_PER_MINUTE", "2"),
            ("RATE_LIMIT_PER_HOUR", "12"),
            ("CHAT_MODEL", "chat-x"),
            ("QA_MODEL", "qa-y"),
            ("MAX_FILE_SIZE", "2048"),
            ("SUPPORTED_EXTENSIONS", ".PDF, md"),
            ("OPENAI_API_KEY", "sk-test"),
        ]
        .into_iter()
        .collect();

        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.bot.prefix, "?");
        assert_eq!(cfg.rate_limit.per_minute, 2);
        assert_eq!(cfg.rate_limit.per_hour, 12);
        assert_eq!(cfg.generation.chat.model, "chat-x");
        assert_eq!(cfg.generation.qa.model, "qa-y");
        assert_eq!(cfg.content.max_file_bytes, 2048);
        assert_eq!(cfg.content.extensions, vec!["pdf", "md"]);
        assert_eq!(cfg.generation.api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.embedding.api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_invalid_env_number_rejected() {
        let mut cfg = parse("");
        let err = apply_env_overrides(&mut cfg, |k| {
            (k == "RATE_LIMIT_PER_MINUTE").then(|| "five".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("RATE_LIMIT_PER_MINUTE"));
    }

    #[test]
    fn test_validate_rejects_unknown_extension() {
        let mut cfg = parse("");
        cfg.content.extensions.push("exe".to_string());
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ceiling() {
        let mut cfg = parse("");
        cfg.rate_limit.per_minute = 0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn test_validate_requires_model_for_openai_embeddings() {
        let cfg = parse(
            r#"
            [embedding]
            provider = "openai"
            "#,
        );
        assert!(validate(&cfg).is_err());
    }
}
