//! Built-in [`Handler`] implementations.
//!
//! | Command | Handler | Rate limited | Admin |
//! |---------|---------|--------------|-------|
//! | `ask` | [`AskHandler`] | yes | no |
//! | `chat`, mention | [`ChatHandler`] | yes | no |
//! | `quiz` | [`QuizHandler`] | yes | no |
//! | `help` | [`HelpHandler`] | no | no |
//! | `clear` | [`ClearHandler`] | no | no |
//! | `stats` | [`StatsHandler`] | yes | no |
//! | `rlstats` | [`RateLimitStatsHandler`] | no | yes |
//! | `rlreset` | [`RateLimitResetHandler`] | no | yes |
//! | `rlconfig` | [`RateLimitConfigHandler`] | no | yes |
//! | `reindex` | [`ReindexHandler`] | no | yes |
//!
//! `ask`, `chat` and `quiz` answer an empty request with a usage hint, which
//! the dispatcher sends before rate limiting.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::chat::ChatPipeline;
use crate::conversation::ConversationStore;
use crate::dispatch::{Handler, Request};
use crate::error::BotResult;
use crate::index::SimilarityIndex;
use crate::ingest::Ingestor;
use crate::models::Reply;
use crate::qa::QaPipeline;
use crate::rate_limit::{RateLimiter, WindowUsage};

// ═══════════════════════════════════════════════════════════════════════
// Pipelines
// ═══════════════════════════════════════════════════════════════════════

pub const ASK_USAGE: &str = "Please provide a question to ask!";
pub const CHAT_USAGE: &str = "Please provide a question or message! You can also just mention me.";
pub const QUIZ_USAGE: &str = "Please provide a topic for the quiz!";

pub struct AskHandler {
    qa: Arc<QaPipeline>,
}

impl AskHandler {
    pub fn new(qa: Arc<QaPipeline>) -> Self {
        Self { qa }
    }
}

#[async_trait]
impl Handler for AskHandler {
    fn name(&self) -> &str {
        "ask"
    }

    fn description(&self) -> &str {
        "Ask a question about the course materials, answered with sources"
    }

    fn usage_hint(&self) -> Option<&str> {
        Some(ASK_USAGE)
    }

    async fn handle(&self, request: &Request) -> BotResult<Reply> {
        if request.args.is_empty() {
            return Ok(Reply::text(ASK_USAGE));
        }
        let answer = self
            .qa
            .answer(
                &request.args,
                &request.message.channel_id,
                &request.message.user_id,
            )
            .await?;
        Ok(Reply::text(answer.answer).with_citations(answer.citations))
    }
}

/// Serves both `chat` and mentions.
pub struct ChatHandler {
    chat: Arc<ChatPipeline>,
}

impl ChatHandler {
    pub fn new(chat: Arc<ChatPipeline>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl Handler for ChatHandler {
    fn name(&self) -> &str {
        "chat"
    }

    fn description(&self) -> &str {
        "Have a conversation with Edue Helper (or just mention the bot)"
    }

    fn usage_hint(&self) -> Option<&str> {
        Some(CHAT_USAGE)
    }

    async fn handle(&self, request: &Request) -> BotResult<Reply> {
        if request.args.is_empty() {
            return Ok(Reply::text(CHAT_USAGE));
        }
        let text = self
            .chat
            .respond(
                &request.args,
                &request.message.channel_id,
                &request.message.user_id,
                request.message.display_name(),
            )
            .await?;
        Ok(Reply::text(text))
    }
}

pub struct QuizHandler {
    qa: Arc<QaPipeline>,
}

impl QuizHandler {
    pub fn new(qa: Arc<QaPipeline>) -> Self {
        Self { qa }
    }
}

#[async_trait]
impl Handler for QuizHandler {
    fn name(&self) -> &str {
        "quiz"
    }

    fn description(&self) -> &str {
        "Generate a 3-question practice quiz on a topic"
    }

    fn usage_hint(&self) -> Option<&str> {
        Some(QUIZ_USAGE)
    }

    async fn handle(&self, request: &Request) -> BotResult<Reply> {
        if request.args.is_empty() {
            return Ok(Reply::text(QUIZ_USAGE));
        }
        let quiz = self
            .qa
            .quiz(&request.args, &request.message.channel_id)
            .await?;
        Ok(Reply::text(format!("**Quiz: {}**\n\n{}", request.args, quiz.answer))
            .with_citations(quiz.citations))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Housekeeping
// ═══════════════════════════════════════════════════════════════════════

pub struct HelpHandler {
    text: String,
}

impl HelpHandler {
    /// `commands` is `(name, description)` for every other route.
    pub fn new(prefix: &str, commands: &[(String, String)]) -> Self {
        let mut text = String::from("**What I can help you with**\n");
        let mut sorted: Vec<_> = commands.to_vec();
        sorted.push(("help".to_string(), "Show this message".to_string()));
        sorted.sort();
        for (name, description) in &sorted {
            text.push_str(&format!("\n`{}{}`: {}", prefix, name, description));
        }
        text.push_str("\n\nYou can also mention me in any message to chat.");
        Self { text }
    }
}

#[async_trait]
impl Handler for HelpHandler {
    fn name(&self) -> &str {
        "help"
    }

    fn description(&self) -> &str {
        "Show this message"
    }

    fn rate_limited(&self) -> bool {
        false
    }

    async fn handle(&self, _request: &Request) -> BotResult<Reply> {
        Ok(Reply::text(self.text.clone()))
    }
}

pub struct ClearHandler {
    conversations: Arc<ConversationStore>,
}

impl ClearHandler {
    pub fn new(conversations: Arc<ConversationStore>) -> Self {
        Self { conversations }
    }
}

#[async_trait]
impl Handler for ClearHandler {
    fn name(&self) -> &str {
        "clear"
    }

    fn description(&self) -> &str {
        "Clear this channel's conversation history"
    }

    fn rate_limited(&self) -> bool {
        false
    }

    async fn handle(&self, request: &Request) -> BotResult<Reply> {
        let removed = self
            .conversations
            .clear(&request.message.channel_id)
            .await;
        Ok(Reply::text(format!(
            "Conversation history cleared ({} messages).",
            removed
        )))
    }
}

pub struct StatsHandler {
    index: Arc<dyn SimilarityIndex>,
    conversations: Arc<ConversationStore>,
}

impl StatsHandler {
    pub fn new(index: Arc<dyn SimilarityIndex>, conversations: Arc<ConversationStore>) -> Self {
        Self {
            index,
            conversations,
        }
    }
}

#[async_trait]
impl Handler for StatsHandler {
    fn name(&self) -> &str {
        "stats"
    }

    fn description(&self) -> &str {
        "Show Q&A system statistics"
    }

    async fn handle(&self, _request: &Request) -> BotResult<Reply> {
        let stats = self.index.stats().await?;
        let status = if stats.passages > 0 {
            "Online"
        } else {
            "Offline (no documents indexed)"
        };
        let mut text = format!(
            "**Q&A System Statistics**\nStatus: {}\nIndexed documents: {}\nPassages: {}\nActive conversations: {}",
            status,
            stats.documents,
            stats.passages,
            self.conversations.active_channels()
        );
        if !stats.categories.is_empty() {
            let categories: Vec<String> = stats
                .categories
                .iter()
                .map(|(name, n)| format!("{} ({})", name, n))
                .collect();
            text.push_str(&format!("\nCategories: {}", categories.join(", ")));
        }
        Ok(Reply::text(text))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Admin
// ═══════════════════════════════════════════════════════════════════════

pub struct RateLimitStatsHandler {
    limiter: Arc<RateLimiter>,
}

impl RateLimitStatsHandler {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

fn usage_line(label: &str, usage: &WindowUsage) -> String {
    match usage.window_start {
        Some(start) => format!(
            "{}: {}/{} used, {} remaining (window started {})",
            label,
            usage.used,
            usage.limit,
            usage.remaining,
            start.format("%H:%M:%S UTC")
        ),
        None => format!(
            "{}: {}/{} used, {} remaining",
            label, usage.used, usage.limit, usage.remaining
        ),
    }
}

#[async_trait]
impl Handler for RateLimitStatsHandler {
    fn name(&self) -> &str {
        "rlstats"
    }

    fn description(&self) -> &str {
        "Show rate limit usage for a user (admin)"
    }

    fn rate_limited(&self) -> bool {
        false
    }

    fn admin_only(&self) -> bool {
        true
    }

    async fn handle(&self, request: &Request) -> BotResult<Reply> {
        let user = if request.args.is_empty() {
            request.message.user_id.as_str()
        } else {
            request.args.as_str()
        };
        let usage = self.limiter.usage(user, request.received_at).await?;
        Ok(Reply::text(format!(
            "**Rate limit stats for {}**\n{}\n{}",
            user,
            usage_line("Per minute", &usage.minute),
            usage_line("Per hour", &usage.hour)
        )))
    }
}

pub struct RateLimitResetHandler {
    limiter: Arc<RateLimiter>,
}

impl RateLimitResetHandler {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Handler for RateLimitResetHandler {
    fn name(&self) -> &str {
        "rlreset"
    }

    fn description(&self) -> &str {
        "Reset a user's rate limits (admin)"
    }

    fn rate_limited(&self) -> bool {
        false
    }

    fn admin_only(&self) -> bool {
        true
    }

    async fn handle(&self, request: &Request) -> BotResult<Reply> {
        if request.args.is_empty() {
            return Ok(Reply::text("Please name the user to reset."));
        }
        let removed = self.limiter.reset(&request.args).await?;
        Ok(Reply::text(format!(
            "Rate limits reset for {} ({} recorded requests cleared).",
            request.args, removed
        )))
    }
}

pub struct RateLimitConfigHandler {
    limiter: Arc<RateLimiter>,
}

impl RateLimitConfigHandler {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Handler for RateLimitConfigHandler {
    fn name(&self) -> &str {
        "rlconfig"
    }

    fn description(&self) -> &str {
        "Show the rate limit configuration (admin)"
    }

    fn rate_limited(&self) -> bool {
        false
    }

    fn admin_only(&self) -> bool {
        true
    }

    async fn handle(&self, _request: &Request) -> BotResult<Reply> {
        let limits = self.limiter.limits();
        Ok(Reply::text(format!(
            "**Rate limit configuration**\nPer minute: {}\nPer hour: {}",
            limits.per_minute, limits.per_hour
        )))
    }
}

pub struct ReindexHandler {
    ingestor: Arc<Ingestor>,
    root: PathBuf,
}

impl ReindexHandler {
    pub fn new(ingestor: Arc<Ingestor>, root: PathBuf) -> Self {
        Self { ingestor, root }
    }
}

#[async_trait]
impl Handler for ReindexHandler {
    fn name(&self) -> &str {
        "reindex"
    }

    fn description(&self) -> &str {
        "Re-scan the content directory (admin)"
    }

    fn rate_limited(&self) -> bool {
        false
    }

    fn admin_only(&self) -> bool {
        true
    }

    async fn handle(&self, _request: &Request) -> BotResult<Reply> {
        let report = self.ingestor.forced().ingest(&self.root).await?;
        let mut text = format!(
            "Reindexing complete: {} documents indexed ({} passages), {} unchanged, {} removed.",
            report.documents, report.passages, report.unchanged, report.removed
        );
        if !report.errors.is_empty() {
            text.push_str(&format!("\n{} files skipped:", report.errors.len()));
            for err in report.errors.iter().take(10) {
                text.push_str(&format!("\n- {}", err));
            }
        }
        Ok(Reply::text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_help_lists_commands_sorted_with_prefix() {
        let help = HelpHandler::new(
            "!",
            &[
                ("quiz".to_string(), "Make a quiz".to_string()),
                ("ask".to_string(), "Ask".to_string()),
            ],
        );
        let ask = help.text.find("`!ask`").unwrap();
        let help_pos = help.text.find("`!help`").unwrap();
        let quiz = help.text.find("`!quiz`").unwrap();
        assert!(ask < help_pos && help_pos < quiz);
    }
}
