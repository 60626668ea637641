//! Conversational replies without retrieval, on the lighter chat profile.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::config::Config;
use crate::context::assemble;
use crate::conversation::ConversationStore;
use crate::error::BotResult;
use crate::generation::{generate_with_timeout, ChatMessage, GenerationProfile, Generator};

pub const CHAT_SYSTEM_PROMPT: &str = "You are Edue Helper, a friendly and knowledgeable educational assistant for a chat server. \
Your role is to help students with their learning by:
- Answering questions clearly and concisely
- Providing explanations in an educational context
- Being encouraging and supportive
- Keeping responses appropriate for a learning environment
- If you don't know something, admit it and suggest where they might find the answer

Keep responses conversational but informative. Aim for 1-2 paragraphs unless more detail is specifically requested.";

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub history_turns: usize,
    pub context_budget_tokens: usize,
    pub timeout: Duration,
    pub profile: GenerationProfile,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            history_turns: config.retrieval.history_turns,
            context_budget_tokens: config.retrieval.context_budget_tokens,
            timeout: Duration::from_secs(config.generation.timeout_secs),
            profile: GenerationProfile::from(&config.generation.chat),
        }
    }
}

pub struct ChatPipeline {
    generator: Arc<dyn Generator>,
    conversations: Arc<ConversationStore>,
    settings: ChatSettings,
}

impl ChatPipeline {
    pub fn new(
        generator: Arc<dyn Generator>,
        conversations: Arc<ConversationStore>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            generator,
            conversations,
            settings,
        }
    }

    pub async fn respond(
        &self,
        message: &str,
        channel_id: &str,
        user_id: &str,
        display_name: &str,
    ) -> BotResult<String> {
        let asked_at = Utc::now();
        let turns = self
            .conversations
            .recent(channel_id, self.settings.history_turns)
            .await;
        let window = assemble(&[], &turns, self.settings.context_budget_tokens);

        let mut messages = vec![ChatMessage::system(CHAT_SYSTEM_PROMPT)];
        messages.extend(window.history_messages());
        messages.push(ChatMessage::user(format!("{} asks: {}", display_name, message)));

        let reply = generate_with_timeout(
            self.generator.as_ref(),
            &self.settings.profile,
            &messages,
            self.settings.timeout,
        )
        .await?;

        self.conversations
            .append_exchange(user_id, channel_id, message, &reply, asked_at, Utc::now())
            .await;
        debug!(channel_id, history = window.turns.len(), "chat reply");
        Ok(reply)
    }
}
