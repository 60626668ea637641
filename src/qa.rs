//! Retrieval-augmented question answering.
//!
//! # Flow
//!
//! ```text
//! question ─▶ integrity screen ─▶ embed ─▶ nearest(top_k) ─▶ assemble ─▶ generate
//!                  │                                                      │
//!                  └─▶ refused answer                     record exchange ◀┘
//! ```
//!
//! Embedding and index calls share the retrieval deadline and fail as
//! [`BotError::Retrieval`], except that an index storage failure stays
//! [`BotError::Storage`] so the caller's rate-limit slot is refunded. The
//! generation call has its own deadline and
//! fails as [`BotError::Generation`]. The exchange is recorded only after
//! generation succeeded.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::context::{assemble, ContextWindow};
use crate::conversation::ConversationStore;
use crate::embedding::{embed_query, Embedder};
use crate::error::{BotError, BotResult};
use crate::generation::{generate_with_timeout, ChatMessage, GenerationProfile, Generator};
use crate::index::SimilarityIndex;
use crate::models::{ScoredPassage, SourcedAnswer};

pub const QA_SYSTEM_PROMPT: &str = "You are Edue Helper, an educational assistant answering questions about course materials. \
Answer using the numbered course excerpts provided. If the excerpts do not contain the answer, say so and suggest where the student might look. \
Explain clearly and encourage understanding rather than just giving final answers.";

pub const INTEGRITY_PROMPT: &str = "You are an academic integrity filter for an educational bot. \
Does the following query explicitly ask to generate a full essay, write code without explanation, or complete an assignment for the user? \
If YES (violation), reply starting with 'VIOLATION:' followed by a gentle refusal and a suggestion to guide them instead \
(e.g. 'I can't write the essay, but I can help outline it'). If NO (safe), reply with 'SAFE'.";

pub const DEFAULT_REFUSAL: &str = "Sorry, I can't help you with graded assignments, but I'm happy to explain the concepts behind them.";

/// Tunables for [`QaPipeline`], taken from `[retrieval]` and `[generation]`.
#[derive(Debug, Clone)]
pub struct QaSettings {
    pub top_k: usize,
    pub context_budget_tokens: usize,
    pub history_turns: usize,
    pub max_sources: usize,
    pub retrieval_timeout: Duration,
    pub generation_timeout: Duration,
    pub integrity_check: bool,
    pub profile: GenerationProfile,
}

impl QaSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            context_budget_tokens: config.retrieval.context_budget_tokens,
            history_turns: config.retrieval.history_turns,
            max_sources: config.retrieval.max_sources,
            retrieval_timeout: Duration::from_secs(config.retrieval.timeout_secs),
            generation_timeout: Duration::from_secs(config.generation.timeout_secs),
            integrity_check: config.retrieval.integrity_check,
            profile: GenerationProfile::from(&config.generation.qa),
        }
    }
}

pub struct QaPipeline {
    index: Arc<dyn SimilarityIndex>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    conversations: Arc<ConversationStore>,
    settings: QaSettings,
}

impl QaPipeline {
    pub fn new(
        index: Arc<dyn SimilarityIndex>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        conversations: Arc<ConversationStore>,
        settings: QaSettings,
    ) -> Self {
        Self {
            index,
            embedder,
            generator,
            conversations,
            settings,
        }
    }

    pub fn settings(&self) -> &QaSettings {
        &self.settings
    }

    /// Answer a question from the indexed course material.
    pub async fn answer(
        &self,
        question: &str,
        channel_id: &str,
        user_id: &str,
    ) -> BotResult<SourcedAnswer> {
        let asked_at = Utc::now();

        if self.settings.integrity_check {
            if let Some(refusal) = self.screen_integrity(question).await {
                info!(user_id, "question declined by integrity screen");
                return Ok(SourcedAnswer {
                    answer: refusal,
                    passages: Vec::new(),
                    citations: Vec::new(),
                    refused: true,
                });
            }
        }

        let passages = self.retrieve(question).await?;
        let turns = self
            .conversations
            .recent(channel_id, self.settings.history_turns)
            .await;
        let window = assemble(&passages, &turns, self.settings.context_budget_tokens);
        debug!(
            passages = window.passages.len(),
            turns = window.turns.len(),
            used_tokens = window.used_tokens,
            truncated = window.truncated,
            "assembled context"
        );

        let messages = qa_messages(&window, question);
        let answer = generate_with_timeout(
            self.generator.as_ref(),
            &self.settings.profile,
            &messages,
            self.settings.generation_timeout,
        )
        .await?;

        self.conversations
            .append_exchange(user_id, channel_id, question, &answer, asked_at, Utc::now())
            .await;

        let citations = citations(&window.passages, self.settings.max_sources);
        info!(
            user_id,
            channel_id,
            sources = citations.len(),
            "answered question"
        );

        Ok(SourcedAnswer {
            answer,
            passages: window.passages,
            citations,
            refused: false,
        })
    }

    /// Three-question multiple-choice quiz on `topic`, grounded in retrieved passages.
    pub async fn quiz(&self, topic: &str, channel_id: &str) -> BotResult<SourcedAnswer> {
        let passages = self.retrieve(topic).await?;
        let window = assemble(&passages, &[], self.settings.context_budget_tokens);

        let prompt = format!(
            "Generate a 3-question multiple choice quiz about '{}' based on the course excerpts above. \
Format it exactly like this:\n\
**Q1:** [Question]\n\
A) [Option]\n\
B) [Option]\n\
C) [Option]\n\
||Correct Answer: [Letter]||\n\
Repeat for Q2 and Q3.",
            topic
        );
        let messages = vec![
            ChatMessage::system(QA_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Course excerpts:\n\n{}\n\n{}",
                window.render_passages(),
                prompt
            )),
        ];

        let quiz = generate_with_timeout(
            self.generator.as_ref(),
            &self.settings.profile,
            &messages,
            self.settings.generation_timeout,
        )
        .await?;
        info!(channel_id, topic, "generated quiz");

        Ok(SourcedAnswer {
            answer: quiz,
            citations: citations(&window.passages, self.settings.max_sources),
            passages: window.passages,
            refused: false,
        })
    }

    async fn retrieve(&self, text: &str) -> BotResult<Vec<ScoredPassage>> {
        let deadline = self.settings.retrieval_timeout;

        let query = tokio::time::timeout(deadline, embed_query(self.embedder.as_ref(), text))
            .await
            .map_err(|_| BotError::Retrieval("embedding timed out".to_string()))?
            .map_err(|e| BotError::Retrieval(format!("embedding failed: {}", e)))?;

        let passages = tokio::time::timeout(deadline, self.index.nearest(&query, self.settings.top_k))
            .await
            .map_err(|_| BotError::Retrieval("similarity index timed out".to_string()))?
            .map_err(|e| match e {
                BotError::Storage(_) => e,
                other => BotError::Retrieval(other.to_string()),
            })?;

        if passages.is_empty() {
            return Err(BotError::Retrieval("index is empty".to_string()));
        }
        Ok(passages)
    }

    /// `Some(refusal)` when the question asks for graded work to be done.
    /// Screening failures let the question through.
    async fn screen_integrity(&self, question: &str) -> Option<String> {
        let messages = vec![
            ChatMessage::system(INTEGRITY_PROMPT),
            ChatMessage::user(question),
        ];
        let verdict = match generate_with_timeout(
            self.generator.as_ref(),
            &self.settings.profile,
            &messages,
            self.settings.generation_timeout,
        )
        .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(error = %e, "integrity screen failed, allowing question");
                return None;
            }
        };

        let verdict = verdict.trim();
        let rest = verdict.strip_prefix("VIOLATION")?;
        let refusal = rest.trim_start_matches(':').trim();
        Some(if refusal.is_empty() {
            DEFAULT_REFUSAL.to_string()
        } else {
            refusal.to_string()
        })
    }
}

fn qa_messages(window: &ContextWindow, question: &str) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(QA_SYSTEM_PROMPT)];
    messages.extend(window.history_messages());
    messages.push(ChatMessage::user(format!(
        "Course excerpts:\n\n{}\n\nQuestion: {}",
        window.render_passages(),
        question
    )));
    messages
}

/// De-duplicated `category/file_name` labels in rank order, at most `max`.
pub fn citations(passages: &[ScoredPassage], max: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for passage in passages {
        if out.len() >= max {
            break;
        }
        let label = passage.citation();
        if !out.contains(&label) {
            out.push(label);
        }
    }
    out
}
