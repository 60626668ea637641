//! Startup wiring.
//!
//! [`Bot`] owns one handle to each shared store and pipeline, created once
//! and passed explicitly into the handlers and the [`Dispatcher`].

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::chat::{ChatPipeline, ChatSettings};
use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::db;
use crate::dispatch::{Dispatcher, Handler, Trigger};
use crate::embedding::{create_embedder, Embedder};
use crate::error::BotResult;
use crate::generation::{create_generator, Generator};
use crate::handlers::{
    AskHandler, ChatHandler, ClearHandler, HelpHandler, QuizHandler, RateLimitConfigHandler,
    RateLimitResetHandler, RateLimitStatsHandler, ReindexHandler, StatsHandler,
};
use crate::index::{IndexStats, SimilarityIndex, SqliteIndex};
use crate::ingest::{IngestOptions, Ingestor};
use crate::migrate;
use crate::moderation::ModerationFilter;
use crate::qa::{QaPipeline, QaSettings};
use crate::rate_limit::{RateLimiter, RateLimits};

#[derive(Debug, Clone, Serialize)]
pub struct BotStats {
    pub index: IndexStats,
    pub active_conversations: usize,
}

pub struct Bot {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub index: Arc<dyn SimilarityIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub conversations: Arc<ConversationStore>,
    pub limiter: Arc<RateLimiter>,
    pub qa: Arc<QaPipeline>,
    pub chat: Arc<ChatPipeline>,
    pub ingestor: Arc<Ingestor>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Bot {
    /// Open the database, apply migrations and create the configured providers.
    pub async fn start(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        let embedder =
            create_embedder(&config.embedding).context("Failed to create embedding provider")?;
        let generator = create_generator(&config.generation)
            .context("Failed to create generation provider")?;
        info!(
            embedder = embedder.model_name(),
            generator = generator.name(),
            "bot started"
        );
        Ok(Self::assemble(config, pool, embedder, generator))
    }

    /// Wire everything around an already migrated pool and explicit providers.
    pub fn assemble(
        config: Config,
        pool: SqlitePool,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let config = Arc::new(config);
        let index: Arc<dyn SimilarityIndex> = Arc::new(SqliteIndex::new(pool.clone()));
        let conversations = Arc::new(ConversationStore::new(config.conversation.max_turns));
        let limiter = Arc::new(RateLimiter::new(
            pool.clone(),
            RateLimits::from(&config.rate_limit),
        ));
        let moderation = Arc::new(ModerationFilter::from_config(
            &config.moderation,
            limiter.clone(),
        ));

        let qa = Arc::new(QaPipeline::new(
            index.clone(),
            embedder.clone(),
            generator.clone(),
            conversations.clone(),
            QaSettings::from_config(&config),
        ));
        let chat = Arc::new(ChatPipeline::new(
            generator.clone(),
            conversations.clone(),
            ChatSettings::from_config(&config),
        ));
        let ingestor = Arc::new(Ingestor::new(
            index.clone(),
            embedder.clone(),
            IngestOptions::from_config(&config),
        ));

        let chat_handler: Arc<dyn Handler> = Arc::new(ChatHandler::new(chat.clone()));
        let handlers: Vec<Arc<dyn Handler>> = vec![
            Arc::new(AskHandler::new(qa.clone())),
            chat_handler.clone(),
            Arc::new(QuizHandler::new(qa.clone())),
            Arc::new(ClearHandler::new(conversations.clone())),
            Arc::new(StatsHandler::new(index.clone(), conversations.clone())),
            Arc::new(RateLimitStatsHandler::new(limiter.clone())),
            Arc::new(RateLimitResetHandler::new(limiter.clone())),
            Arc::new(RateLimitConfigHandler::new(limiter.clone())),
            Arc::new(ReindexHandler::new(
                ingestor.clone(),
                config.content.root.clone(),
            )),
        ];
        let listing: Vec<(String, String)> = handlers
            .iter()
            .map(|h| (h.name().to_string(), h.description().to_string()))
            .collect();

        let mut dispatcher = Dispatcher::new(
            config.bot.prefix.clone(),
            config.bot.user_id.clone(),
            config.bot.admins.clone(),
            moderation,
        );
        for handler in handlers {
            dispatcher = dispatcher.route(Trigger::Command(handler.name().to_string()), handler);
        }
        let dispatcher = dispatcher
            .route(
                Trigger::Command("help".to_string()),
                Arc::new(HelpHandler::new(&config.bot.prefix, &listing)),
            )
            .route(Trigger::Mention, chat_handler);

        Self {
            config,
            pool,
            index,
            embedder,
            generator,
            conversations,
            limiter,
            qa,
            chat,
            ingestor,
            dispatcher: Arc::new(dispatcher),
        }
    }

    pub async fn stats(&self) -> BotResult<BotStats> {
        Ok(BotStats {
            index: self.index.stats().await?,
            active_conversations: self.conversations.active_channels(),
        })
    }
}
