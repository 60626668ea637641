//! # Edue Helper CLI (`edue`)
//!
//! Operator interface for the coursework help bot: database setup, content
//! ingestion, one-off questions, the full message path, rate limit
//! administration and the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! edue --config ./config/edue.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `edue init` | Create the SQLite database and run schema migrations |
//! | `edue ingest` | Index the content directory |
//! | `edue ask "<question>"` | Answer a question from the course materials |
//! | `edue chat "<message>"` | Chat without retrieval |
//! | `edue quiz "<topic>"` | Generate a practice quiz |
//! | `edue message --user <id> --channel <id> "<text>"` | Route a message like a chat platform would |
//! | `edue limits stats\|reset\|config` | Inspect or reset rate limits |
//! | `edue stats` | Index and conversation statistics |
//! | `edue serve` | Start the HTTP server |
//!
//! Logs go to stderr (`RUST_LOG` overrides the default `edue_helper=info`);
//! command output goes to stdout.

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use edue_helper::bot::Bot;
use edue_helper::config::{self, Config};
use edue_helper::models::{InboundMessage, Reply};
use edue_helper::{db, migrate, server};

/// Edue Helper: course material Q&A, chat and quizzes for a chat server.
#[derive(Parser)]
#[command(name = "edue", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/edue.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Index the content directory.
    ///
    /// Unchanged files are skipped and documents whose file disappeared are
    /// removed. Per-file failures are listed without stopping the run.
    Ingest {
        /// Directory to ingest instead of `[content].root`.
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Re-ingest every file even when its content is unchanged.
        #[arg(long)]
        full: bool,
    },

    /// Answer a question from the course materials.
    Ask {
        question: String,

        #[arg(long, default_value = "cli")]
        channel: String,

        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Chat without retrieval.
    Chat {
        message: String,

        #[arg(long, default_value = "cli")]
        channel: String,

        #[arg(long, default_value = "cli")]
        user: String,
    },

    /// Generate a 3-question practice quiz.
    Quiz {
        topic: String,

        #[arg(long, default_value = "cli")]
        channel: String,
    },

    /// Route one message through the dispatcher, moderation and rate limits included.
    Message {
        text: String,

        #[arg(long)]
        user: String,

        #[arg(long)]
        channel: String,

        /// Display name used in chat prompts.
        #[arg(long)]
        name: Option<String>,
    },

    /// Rate limit administration.
    Limits {
        #[command(subcommand)]
        action: LimitsAction,
    },

    /// Show index and conversation statistics.
    Stats,

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand)]
enum LimitsAction {
    /// Current usage for a user.
    Stats { user: String },
    /// Forget a user's recorded requests.
    Reset { user: String },
    /// Show the configured ceilings.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("edue_helper=info,edue=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Initialized database at {}", cfg.db.path.display());
            pool.close().await;
        }
        Commands::Ingest { dir, full } => {
            let dir = dir.unwrap_or_else(|| cfg.content.root.clone());
            let bot = Bot::start(cfg).await?;
            let report = if full {
                bot.ingestor.forced().ingest(&dir).await
            } else {
                bot.ingestor.ingest(&dir).await
            };
            let report = report.with_context(|| format!("Failed to ingest {}", dir.display()))?;

            println!("ingest {}", dir.display());
            println!("  documents indexed: {}", report.documents);
            println!("  passages written: {}", report.passages);
            println!("  unchanged: {}", report.unchanged);
            println!("  removed: {}", report.removed);
            println!("  errors: {}", report.errors.len());
            for err in &report.errors {
                println!("    {}", err);
            }
            println!("ok");
        }
        Commands::Ask {
            question,
            channel,
            user,
        } => {
            let bot = Bot::start(cfg).await?;
            let answer = bot
                .qa
                .answer(&question, &channel, &user)
                .await
                .map_err(|e| anyhow::anyhow!("[{}] {}", e.code(), e))?;
            print_reply(
                &bot.config,
                &Reply::text(answer.answer).with_citations(answer.citations),
            );
        }
        Commands::Chat {
            message,
            channel,
            user,
        } => {
            let bot = Bot::start(cfg).await?;
            let text = bot
                .chat
                .respond(&message, &channel, &user, &user)
                .await
                .map_err(|e| anyhow::anyhow!("[{}] {}", e.code(), e))?;
            print_reply(&bot.config, &Reply::text(text));
        }
        Commands::Quiz { topic, channel } => {
            let bot = Bot::start(cfg).await?;
            let quiz = bot
                .qa
                .quiz(&topic, &channel)
                .await
                .map_err(|e| anyhow::anyhow!("[{}] {}", e.code(), e))?;
            print_reply(
                &bot.config,
                &Reply::text(quiz.answer).with_citations(quiz.citations),
            );
        }
        Commands::Message {
            text,
            user,
            channel,
            name,
        } => {
            let bot = Bot::start(cfg).await?;
            let message = InboundMessage {
                user_id: user,
                user_name: name,
                channel_id: channel,
                text,
                is_bot: false,
            };
            match bot.dispatcher.dispatch(message, Utc::now()).await {
                Ok(Some(reply)) => {
                    if reply.remove_original {
                        println!("(original message removed)");
                    }
                    print_reply(&bot.config, &reply);
                }
                Ok(None) => println!("(no reply)"),
                Err(e) => {
                    println!("{}", e.user_message());
                    bail!("[{}] {}", e.code(), e);
                }
            }
        }
        Commands::Limits { action } => {
            let bot = Bot::start(cfg).await?;
            match action {
                LimitsAction::Stats { user } => {
                    let usage = bot.limiter.usage(&user, Utc::now()).await?;
                    println!("{}", serde_json::to_string_pretty(&usage)?);
                }
                LimitsAction::Reset { user } => {
                    let removed = bot.limiter.reset(&user).await?;
                    println!("reset {}: {} recorded requests cleared", user, removed);
                }
                LimitsAction::Config => {
                    let limits = bot.limiter.limits();
                    println!("per_minute: {}", limits.per_minute);
                    println!("per_hour: {}", limits.per_hour);
                }
            }
        }
        Commands::Stats => {
            let bot = Bot::start(cfg).await?;
            let stats = bot.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Serve => {
            let bot = Arc::new(Bot::start(cfg).await?);
            server::run_server(bot).await?;
        }
    }

    Ok(())
}

fn print_reply(config: &Config, reply: &Reply) {
    for part in reply.parts(config.bot.max_reply_chars) {
        println!("{}", part);
    }
}
