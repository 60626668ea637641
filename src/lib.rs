//! # Edue Helper
//!
//! A coursework help bot for chat servers. Students ask questions about
//! course material; the bot answers through retrieval-augmented generation
//! over a directory of course documents, holds light conversations,
//! generates practice quizzes, and moderates with per-user rate limits and a
//! word-list content filter.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  content/   │──▶│   Ingestor   │──▶│ SQLite index │
//! │ pdf/docx/md │   │ chunk+embed  │   │  + counters  │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │
//!   message ─▶ Dispatcher ─▶ Moderation ─▶ Q&A / Chat ─▶ Generator
//!                 ▲                           │
//!          CLI / HTTP                Conversation store
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! edue init                          # create database
//! edue ingest                        # index ./content
//! edue ask "What is osmosis?"
//! edue message --user u1 --channel c1 "!quiz photosynthesis"
//! edue serve                         # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`error`] | `BotError` taxonomy |
//! | [`models`] | Core data types |
//! | [`extract`] | Text extraction (txt, md, pdf, docx) |
//! | [`chunk`] | Passage splitting |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`generation`] | Text generation provider abstraction |
//! | [`http`] | Shared retrying JSON client |
//! | [`index`] | Similarity index (SQLite and in-memory) |
//! | [`ingest`] | Document ingestor |
//! | [`rate_limit`] | Rolling-window per-user rate limiter |
//! | [`conversation`] | Per-channel conversation turns |
//! | [`context`] | Bounded context window assembly |
//! | [`moderation`] | Content filter and rate-limit gate |
//! | [`qa`] | Retrieval-augmented Q&A pipeline |
//! | [`chat`] | Conversational pipeline |
//! | [`dispatch`] | Handler trait and message router |
//! | [`handlers`] | Built-in command handlers |
//! | [`bot`] | Startup wiring |
//! | [`server`] | HTTP inbound interface |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod bot;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod context;
pub mod conversation;
pub mod db;
pub mod dispatch;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod handlers;
pub mod http;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod moderation;
pub mod qa;
pub mod rate_limit;
pub mod server;
