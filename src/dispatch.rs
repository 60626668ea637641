//! Message routing.
//!
//! Every capability implements [`Handler`]. The [`Dispatcher`] maps
//! [`Trigger`]s to handlers once at startup and runs each inbound message
//! through the same gate:
//!
//! ```text
//! message ─▶ bot author? ─▶ content check ─▶ resolve trigger ─▶ admin check
//!                                  │                                 │
//!                                  ▼                                 ▼
//!                          removal notice     usage hint? ─▶ rate limit ─▶ handler
//! ```
//!
//! A request that fails with [`BotError::Storage`] after admission gets its
//! rate-limit slot back.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::{BotError, BotResult};
use crate::models::{InboundMessage, Reply};
use crate::moderation::{ModerationFilter, Verdict, REMOVAL_NOTICE};

pub const EMPTY_MENTION_PROMPT: &str = "Hello! How can I help you today?";
pub const ADMIN_ONLY_NOTICE: &str = "Sorry, that command is only available to administrators.";

/// One routed message, after the trigger has been stripped.
#[derive(Debug, Clone)]
pub struct Request {
    pub message: InboundMessage,
    /// Text following the command name, or the message with the mention removed.
    pub args: String,
    pub received_at: DateTime<Utc>,
}

/// A command or mention responder.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use edue_helper::dispatch::{Handler, Request};
/// use edue_helper::error::BotResult;
/// use edue_helper::models::Reply;
///
/// pub struct PingHandler;
///
/// #[async_trait]
/// impl Handler for PingHandler {
///     fn name(&self) -> &str { "ping" }
///     fn description(&self) -> &str { "Check that the bot is alive" }
///     fn rate_limited(&self) -> bool { false }
///
///     async fn handle(&self, _request: &Request) -> BotResult<Reply> {
///         Ok(Reply::text("pong"))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync {
    /// Command name, matched case-insensitively after the prefix.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Whether the caller must pass the rate limiter first. Defaults to `true`.
    fn rate_limited(&self) -> bool {
        true
    }

    /// Restrict to the configured admin users. Defaults to `false`.
    fn admin_only(&self) -> bool {
        false
    }

    /// Reply for a request with no arguments, sent without rate limiting
    /// or calling [`handle`](Self::handle).
    fn usage_hint(&self) -> Option<&str> {
        None
    }

    async fn handle(&self, request: &Request) -> BotResult<Reply>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// `{prefix}{name}` at the start of the message.
    Command(String),
    /// `<@bot_id>` or `<@!bot_id>` anywhere in the message.
    Mention,
}

pub struct Dispatcher {
    prefix: String,
    bot_user_id: Option<String>,
    commands: BTreeMap<String, Arc<dyn Handler>>,
    mention: Option<Arc<dyn Handler>>,
    moderation: Arc<ModerationFilter>,
    admins: HashSet<String>,
}

impl Dispatcher {
    pub fn new(
        prefix: impl Into<String>,
        bot_user_id: Option<String>,
        admins: impl IntoIterator<Item = String>,
        moderation: Arc<ModerationFilter>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            bot_user_id,
            commands: BTreeMap::new(),
            mention: None,
            moderation,
            admins: admins.into_iter().collect(),
        }
    }

    /// Register `handler` for `trigger`. A later route for the same trigger wins.
    pub fn route(mut self, trigger: Trigger, handler: Arc<dyn Handler>) -> Self {
        match trigger {
            Trigger::Command(name) => {
                self.commands.insert(name.to_lowercase(), handler);
            }
            Trigger::Mention => self.mention = Some(handler),
        }
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `(name, description)` of every command route, sorted by name.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands
            .iter()
            .map(|(name, h)| (name.clone(), h.description().to_string()))
            .collect()
    }

    /// Route one message. `Ok(None)` means the bot stays silent.
    pub async fn dispatch(
        &self,
        message: InboundMessage,
        now: DateTime<Utc>,
    ) -> BotResult<Option<Reply>> {
        if message.is_bot {
            return Ok(None);
        }

        if self.moderation.screen(&message.text) == Verdict::Flagged {
            info!(user_id = %message.user_id, channel_id = %message.channel_id, "removed message");
            return Ok(Some(Reply {
                text: REMOVAL_NOTICE.to_string(),
                remove_original: true,
                direct: true,
                ..Reply::default()
            }));
        }

        let Some((handler, args)) = self.resolve(&message.text) else {
            return Ok(None);
        };
        debug!(handler = handler.name(), user_id = %message.user_id, "dispatching");

        if handler.admin_only() && !self.admins.contains(&message.user_id) {
            return Ok(Some(Reply::text(ADMIN_ONLY_NOTICE)));
        }

        if args.is_empty() {
            if let Some(hint) = handler.usage_hint() {
                return Ok(Some(Reply::text(hint)));
            }
        }

        let limited = handler.rate_limited();
        if limited {
            self.moderation.admit(&message.user_id, now).await?;
        }

        let request = Request {
            message,
            args,
            received_at: now,
        };
        let result = handler.handle(&request).await;

        if limited {
            if let Err(BotError::Storage(_)) = &result {
                let user_id = &request.message.user_id;
                if let Err(e) = self.moderation.refund(user_id, now).await {
                    warn!(user_id = %user_id, error = %e, "failed to refund rate limit slot");
                }
            }
        }
        result.map(Some)
    }

    fn resolve(&self, text: &str) -> Option<(Arc<dyn Handler>, String)> {
        let trimmed = text.trim_start();
        if let Some(rest) = trimmed.strip_prefix(self.prefix.as_str()) {
            let (name, args) = match rest.split_once(char::is_whitespace) {
                Some((name, args)) => (name, args.trim()),
                None => (rest, ""),
            };
            if let Some(handler) = self.commands.get(&name.to_lowercase()) {
                return Some((handler.clone(), args.to_string()));
            }
        }

        let handler = self.mention.as_ref()?;
        let id = self.bot_user_id.as_deref()?;
        let plain = format!("<@{}>", id);
        let nick = format!("<@!{}>", id);
        if !text.contains(&plain) && !text.contains(&nick) {
            return None;
        }
        let stripped = text.replace(&plain, "").replace(&nick, "");
        let stripped = stripped.trim();
        let args = if stripped.is_empty() {
            EMPTY_MENTION_PROMPT.to_string()
        } else {
            stripped.to_string()
        };
        Some((handler.clone(), args))
    }
}
