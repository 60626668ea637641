//! Inbound message screening: a word-list content check and the per-user
//! rate limit.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::ModerationConfig;
use crate::error::{BotError, BotResult};
use crate::rate_limit::{Admission, RateLimiter};

pub const REMOVAL_NOTICE: &str = "Your message was removed due to inappropriate language. Please keep the conversation respectful.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Flagged,
}

/// Blacklist/whitelist word matcher.
///
/// Matching is substring based on the lowercased message, after every
/// whitelisted word has been removed (longest first, so `scunthorpe` wins
/// over a shorter whitelisted word inside it).
#[derive(Debug, Clone, Default)]
pub struct WordFilter {
    blacklist: Vec<String>,
    whitelist: Vec<String>,
}

impl WordFilter {
    pub fn from_words<B, W>(blacklist: B, whitelist: W) -> Self
    where
        B: IntoIterator,
        B::Item: AsRef<str>,
        W: IntoIterator,
        W::Item: AsRef<str>,
    {
        let normalize = |w: &str| {
            let w = w.trim().to_lowercase();
            (!w.is_empty()).then_some(w)
        };
        let blacklist = blacklist
            .into_iter()
            .filter_map(|w| normalize(w.as_ref()))
            .collect();
        let mut whitelist: Vec<String> = whitelist
            .into_iter()
            .filter_map(|w| normalize(w.as_ref()))
            .collect();
        whitelist.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self {
            blacklist,
            whitelist,
        }
    }

    /// Load word files, one word per line. A missing file disables that list.
    pub fn load(blacklist: Option<&Path>, whitelist: Option<&Path>) -> Self {
        Self::from_words(read_words(blacklist), read_words(whitelist))
    }

    pub fn is_empty(&self) -> bool {
        self.blacklist.is_empty()
    }

    pub fn is_profane(&self, text: &str) -> bool {
        if self.blacklist.is_empty() {
            return false;
        }
        let mut lowered = text.to_lowercase();
        for word in &self.whitelist {
            lowered = lowered.replace(word.as_str(), "");
        }
        self.blacklist.iter().any(|w| lowered.contains(w.as_str()))
    }
}

fn read_words(path: Option<&Path>) -> Vec<String> {
    let Some(path) = path else {
        return Vec::new();
    };
    match std::fs::read_to_string(path) {
        Ok(content) => content.lines().map(str::to_string).collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "word list not loaded");
            Vec::new()
        }
    }
}

/// Gate in front of every handler.
pub struct ModerationFilter {
    words: WordFilter,
    limiter: Arc<RateLimiter>,
}

impl ModerationFilter {
    pub fn new(words: WordFilter, limiter: Arc<RateLimiter>) -> Self {
        Self { words, limiter }
    }

    pub fn from_config(config: &ModerationConfig, limiter: Arc<RateLimiter>) -> Self {
        Self::new(
            WordFilter::load(config.blacklist.as_deref(), config.whitelist.as_deref()),
            limiter,
        )
    }

    pub fn screen(&self, text: &str) -> Verdict {
        if self.words.is_profane(text) {
            Verdict::Flagged
        } else {
            Verdict::Clean
        }
    }

    /// Rate-limit check. A denial becomes [`BotError::RateLimited`].
    pub async fn admit(&self, user_id: &str, now: DateTime<Utc>) -> BotResult<()> {
        match self.limiter.admit(user_id, now).await? {
            Admission::Allowed { .. } => Ok(()),
            Admission::Denied {
                retry_after,
                window,
            } => {
                debug!(user_id, %window, "request denied by rate limiter");
                Err(BotError::RateLimited {
                    retry_after,
                    window,
                })
            }
        }
    }

    /// Hand back the slot taken by [`admit`](Self::admit) at `now`.
    pub async fn refund(&self, user_id: &str, now: DateTime<Utc>) -> BotResult<bool> {
        self.limiter.refund(user_id, now).await
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{RateLimits, Window};
    use crate::{db, migrate};
    use tempfile::TempDir;

    #[test]
    fn test_blacklist_substring_matches_case_insensitively() {
        let filter = WordFilter::from_words(["darn"], Vec::<String>::new());
        assert!(filter.is_profane("Well DARN it"));
        assert!(!filter.is_profane("all good here"));
    }

    #[test]
    fn test_whitelist_removed_before_matching() {
        let filter = WordFilter::from_words(["ass"], ["class", "assignment"]);
        assert!(!filter.is_profane("When is the class assignment due?"));
        assert!(filter.is_profane("you ass"));
    }

    #[test]
    fn test_missing_files_disable_lists() {
        let tmp = TempDir::new().unwrap();
        let filter = WordFilter::load(Some(&tmp.path().join("nope.txt")), None);
        assert!(filter.is_empty());
        assert!(!filter.is_profane("anything"));
    }

    #[test]
    fn test_load_reads_one_word_per_line() {
        let tmp = TempDir::new().unwrap();
        let black = tmp.path().join("blacklist.txt");
        std::fs::write(&black, "Heck\n\n  frick \n").unwrap();
        let filter = WordFilter::load(Some(&black), None);
        assert!(filter.is_profane("oh FRICK"));
        assert!(filter.is_profane("heck"));
    }

    #[tokio::test]
    async fn test_admit_maps_denial() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect_path(&tmp.path().join("m.sqlite")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let limiter = Arc::new(RateLimiter::new(
            pool,
            RateLimits {
                per_minute: 1,
                per_hour: 10,
            },
        ));
        let filter = ModerationFilter::new(WordFilter::default(), limiter);

        let now = Utc::now();
        filter.admit("u1", now).await.unwrap();
        let err = filter.admit("u1", now).await.unwrap_err();
        assert!(matches!(
            err,
            BotError::RateLimited { window: Window::Minute, .. }
        ));
    }
}
