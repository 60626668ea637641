//! Per-user rate limiting over a rolling minute and a rolling hour.
//!
//! State lives in the `rate_limit_events` table, one row per admitted
//! request. A window's count is the number of rows newer than
//! `now - window`; rows older than the hour window are pruned before each
//! check, which is how elapsed windows reset.
//!
//! [`RateLimiter::admit`] performs the check and the increment as one
//! conditional `INSERT ... SELECT ... WHERE` statement. SQLite runs it under
//! its write lock, so concurrent requests from the same user (in this
//! process or another one sharing the database) can never jointly exceed a
//! ceiling.
//!
//! A request that was admitted but then failed on storage is handed back
//! with [`RateLimiter::refund`].

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::BotResult;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    Minute,
    Hour,
}

impl Window {
    pub fn length_ms(self) -> i64 {
        match self {
            Window::Minute => MINUTE_MS,
            Window::Hour => HOUR_MS,
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Window::Minute => write!(f, "per minute"),
            Window::Hour => write!(f, "per hour"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl From<&RateLimitConfig> for RateLimits {
    fn from(cfg: &RateLimitConfig) -> Self {
        Self {
            per_minute: cfg.per_minute,
            per_hour: cfg.per_hour,
        }
    }
}

impl RateLimits {
    fn ceiling(&self, window: Window) -> u32 {
        match window {
            Window::Minute => self.per_minute,
            Window::Hour => self.per_hour,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Allowed {
        remaining_minute: u32,
        remaining_hour: u32,
    },
    Denied {
        retry_after: Duration,
        window: Window,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

/// Usage of one window, as shown by the `rlstats` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowUsage {
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    /// Oldest admitted request still inside the window.
    pub window_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Usage {
    pub minute: WindowUsage,
    pub hour: WindowUsage,
}

pub struct RateLimiter {
    pool: SqlitePool,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(pool: SqlitePool, limits: RateLimits) -> Self {
        Self { pool, limits }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// Admit or deny one request from `user_id` at `now`, recording it when admitted.
    pub async fn admit(&self, user_id: &str, now: DateTime<Utc>) -> BotResult<Admission> {
        let now_ms = now.timestamp_millis();

        sqlx::query("DELETE FROM rate_limit_events WHERE user_id = ? AND requested_at <= ?")
            .bind(user_id)
            .bind(now_ms - HOUR_MS)
            .execute(&self.pool)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO rate_limit_events (user_id, requested_at)
            SELECT ?1, ?2
            WHERE (SELECT COUNT(*) FROM rate_limit_events
                   WHERE user_id = ?1 AND requested_at > ?2 - ?3) < ?4
              AND (SELECT COUNT(*) FROM rate_limit_events
                   WHERE user_id = ?1 AND requested_at > ?2 - ?5) < ?6
            "#,
        )
        .bind(user_id)
        .bind(now_ms)
        .bind(MINUTE_MS)
        .bind(i64::from(self.limits.per_minute))
        .bind(HOUR_MS)
        .bind(i64::from(self.limits.per_hour))
        .execute(&self.pool)
        .await?
        .rows_affected();

        let times = self.recent_times(user_id, now_ms).await?;

        if inserted == 1 {
            let minute_used = count_in_window(&times, now_ms, Window::Minute);
            let hour_used = times.len() as u32;
            debug!(user_id, minute_used, hour_used, "request admitted");
            return Ok(Admission::Allowed {
                remaining_minute: self.limits.per_minute.saturating_sub(minute_used),
                remaining_hour: self.limits.per_hour.saturating_sub(hour_used),
            });
        }

        // Denied: report the window whose wait is longest, so a retry after
        // `retry_after` is admitted.
        let mut denial: Option<(i64, Window)> = None;
        for window in [Window::Minute, Window::Hour] {
            if let Some(wait_ms) = self.wait_for_room(&times, now_ms, window) {
                if denial.map_or(true, |(best, _)| wait_ms > best) {
                    denial = Some((wait_ms, window));
                }
            }
        }

        // The conditional insert only fails when a window is full, but keep
        // a positive delay if the rows changed between the two statements.
        let (wait_ms, window) = denial.unwrap_or((1, Window::Minute));
        let retry_after = Duration::from_millis(wait_ms.max(1) as u64);
        debug!(user_id, %window, ?retry_after, "request denied");
        Ok(Admission::Denied {
            retry_after,
            window,
        })
    }

    /// Current usage for `user_id` without recording anything.
    pub async fn usage(&self, user_id: &str, now: DateTime<Utc>) -> BotResult<Usage> {
        let now_ms = now.timestamp_millis();
        let times = self.recent_times(user_id, now_ms).await?;

        let window_usage = |window: Window| {
            let start_ms = now_ms - window.length_ms();
            let inside: Vec<i64> = times.iter().copied().filter(|t| *t > start_ms).collect();
            let used = inside.len() as u32;
            let limit = self.limits.ceiling(window);
            WindowUsage {
                used,
                limit,
                remaining: limit.saturating_sub(used),
                window_start: inside
                    .first()
                    .and_then(|ms| Utc.timestamp_millis_opt(*ms).single()),
            }
        };

        Ok(Usage {
            minute: window_usage(Window::Minute),
            hour: window_usage(Window::Hour),
        })
    }

    /// Give back the slot recorded for `user_id` at `requested_at` by
    /// [`admit`](Self::admit). Returns `false` when no such request exists.
    pub async fn refund(&self, user_id: &str, requested_at: DateTime<Utc>) -> BotResult<bool> {
        let removed = sqlx::query(
            r#"
            DELETE FROM rate_limit_events
            WHERE id = (SELECT id FROM rate_limit_events
                        WHERE user_id = ?1 AND requested_at = ?2
                        ORDER BY id DESC LIMIT 1)
            "#,
        )
        .bind(user_id)
        .bind(requested_at.timestamp_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();
        debug!(user_id, refunded = removed == 1, "rate limit refund");
        Ok(removed == 1)
    }

    /// Forget every recorded request for `user_id`. Returns how many were removed.
    pub async fn reset(&self, user_id: &str) -> BotResult<u64> {
        let removed = sqlx::query("DELETE FROM rate_limit_events WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        debug!(user_id, removed, "rate limits reset");
        Ok(removed)
    }

    /// Request times inside the hour window, oldest first.
    async fn recent_times(&self, user_id: &str, now_ms: i64) -> BotResult<Vec<i64>> {
        let times = sqlx::query_scalar(
            "SELECT requested_at FROM rate_limit_events WHERE user_id = ? AND requested_at > ? ORDER BY requested_at",
        )
        .bind(user_id)
        .bind(now_ms - HOUR_MS)
        .fetch_all(&self.pool)
        .await?;
        Ok(times)
    }

    /// Milliseconds until `window` has room for one more request, or `None`
    /// if it has room now. `times` must be sorted ascending.
    fn wait_for_room(&self, times: &[i64], now_ms: i64, window: Window) -> Option<i64> {
        let start_ms = now_ms - window.length_ms();
        let inside: Vec<i64> = times.iter().copied().filter(|t| *t > start_ms).collect();
        let ceiling = self.limits.ceiling(window) as usize;
        if ceiling == 0 {
            return Some(window.length_ms());
        }
        if inside.len() < ceiling {
            return None;
        }
        // Room opens once all but `ceiling - 1` of the requests have aged out.
        let blocking = inside[inside.len() - ceiling];
        Some(blocking + window.length_ms() - now_ms)
    }
}

fn count_in_window(times: &[i64], now_ms: i64, window: Window) -> u32 {
    let start_ms = now_ms - window.length_ms();
    times.iter().filter(|t| **t > start_ms).count() as u32
}
