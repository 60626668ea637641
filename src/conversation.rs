//! Recent conversation turns, per channel.
//!
//! Each channel has its own `tokio::sync::Mutex`-guarded log inside a
//! `DashMap`, so appends within a channel are serialised while different
//! channels never wait on each other. Every append clamps its timestamp to be
//! strictly later than the channel's last turn, which keeps each channel's
//! history strictly time-ordered even when clocks or callers disagree.
//!
//! A channel's map entry is dropped only while no task holds its log, both
//! after [`ConversationStore::clear`] and when
//! [`ConversationStore::prune_idle`] finds the channel quiet, so an append
//! racing either of them is never written to a detached log.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::{ConversationTurn, Role};

type ChannelLog = Arc<Mutex<VecDeque<ConversationTurn>>>;

pub struct ConversationStore {
    channels: DashMap<String, ChannelLog>,
    max_turns: usize,
}

impl ConversationStore {
    /// `max_turns` bounds each channel's history; the oldest turns are evicted.
    pub fn new(max_turns: usize) -> Self {
        Self {
            channels: DashMap::new(),
            max_turns: max_turns.max(2),
        }
    }

    fn log(&self, channel_id: &str) -> ChannelLog {
        self.channels
            .entry(channel_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Append one turn. Returns the turn as stored (timestamp possibly clamped).
    pub async fn append(&self, mut turn: ConversationTurn) -> ConversationTurn {
        let log = self.log(&turn.channel_id);
        let mut log = log.lock().await;
        turn.timestamp = next_timestamp(log.back(), turn.timestamp);
        log.push_back(turn.clone());
        self.evict(&mut log);
        turn
    }

    /// Append a question and its answer as one step, so no other turn can
    /// land between them.
    pub async fn append_exchange(
        &self,
        user_id: &str,
        channel_id: &str,
        question: &str,
        answer: &str,
        asked_at: DateTime<Utc>,
        answered_at: DateTime<Utc>,
    ) {
        let log = self.log(channel_id);
        let mut log = log.lock().await;

        let asked = next_timestamp(log.back(), asked_at);
        log.push_back(ConversationTurn {
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            role: Role::Question,
            text: question.to_string(),
            timestamp: asked,
        });

        let answered = next_timestamp(log.back(), answered_at);
        log.push_back(ConversationTurn {
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            role: Role::Answer,
            text: answer.to_string(),
            timestamp: answered,
        });

        self.evict(&mut log);
        debug!(channel_id, turns = log.len(), "recorded exchange");
    }

    /// Up to the last `n` turns for a channel, oldest first.
    pub async fn recent(&self, channel_id: &str, n: usize) -> Vec<ConversationTurn> {
        let Some(log) = self.channels.get(channel_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let log = log.lock().await;
        let skip = log.len().saturating_sub(n);
        log.iter().skip(skip).cloned().collect()
    }

    /// Drop a channel's history. Returns the number of turns removed.
    pub async fn clear(&self, channel_id: &str) -> usize {
        let Some(log) = self.channels.get(channel_id).map(|e| e.value().clone()) else {
            return 0;
        };
        let removed = {
            let mut log = log.lock().await;
            let removed = log.len();
            log.clear();
            removed
        };
        drop(log);
        self.channels
            .remove_if(channel_id, |_, log| is_detachable(log, |turns| turns.is_empty()));
        removed
    }

    /// Forget channels whose last turn is older than `idle` before `now`.
    /// Returns how many were dropped.
    pub fn prune_idle(&self, now: DateTime<Utc>, idle: Duration) -> usize {
        let cutoff = now - idle;
        let mut dropped = 0;
        self.channels.retain(|_, log| {
            let stale = is_detachable(log, |turns| {
                turns.back().map_or(true, |last| last.timestamp < cutoff)
            });
            dropped += usize::from(stale);
            !stale
        });
        if dropped > 0 {
            debug!(dropped, "pruned idle conversations");
        }
        dropped
    }

    /// Number of channels with any recorded history.
    pub fn active_channels(&self) -> usize {
        self.channels.len()
    }

    fn evict(&self, log: &mut VecDeque<ConversationTurn>) {
        while log.len() > self.max_turns {
            log.pop_front();
        }
    }
}

/// Whether `log` can leave the map: nobody else holds it and `check` passes.
/// Must be called under the map's shard lock so no new holder can appear.
fn is_detachable(log: &ChannelLog, check: impl Fn(&VecDeque<ConversationTurn>) -> bool) -> bool {
    Arc::strong_count(log) == 1 && log.try_lock().map_or(false, |turns| check(&*turns))
}

fn next_timestamp(last: Option<&ConversationTurn>, wanted: DateTime<Utc>) -> DateTime<Utc> {
    match last {
        Some(prev) if wanted <= prev.timestamp => prev.timestamp + Duration::microseconds(1),
        _ => wanted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn turn(channel: &str, text: &str, ts: DateTime<Utc>) -> ConversationTurn {
        ConversationTurn {
            user_id: "u".to_string(),
            channel_id: channel.to_string(),
            role: Role::Question,
            text: text.to_string(),
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_recent_is_chronological() {
        let store = ConversationStore::new(10);
        store.append(turn("c", "one", at(1))).await;
        store.append(turn("c", "two", at(2))).await;
        store.append(turn("c", "three", at(3))).await;

        let texts: Vec<_> = store
            .recent("c", 2)
            .await
            .into_iter()
            .map(|t| t.text)
            .collect();
        assert_eq!(texts, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn test_out_of_order_timestamps_are_clamped() {
        let store = ConversationStore::new(10);
        store.append(turn("c", "late", at(10))).await;
        let stored = store.append(turn("c", "early", at(5))).await;
        assert!(stored.timestamp > at(10));

        let turns = store.recent("c", 10).await;
        assert!(turns.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_exchange_with_same_instant_is_ordered() {
        let store = ConversationStore::new(10);
        store
            .append_exchange("u", "c", "q?", "a.", at(0), at(0))
            .await;
        let turns = store.recent("c", 10).await;
        assert_eq!(turns[0].role, Role::Question);
        assert_eq!(turns[1].role, Role::Answer);
        assert!(turns[0].timestamp < turns[1].timestamp);
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest() {
        let store = ConversationStore::new(4);
        for i in 0..6 {
            store.append(turn("c", &i.to_string(), at(i))).await;
        }
        let texts: Vec<_> = store
            .recent("c", 10)
            .await
            .into_iter()
            .map(|t| t.text)
            .collect();
        assert_eq!(texts, vec!["2", "3", "4", "5"]);
    }

    #[tokio::test]
    async fn test_channels_are_separate_and_clearable() {
        let store = ConversationStore::new(10);
        store.append(turn("a", "x", at(0))).await;
        store.append(turn("b", "y", at(0))).await;
        assert_eq!(store.active_channels(), 2);
        assert_eq!(store.clear("a").await, 1);
        assert!(store.recent("a", 5).await.is_empty());
        assert_eq!(store.recent("b", 5).await.len(), 1);
        assert_eq!(store.active_channels(), 1);
    }

    #[tokio::test]
    async fn test_clear_keeps_log_of_pending_writer() {
        let store = ConversationStore::new(10);
        store.append(turn("c", "old", at(0))).await;

        // A writer that already fetched the log when the channel is cleared.
        let held = store.log("c");
        assert_eq!(store.clear("c").await, 1);
        held.lock().await.push_back(turn("c", "late", at(5)));
        drop(held);

        let texts: Vec<_> = store.recent("c", 5).await.into_iter().map(|t| t.text).collect();
        assert_eq!(texts, vec!["late"]);
        assert_eq!(store.active_channels(), 1);
    }

    #[tokio::test]
    async fn test_idle_channels_are_pruned() {
        let store = ConversationStore::new(10);
        store.append(turn("quiet", "x", at(0))).await;
        store.append(turn("busy", "y", at(100))).await;

        assert_eq!(store.prune_idle(at(120), Duration::seconds(60)), 1);
        assert_eq!(store.active_channels(), 1);
        assert!(store.recent("quiet", 5).await.is_empty());
        assert_eq!(store.recent("busy", 5).await.len(), 1);

        let held = store.log("busy");
        assert_eq!(store.prune_idle(at(1000), Duration::seconds(60)), 0);
        drop(held);
        assert_eq!(store.prune_idle(at(1000), Duration::seconds(60)), 1);
        assert_eq!(store.active_channels(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_appends_stay_ordered() {
        let store = Arc::new(ConversationStore::new(1000));
        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_exchange("u", "busy", &format!("q{}", i), "a", at(0), at(0))
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let turns = store.recent("busy", 1000).await;
        assert_eq!(turns.len(), 100);
        assert!(turns.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        for pair in turns.chunks(2) {
            assert_eq!(pair[0].role, Role::Question);
            assert_eq!(pair[1].role, Role::Answer);
        }
    }
}
