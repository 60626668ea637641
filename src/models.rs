//! Core data models shared by the ingestor, index, stores and pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One ingested file, keyed by its path relative to the content root.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub id: String,
    /// `/`-separated path under the content root. Unique per document.
    pub source_path: String,
    /// Parent folder name, or `general` for files at the root.
    pub category: String,
    pub file_name: String,
    pub file_type: String,
    pub content_hash: String,
    pub ingested_at: i64,
}

impl SourceDocument {
    /// Citation label shown to users, e.g. `biology/cells.pdf`.
    pub fn citation(&self) -> String {
        format!("{}/{}", self.category, self.file_name)
    }
}

/// A passage of a document's text. The embedding lives next to it in the
/// index, never on the struct.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
    /// Nearest preceding markdown heading, if any.
    pub section: Option<String>,
}

/// A passage returned from a nearest-neighbor query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredPassage {
    pub passage_id: String,
    pub source_path: String,
    pub category: String,
    pub file_name: String,
    pub chunk_index: i64,
    pub text: String,
    pub section: Option<String>,
    pub score: f32,
}

impl ScoredPassage {
    pub fn citation(&self) -> String {
        format!("{}/{}", self.category, self.file_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Question,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationTurn {
    pub user_id: String,
    pub channel_id: String,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Answer produced by the Q&A pipeline. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SourcedAnswer {
    pub answer: String,
    pub passages: Vec<ScoredPassage>,
    /// De-duplicated `category/file_name` labels, best match first.
    pub citations: Vec<String>,
    /// Set when the integrity screen declined the question.
    pub refused: bool,
}

/// A chat message as delivered by the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub user_id: String,
    #[serde(default)]
    pub user_name: Option<String>,
    pub channel_id: String,
    pub text: String,
    #[serde(default)]
    pub is_bot: bool,
}

impl InboundMessage {
    pub fn display_name(&self) -> &str {
        self.user_name.as_deref().unwrap_or(&self.user_id)
    }
}

/// What the bot sends back for one inbound message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reply {
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<String>,
    /// Ask the platform to delete the inbound message.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub remove_original: bool,
    /// Deliver privately to the author instead of in the channel.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub direct: bool,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_citations(mut self, citations: Vec<String>) -> Self {
        self.citations = citations;
        self
    }

    /// Full reply body with a trailing sources line when citations exist.
    pub fn render(&self) -> String {
        if self.citations.is_empty() {
            self.text.clone()
        } else {
            format!("{}\n\nSources: {}", self.text, self.citations.join(", "))
        }
    }

    /// Split the rendered reply into parts no longer than `limit` characters,
    /// preferring line breaks, then spaces.
    pub fn parts(&self, limit: usize) -> Vec<String> {
        split_message(&self.render(), limit)
    }
}

pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut parts = Vec::new();
    let mut remaining = text.trim();

    while remaining.chars().count() > limit {
        let hard = remaining
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let head = &remaining[..hard];
        let split_at = head
            .rfind('\n')
            .or_else(|| head.rfind(' '))
            .filter(|&pos| pos > 0)
            .unwrap_or(hard);
        parts.push(remaining[..split_at].trim_end().to_string());
        remaining = remaining[split_at..].trim_start();
    }

    if !remaining.is_empty() || parts.is_empty() {
        parts.push(remaining.to_string());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_appends_sources() {
        let reply = Reply::text("Mitochondria.").with_citations(vec![
            "biology/cells.md".to_string(),
            "biology/energy.pdf".to_string(),
        ]);
        assert_eq!(
            reply.render(),
            "Mitochondria.\n\nSources: biology/cells.md, biology/energy.pdf"
        );
    }

    #[test]
    fn test_split_short_message_single_part() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
    }

    #[test]
    fn test_split_prefers_word_boundaries() {
        let parts = split_message("alpha beta gamma delta", 11);
        assert!(parts.iter().all(|p| p.chars().count() <= 11));
        assert_eq!(parts.join(" "), "alpha beta gamma delta");
    }

    #[test]
    fn test_split_hard_when_no_boundary() {
        let parts = split_message("abcdefghij", 4);
        assert_eq!(parts, vec!["abcd", "efgh", "ij"]);
    }

    #[test]
    fn test_reply_flags_not_serialized_when_false() {
        let json = serde_json::to_value(Reply::text("hi")).unwrap();
        assert_eq!(json, serde_json::json!({ "text": "hi" }));
    }
}
