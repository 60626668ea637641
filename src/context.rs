//! Bounded context assembly for the generation service.
//!
//! Token counts are estimated as `ceil(chars / 4)`. Retrieved passages are
//! packed first in rank order; whatever budget is left goes to the newest
//! conversation turns, which are then emitted oldest first.

use crate::chunk::CHARS_PER_TOKEN;
use crate::generation::ChatMessage;
use crate::models::{ConversationTurn, Role, ScoredPassage};

/// What fits into one generation request.
#[derive(Debug, Clone, Default)]
pub struct ContextWindow {
    /// Passages in rank order. The first may be truncated.
    pub passages: Vec<ScoredPassage>,
    /// Turns in chronological order.
    pub turns: Vec<ConversationTurn>,
    pub used_tokens: usize,
    /// Whether any passage or turn was cut or left out.
    pub truncated: bool,
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Pack `passages` (best first) and `turns` (oldest first) into `budget` tokens.
pub fn assemble(
    passages: &[ScoredPassage],
    turns: &[ConversationTurn],
    budget: usize,
) -> ContextWindow {
    let mut window = ContextWindow::default();
    let mut remaining = budget;

    for (rank, passage) in passages.iter().enumerate() {
        let cost = estimate_tokens(&passage.text);
        if cost <= remaining {
            remaining -= cost;
            window.passages.push(passage.clone());
            continue;
        }
        if rank == 0 {
            let mut cut = passage.clone();
            cut.text = cut
                .text
                .chars()
                .take(remaining * CHARS_PER_TOKEN)
                .collect();
            remaining -= estimate_tokens(&cut.text);
            window.passages.push(cut);
        }
        window.truncated = true;
        break;
    }

    let mut kept = Vec::new();
    for turn in turns.iter().rev() {
        let cost = estimate_tokens(&turn.text);
        if cost > remaining {
            window.truncated = true;
            break;
        }
        remaining -= cost;
        kept.push(turn.clone());
    }
    kept.reverse();
    window.turns = kept;

    window.used_tokens = budget - remaining;
    window
}

impl ContextWindow {
    /// Numbered passage block, e.g. `[1] biology/cells.md (Mitosis)` then the text.
    pub fn render_passages(&self) -> String {
        self.passages
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let header = match &p.section {
                    Some(section) => format!("[{}] {} ({})", i + 1, p.citation(), section),
                    None => format!("[{}] {}", i + 1, p.citation()),
                };
                format!("{}\n{}", header, p.text.trim())
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Turns as prior chat messages, questions as user and answers as assistant.
    pub fn history_messages(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .map(|t| match t.role {
                Role::Question => ChatMessage::user(t.text.clone()),
                Role::Answer => ChatMessage::assistant(t.text.clone()),
            })
            .collect()
    }
}
