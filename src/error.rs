//! Error taxonomy shared by the pipelines, stores and ingestor.
//!
//! Command-layer code (config loading, wiring, CLI) uses `anyhow`; anything
//! a handler or batch operation needs to classify goes through [`BotError`].

use std::time::Duration;

use thiserror::Error;

use crate::rate_limit::Window;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("rate limit exceeded ({window}), retry in {:.1}s", .retry_after.as_secs_f64())]
    RateLimited { retry_after: Duration, window: Window },

    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BotResult<T> = Result<T, BotError>;

impl From<sqlx::Error> for BotError {
    fn from(err: sqlx::Error) -> Self {
        BotError::Storage(err.to_string())
    }
}

impl BotError {
    /// Short machine-readable code used in HTTP error bodies and logs.
    pub fn code(&self) -> &'static str {
        match self {
            BotError::RateLimited { .. } => "rate_limited",
            BotError::Retrieval(_) => "retrieval_error",
            BotError::Generation(_) => "generation_error",
            BotError::UnsupportedFormat(_) => "unsupported_format",
            BotError::FileTooLarge { .. } => "file_too_large",
            BotError::Extraction(_) => "extraction_error",
            BotError::Embedding(_) => "embedding_error",
            BotError::Storage(_) => "storage_error",
            BotError::Io(_) => "internal",
        }
    }

    /// Text safe to show to the person who sent the message.
    pub fn user_message(&self) -> String {
        match self {
            BotError::RateLimited {
                retry_after,
                window,
            } => format!(
                "You've exceeded the rate limit ({}). Please wait {:.1} seconds before trying again.",
                window,
                retry_after.as_secs_f64()
            ),
            BotError::Retrieval(_) => {
                "I couldn't search the course materials right now. Please try again in a moment!"
                    .to_string()
            }
            BotError::Generation(_) => {
                "I'm having trouble connecting to my knowledge base right now. Please try again in a moment!"
                    .to_string()
            }
            _ => "Sorry, I encountered an unexpected error. Please try again!".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_message_mentions_window() {
        let err = BotError::RateLimited {
            retry_after: Duration::from_millis(12_300),
            window: Window::Minute,
        };
        assert_eq!(err.code(), "rate_limited");
        assert!(err.user_message().contains("per minute"));
        assert!(err.user_message().contains("12.3"));
    }

    #[test]
    fn test_sqlx_errors_are_storage() {
        let err: BotError = sqlx::Error::PoolClosed.into();
        assert_eq!(err.code(), "storage_error");
    }
}
