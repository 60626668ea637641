//! JSON-over-HTTP calls with retry and exponential backoff.
//!
//! Shared by the embedding and generation clients:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Connection errors → retry
//! - Timeouts → fail immediately; the caller surfaces its own error kind
//! - Backoff: `backoff_ms * 2^(attempt-1)`, exponent capped at 5

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(5);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("{service} request timed out: {message}")]
    Timeout { service: String, message: String },
    #[error("{service} API error {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },
    #[error("{service} connection error: {message}")]
    Transport { service: String, message: String },
    #[error("{service} returned an invalid response: {message}")]
    Decode { service: String, message: String },
}

impl CallError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }
}

/// Build a client whose per-attempt timeout is `timeout`.
pub fn client_with_timeout(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// POST `body` to `url` and decode the JSON response, retrying transient failures.
pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    policy: &RetryPolicy,
    service: &str,
) -> Result<serde_json::Value, CallError> {
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay(attempt);
            debug!(service, attempt, ?delay, "retrying request");
            tokio::time::sleep(delay).await;
        }

        let mut request = client.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json::<serde_json::Value>().await.map_err(|e| {
                        if e.is_timeout() {
                            CallError::Timeout {
                                service: service.to_string(),
                                message: e.to_string(),
                            }
                        } else {
                            CallError::Decode {
                                service: service.to_string(),
                                message: e.to_string(),
                            }
                        }
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = CallError::Status {
                    service: service.to_string(),
                    status: status.as_u16(),
                    body: body_text,
                };

                // Rate limited or server error: retry
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(service, status = status.as_u16(), attempt, "transient API error");
                    last_err = Some(err);
                    continue;
                }

                return Err(err);
            }
            Err(e) if e.is_timeout() => {
                return Err(CallError::Timeout {
                    service: service.to_string(),
                    message: e.to_string(),
                });
            }
            Err(e) => {
                warn!(service, attempt, error = %e, "request failed");
                last_err = Some(CallError::Transport {
                    service: service.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    Err(last_err.unwrap_or_else(|| CallError::Transport {
        service: service.to_string(),
        message: "request failed after retries".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff_ms: 100,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(6), Duration::from_millis(3200));
        assert_eq!(policy.delay(9), Duration::from_millis(3200));
    }
}
