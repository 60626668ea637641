//! HTTP inbound interface.
//!
//! Chat platform adapters post each message here; the [`Dispatcher`]
//! decides whether and how the bot replies.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/messages` | Route one inbound message, returns `{ "reply": ... }` |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/stats` | Index and conversation statistics |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "rate_limited", "message": "...", "retry_after_secs": 12 } }
//! ```
//!
//! Error codes: `bad_request` (400), `rate_limited` (429, with a
//! `Retry-After` header), `retrieval_error` (503), `generation_error` (502),
//! `storage_error` (500), `internal` (500).
//!
//! [`Dispatcher`]: crate::dispatch::Dispatcher

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bot::{Bot, BotStats};
use crate::error::BotError;
use crate::models::{InboundMessage, Reply};

/// Bind `[server].bind` and serve until the process ends.
pub async fn run_server(bot: Arc<Bot>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&bot.config.server.bind).await?;
    tokio::spawn(prune_conversations(bot.clone()));
    serve(listener, bot).await
}

/// Drop idle channels from the conversation store once a minute.
async fn prune_conversations(bot: Arc<Bot>) {
    let idle = chrono::Duration::minutes(bot.config.conversation.idle_minutes as i64);
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
    loop {
        ticker.tick().await;
        bot.conversations.prune_idle(Utc::now(), idle);
    }
}

/// Serve on an already bound listener.
pub async fn serve(listener: TcpListener, bot: Arc<Bot>) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "server listening");
    axum::serve(listener, router(bot)).await?;
    Ok(())
}

pub fn router(bot: Arc<Bot>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/messages", post(handle_message))
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(bot)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    retry_after_secs: Option<u64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after_secs;
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                retry_after_secs: retry_after,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
        retry_after_secs: None,
    }
}

impl From<BotError> for AppError {
    fn from(err: BotError) -> Self {
        let (status, retry_after_secs) = match &err {
            BotError::RateLimited { retry_after, .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                Some(retry_after.as_secs_f64().ceil() as u64),
            ),
            BotError::Retrieval(_) => (StatusCode::SERVICE_UNAVAILABLE, None),
            BotError::Generation(_) => (StatusCode::BAD_GATEWAY, None),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        let code = match err.code() {
            "rate_limited" | "retrieval_error" | "generation_error" | "storage_error" => err.code(),
            _ => "internal",
        };
        if status.is_server_error() {
            warn!(code, error = %err, "request failed");
        }
        AppError {
            status,
            code: code.to_string(),
            message: err.user_message(),
            retry_after_secs,
        }
    }
}

// ============ POST /messages ============

#[derive(Serialize)]
struct ReplyBody {
    #[serde(flatten)]
    reply: Reply,
    /// The rendered reply split to the platform's message size limit.
    parts: Vec<String>,
}

#[derive(Serialize)]
struct MessageResponse {
    reply: Option<ReplyBody>,
}

async fn handle_message(
    State(bot): State<Arc<Bot>>,
    payload: Result<Json<InboundMessage>, JsonRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    let Json(message) = payload.map_err(|e| bad_request(e.body_text()))?;
    if message.user_id.trim().is_empty() || message.channel_id.trim().is_empty() {
        return Err(bad_request("user_id and channel_id must not be empty"));
    }

    let reply = bot.dispatcher.dispatch(message, Utc::now()).await?;
    let limit = bot.config.bot.max_reply_chars;
    Ok(Json(MessageResponse {
        reply: reply.map(|reply| ReplyBody {
            parts: reply.parts(limit),
            reply,
        }),
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /stats ============

async fn handle_stats(State(bot): State<Arc<Bot>>) -> Result<Json<BotStats>, AppError> {
    Ok(Json(bot.stats().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_rate_limited_maps_to_429_with_header() {
        let err = BotError::RateLimited {
            retry_after: Duration::from_millis(2_100),
            window: crate::rate_limit::Window::Minute,
        };
        let response = AppError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
    }

    #[test]
    fn test_error_statuses() {
        let cases = [
            (BotError::Retrieval("x".into()), StatusCode::SERVICE_UNAVAILABLE, "retrieval_error"),
            (BotError::Generation("x".into()), StatusCode::BAD_GATEWAY, "generation_error"),
            (BotError::Storage("x".into()), StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            (BotError::Extraction("x".into()), StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        ];
        for (err, status, code) in cases {
            let app = AppError::from(err);
            assert_eq!(app.status, status);
            assert_eq!(app.code, code);
        }
    }
}
