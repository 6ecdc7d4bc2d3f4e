//! The management HTTP API: read and mutate the mailbox store,
//! register webhooks, submit outbound mail, and expose a health
//! endpoint. Everything under `/api` sits behind optional API-key
//! auth and a global rate limit; the health endpoints bypass both so
//! probes keep working.

mod rate_limit;

use crate::config::{Config, StorageKind};
use crate::message::{OutboundMessage, Webhook};
use crate::relay::RelayClient;
use crate::storage::{Storage, StorageError};
use crate::webhook::WebhookRegistry;
use anyhow::{Context, Result};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rate_limit::RateLimiter;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Shared state behind every API handler.
pub struct ApiState {
    storage: Arc<dyn Storage>,
    webhooks: Arc<WebhookRegistry>,
    relay: RelayClient,
    limiter: RateLimiter,
    config: Config,
    started: DateTime<Utc>,
}

/// Runs the management API server until it fails.
pub async fn run_api_server(
    config: Config,
    storage: Arc<dyn Storage>,
    webhooks: Arc<WebhookRegistry>,
    started: DateTime<Utc>,
) -> Result<()> {
    let addr = format!("{}:{}", config.api_bind_address, config.api_port);
    let enable_cors = config.enable_cors;

    let state = Arc::new(ApiState {
        relay: RelayClient::new(config.clone()),
        limiter: RateLimiter::new(config.rate_limit_per_minute),
        storage,
        webhooks,
        config,
        started,
    });

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind API server on {addr}"))?;

    info!("API server listening on {addr}");

    axum::serve(listener, router(state, enable_cors))
        .await
        .context("API server failed")?;
    Ok(())
}

/// Builds the full route tree. Separated from `run_api_server` so
/// tests can mount it over an ephemeral listener.
fn router(state: Arc<ApiState>, enable_cors: bool) -> Router {
    // Layers wrap only the routes registered before them, so the
    // health route added afterwards stays open.
    let api = Router::new()
        .route("/emails", get(list_emails).delete(clear_emails))
        .route("/emails/{id}", get(get_email).delete(delete_email))
        .route("/stats", get(get_stats))
        .route("/webhooks", post(add_webhook))
        .route("/send", post(send_email))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), throttle))
        .route("/health", get(health_check));

    let app = Router::new()
        .nest("/api", api)
        .route("/health", get(health_check))
        .with_state(state);

    if enable_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

// Middleware

async fn require_api_key(
    State(state): State<Arc<ApiState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.config.api_key.is_empty() {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());
    if presented != Some(state.config.api_key.as_str()) {
        return error_response(StatusCode::UNAUTHORIZED, "Invalid API key");
    }

    next.run(request).await
}

async fn throttle(State(state): State<Arc<ApiState>>, request: Request, next: Next) -> Response {
    if !state.limiter.try_acquire() {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
    }
    next.run(request).await
}

// Handlers

async fn list_emails(State(state): State<Arc<ApiState>>) -> Response {
    match state.storage.list().await {
        Ok(emails) => Json(json!({
            "count": emails.len(),
            "emails": emails,
        }))
        .into_response(),
        Err(e) => {
            error!("failed to list emails: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to list emails")
        }
    }
}

async fn get_email(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    match state.storage.get(&id).await {
        Ok(email) => Json(email).into_response(),
        Err(StorageError::NotFound) => error_response(StatusCode::NOT_FOUND, "Email not found"),
        Err(e) => {
            error!("failed to fetch email {id}: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch email")
        }
    }
}

async fn delete_email(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    match state.storage.delete(&id).await {
        Ok(()) => Json(json!({"message": "Email deleted successfully"})).into_response(),
        Err(StorageError::NotFound) => error_response(StatusCode::NOT_FOUND, "Email not found"),
        Err(e) => {
            error!("failed to delete email {id}: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to delete email")
        }
    }
}

async fn clear_emails(State(state): State<Arc<ApiState>>) -> Response {
    match state.storage.clear().await {
        Ok(()) => Json(json!({"message": "All emails cleared successfully"})).into_response(),
        Err(e) => {
            error!("failed to clear emails: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to clear emails")
        }
    }
}

async fn get_stats(State(state): State<Arc<ApiState>>) -> Response {
    Json(state.storage.stats().await).into_response()
}

async fn add_webhook(
    State(state): State<Arc<ApiState>>,
    Json(webhook): Json<Webhook>,
) -> Response {
    if webhook.url.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Webhook URL is required");
    }

    state.webhooks.add(webhook);
    Json(json!({"message": "Webhook added successfully"})).into_response()
}

async fn send_email(
    State(state): State<Arc<ApiState>>,
    Json(outbound): Json<OutboundMessage>,
) -> Response {
    if outbound.to.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "At least one recipient is required");
    }
    if outbound.subject.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Subject is required");
    }
    if outbound.body.is_empty() && outbound.html.as_deref().unwrap_or_default().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Either body or html is required");
    }

    match state.relay.send(&outbound).await {
        Ok(()) => Json(json!({"message": "Email sent successfully"})).into_response(),
        Err(e) => {
            error!("failed to send email: {e:#}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to send email: {e}"),
            )
        }
    }
}

async fn health_check(State(state): State<Arc<ApiState>>) -> Response {
    let stats = state.storage.stats().await;
    let now = Utc::now();

    Json(json!({
        "status": "healthy",
        "timestamp": now.to_rfc3339(),
        "uptime_seconds": (now - state.started).num_seconds(),
        "storage": match state.config.storage_kind {
            StorageKind::Memory => "memory",
            StorageKind::File => "file",
        },
        "smtp_port": state.config.smtp_port,
        "api_port": state.config.api_port,
        "total_emails": stats.total_emails,
    }))
    .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
