//! Handles notifying configured webhooks about accepted email.
//!
//! This module defines the process-wide subscription registry and a
//! `WebhookClient` responsible for the fire-and-forget HTTP fan-out.
//! It uses `hyper` and `hyper-rustls` for the underlying HTTP/S
//! communication.

use crate::message::{Message, Webhook};
use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, USER_AGENT};
use hyper::{Method, Request};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Type alias for the HTTPS-capable connector using `hyper-rustls`.
type HttpsConn = hyper_rustls::HttpsConnector<HttpConnector>;
/// Hyper client configuration used for webhook notifications.
type HookHttpClient = Client<HttpsConn, Full<Bytes>>;

/// The process-wide webhook subscription list. Append-only: hooks are
/// registered at startup or through the management API and live for
/// the process. Readers iterate a snapshot, so a dispatch in flight
/// never observes a half-updated list.
#[derive(Default)]
pub struct WebhookRegistry {
    hooks: RwLock<Vec<Webhook>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, webhook: Webhook) {
        info!(url = %webhook.url, "registered webhook");
        self.hooks.write().push(webhook);
    }

    pub fn snapshot(&self) -> Vec<Webhook> {
        self.hooks.read().clone()
    }
}

/// Sends accepted messages to every registered webhook.
///
/// Delivery is at-most-once: failures (transport errors, timeouts, and
/// status codes >= 400) are logged and never retried, and nothing is
/// ever propagated back to the SMTP session that triggered dispatch.
pub struct WebhookClient {
    client: HookHttpClient,
    registry: Arc<WebhookRegistry>,
    /// Per-request deadline so one slow subscriber cannot pin a
    /// dispatch task indefinitely.
    request_timeout: Duration,
    user_agent: String,
}

impl WebhookClient {
    /// Creates a new `WebhookClient` over the given registry.
    ///
    /// Prefers the system's native root TLS certificates and falls
    /// back to the bundled webpki roots when none can be loaded.
    pub fn new(registry: Arc<WebhookRegistry>, request_timeout: Duration) -> Self {
        // Pin the process-wide rustls crypto provider before the
        // connector builds its TLS config.
        rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .ok();

        let https = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder.https_or_http().enable_http1().build(),
            Err(_) => HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .build(),
        };

        let client: HookHttpClient = Client::builder(TokioExecutor::new()).build(https);

        let user_agent = format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

        Self {
            client,
            registry,
            request_timeout,
            user_agent,
        }
    }

    /// Notifies every registered webhook about `message`, one request
    /// per subscription, continuing past individual failures.
    pub async fn dispatch(&self, message: &Message) {
        let hooks = self.registry.snapshot();
        if hooks.is_empty() {
            return;
        }

        debug!(id = %message.id, count = hooks.len(), "dispatching webhooks");
        for hook in hooks {
            if let Err(e) = self.deliver(&hook, message).await {
                error!("webhook delivery to {} failed: {e:#}", hook.url);
            }
        }
    }

    /// Sends one notification request. Status codes >= 400 count as
    /// failures so the caller logs them.
    async fn deliver(&self, hook: &Webhook, message: &Message) -> Result<()> {
        let json_body = serde_json::to_string(message)?;

        let method = if hook.method.is_empty() {
            Method::POST
        } else {
            Method::from_bytes(hook.method.to_ascii_uppercase().as_bytes())?
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(&hook.url)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, &self.user_agent);
        for (name, value) in &hook.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder.body(Full::new(Bytes::from(json_body)))?;

        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| anyhow!("request timed out after {:?}", self.request_timeout))??;

        let status = response.status();
        if status.as_u16() >= 400 {
            bail!("webhook returned status {status}");
        }

        debug!(url = %hook.url, %status, "webhook delivered");
        Ok(())
    }
}
