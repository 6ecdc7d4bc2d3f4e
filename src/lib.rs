//! Orchestrates the mailbin application startup and component
//! lifecycle.
//!
//! This library crate wires configuration, storage, webhook fan-out,
//! the SMTP receiver, and the management API together, then supervises
//! the two server tasks. A shutdown signal closes the SMTP listener;
//! in-flight sessions run to their own natural end.

pub mod api;
pub mod config;
pub mod message;
pub mod relay;
pub mod smtp;
pub mod storage;
pub mod webhook;

use crate::config::{Config, StorageKind};
use crate::message::Webhook;
use crate::storage::{FileStorage, MemoryStorage, Storage};
use crate::webhook::{WebhookClient, WebhookRegistry};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tracing::{error, info};

/// Runs the application until a fatal error or a shutdown signal.
///
/// Both server tasks are expected to run forever; either one exiting
/// is treated as a fatal condition and propagated to `main`.
pub async fn run() -> Result<()> {
    info!(
        "starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::from_env()?;
    let started = Utc::now();

    let storage: Arc<dyn Storage> = match config.storage_kind {
        StorageKind::File => {
            info!("using file storage: {}", config.storage_file);
            Arc::new(FileStorage::open(&config.storage_file, config.max_messages, started).await?)
        }
        StorageKind::Memory => {
            info!("using in-memory storage");
            Arc::new(MemoryStorage::new(config.max_messages, started))
        }
    };

    let registry = Arc::new(WebhookRegistry::new());
    for url in &config.webhook_urls {
        registry.add(Webhook {
            url: url.clone(),
            method: String::new(),
            headers: Default::default(),
        });
    }
    let webhook_client = Arc::new(WebhookClient::new(
        Arc::clone(&registry),
        Duration::from_secs(config.webhook_timeout_secs),
    ));

    let smtp_server = smtp::Server::new(&config, Arc::clone(&storage), webhook_client)?;
    let shutdown = smtp_server.shutdown_handle();

    let smtp_handle = tokio::spawn(async move { smtp_server.run().await });
    let api_handle = tokio::spawn(api::run_api_server(config, storage, registry, started));

    select! {
        res = smtp_handle => match res {
            Ok(Ok(())) => Err(anyhow!("SMTP server exited unexpectedly")),
            Ok(Err(e)) => {
                error!("SMTP server returned error: {e:#}");
                Err(e)
            }
            Err(join_error) => Err(anyhow!("SMTP server task failed: {join_error}")),
        },
        res = api_handle => match res {
            Ok(Ok(())) => Err(anyhow!("API server exited unexpectedly")),
            Ok(Err(e)) => {
                error!("API server returned error: {e:#}");
                Err(e)
            }
            Err(join_error) => Err(anyhow!("API server task failed: {join_error}")),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            shutdown.cancel();
            info!("server stopped");
            Ok(())
        }
    }
}
