//! Handles the SMTP server logic: listening for connections, running
//! the per-connection protocol state machine, parsing received email,
//! and handing accepted messages to storage and webhook fan-out.

mod email_parser;
mod session;
mod smtp_protocol;
mod tls;

#[cfg(test)]
mod tests;

pub use smtp_protocol::MAX_MESSAGE_SIZE;

use crate::config::Config;
use crate::storage::Storage;
use crate::webhook::WebhookClient;
use anyhow::{Context, Result};
use session::SessionContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// The SMTP receiving server: a TCP accept loop that spawns one
/// independent session task per connection.
pub struct Server {
    bind_address: String,
    context: Arc<SessionContext>,
    shutdown: CancellationToken,
}

impl Server {
    /// Creates a new SMTP server.
    ///
    /// Loads the STARTTLS keypair when TLS is enabled; an unreadable
    /// or invalid keypair is a construction error.
    pub fn new(
        config: &Config,
        storage: Arc<dyn Storage>,
        webhooks: Arc<WebhookClient>,
    ) -> Result<Self> {
        let tls = if config.enable_tls {
            if config.tls_cert_file.is_empty() || config.tls_key_file.is_empty() {
                warn!("TLS enabled without a configured keypair; STARTTLS will be refused");
                None
            } else {
                Some(tls::load_acceptor(
                    &config.tls_cert_file,
                    &config.tls_key_file,
                )?)
            }
        } else {
            None
        };

        if config.enable_auth {
            warn!("SMTP AUTH is enabled as a compatibility shim; credentials are NOT validated");
        }

        Ok(Server {
            bind_address: format!("{}:{}", config.smtp_bind_address, config.smtp_port),
            context: Arc::new(SessionContext {
                storage,
                webhooks,
                command_timeout: Duration::from_secs(config.smtp_timeout_secs),
                enable_auth: config.enable_auth,
                tls,
            }),
            shutdown: CancellationToken::new(),
        })
    }

    /// Returns a token that stops the accept loop when cancelled.
    /// In-flight sessions keep running until their next timeout or
    /// natural termination.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the accept loop until the shutdown token is cancelled.
    ///
    /// Accept errors are logged and the loop continues; only the
    /// initial bind failure is fatal.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address)
            .await
            .with_context(|| format!("failed to bind SMTP listener on {}", self.bind_address))?;

        info!("SMTP server listening on {}", self.bind_address);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("SMTP server stopping");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!(%addr, "new connection");
                        let context = Arc::clone(&self.context);
                        tokio::spawn(async move {
                            if let Err(e) = session::handle_connection(stream, context).await {
                                error!("error handling SMTP connection from {addr}: {e:#}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("error accepting connection: {e}");
                    }
                }
            }
        }
    }
}
