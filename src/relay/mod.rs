//! Outbound relay: submits messages accepted on `POST /api/send`
//! through a configured upstream SMTP server using `lettre`.

use crate::config::Config;
use crate::message::OutboundMessage;
use anyhow::{bail, Context, Result};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as MailMessage, Tokio1Executor};
use tracing::info;

/// A thin client around the configured relay. Builds one transport
/// per submission; outbound volume here is interactive, not bulk.
pub struct RelayClient {
    config: Config,
}

impl RelayClient {
    pub fn new(config: Config) -> Self {
        RelayClient { config }
    }

    /// Relays one message upstream over STARTTLS with the configured
    /// credentials.
    pub async fn send(&self, outbound: &OutboundMessage) -> Result<()> {
        let config = &self.config;
        if config.relay_host.is_empty()
            || config.relay_username.is_empty()
            || config.relay_password.is_empty()
        {
            bail!("outbound relay is not configured");
        }

        // Sender precedence: explicit, then configured default, then
        // the relay account itself.
        let from = [
            outbound.from.as_str(),
            config.relay_from.as_str(),
            config.relay_username.as_str(),
        ]
        .into_iter()
        .find(|candidate| !candidate.is_empty())
        .unwrap_or_default();

        let mut builder = MailMessage::builder()
            .from(
                from.parse::<Mailbox>()
                    .with_context(|| format!("invalid From address '{from}'"))?,
            )
            .subject(outbound.subject.clone());
        for to in &outbound.to {
            builder = builder.to(to
                .parse()
                .with_context(|| format!("invalid To address '{to}'"))?);
        }
        for cc in &outbound.cc {
            builder = builder.cc(cc
                .parse()
                .with_context(|| format!("invalid Cc address '{cc}'"))?);
        }
        for bcc in &outbound.bcc {
            builder = builder.bcc(bcc
                .parse()
                .with_context(|| format!("invalid Bcc address '{bcc}'"))?);
        }

        let email = match outbound.html.as_deref() {
            Some(html) if !html.is_empty() => builder.multipart(
                MultiPart::alternative_plain_html(outbound.body.clone(), html.to_string()),
            )?,
            _ => builder.body(outbound.body.clone())?,
        };

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.relay_host)
            .context("failed to configure relay transport")?
            .port(config.relay_port)
            .credentials(Credentials::new(
                config.relay_username.clone(),
                config.relay_password.clone(),
            ))
            .build();

        mailer
            .send(email)
            .await
            .context("relay submission failed")?;

        info!(from, to = ?outbound.to, subject = %outbound.subject, "email relayed");
        Ok(())
    }
}
