//! Drives one SMTP connection: owns the envelope, enforces the
//! per-command deadline, runs the AUTH and STARTTLS sub-protocols,
//! collects DATA payloads, and hands committed messages to the store
//! and the webhook dispatcher.

use crate::message::{new_message_id, Message};
use crate::smtp::email_parser::EmailParser;
use crate::smtp::smtp_protocol::{
    SmtpCapabilities, SmtpCommandResult, SmtpProtocol, SmtpState, MAX_MESSAGE_SIZE,
};
use crate::storage::Storage;
use crate::webhook::WebhookClient;
use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Shared collaborators and settings handed to every session.
pub(crate) struct SessionContext {
    pub storage: Arc<dyn Storage>,
    pub webhooks: Arc<WebhookClient>,
    /// Deadline applied to every read: command lines, DATA lines,
    /// and AUTH credential lines alike.
    pub command_timeout: Duration,
    pub enable_auth: bool,
    /// Present when STARTTLS is enabled with a configured keypair.
    pub tls: Option<TlsAcceptor>,
}

/// How a session loop ended: the connection is done, or the client
/// asked for a TLS upgrade and the raw stream must be handed to the
/// acceptor.
pub(crate) enum SessionEnd<S> {
    Closed,
    StartTls(S),
}

/// The per-transaction envelope. Lives strictly within one session;
/// cleared after DATA commits (successfully or not), on RSET, and on
/// EHLO/HELO. The authenticated flag is session-scoped and survives
/// envelope resets.
#[derive(Debug, Default)]
pub(crate) struct Envelope {
    pub from: String,
    pub to: Vec<String>,
    pub authenticated: bool,
}

impl Envelope {
    fn clear(&mut self) {
        self.from.clear();
        self.to.clear();
    }
}

/// Handles a single SMTP client connection, including the optional
/// mid-session TLS upgrade.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    context: Arc<SessionContext>,
) -> Result<()> {
    let mut protocol = SmtpProtocol::new(
        stream,
        SmtpCapabilities {
            starttls: context.tls.is_some(),
            auth: context.enable_auth,
        },
    );
    protocol.send_greeting().await?;

    match run_session(protocol, &context, false).await? {
        SessionEnd::Closed => Ok(()),
        SessionEnd::StartTls(stream) => {
            // run_session only requests the upgrade when an acceptor
            // is configured.
            let Some(acceptor) = context.tls.clone() else {
                return Ok(());
            };
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(|e| anyhow!("TLS handshake failed: {e}"))?;
            debug!("connection upgraded to TLS");

            // Fresh protocol state over the encrypted stream: the
            // client must re-EHLO, and STARTTLS is no longer offered.
            let protocol = SmtpProtocol::new(
                tls_stream,
                SmtpCapabilities {
                    starttls: false,
                    auth: context.enable_auth,
                },
            );
            match run_session(protocol, &context, true).await? {
                SessionEnd::Closed => Ok(()),
                SessionEnd::StartTls(_) => Ok(()),
            }
        }
    }
}

/// The command loop for one (plaintext or encrypted) leg of a session.
pub(crate) async fn run_session<S>(
    mut protocol: SmtpProtocol<S>,
    context: &SessionContext,
    tls_active: bool,
) -> Result<SessionEnd<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut envelope = Envelope::default();

    loop {
        let Some(line) = read_with_deadline(&mut protocol, context.command_timeout).await? else {
            return Ok(SessionEnd::Closed);
        };

        // Stray blank lines between commands are skipped; inside DATA
        // an empty line is content and handled by the protocol.
        if line.is_empty() && protocol.state() != SmtpState::Data {
            continue;
        }

        match protocol.process_command(&line).await? {
            SmtpCommandResult::Continue => {}
            SmtpCommandResult::Quit => return Ok(SessionEnd::Closed),
            SmtpCommandResult::Helo | SmtpCommandResult::Reset => envelope.clear(),
            SmtpCommandResult::MailFrom(address) => {
                // A new MAIL restarts the transaction.
                envelope.from = address;
                envelope.to.clear();
            }
            SmtpCommandResult::RcptTo(address) => envelope.to.push(address),
            SmtpCommandResult::DataStart => {
                if !collect_data(&mut protocol, context, &mut envelope).await? {
                    return Ok(SessionEnd::Closed);
                }
            }
            SmtpCommandResult::Auth(mechanism) => {
                if !authenticate(&mut protocol, context, &mut envelope, &mechanism).await? {
                    return Ok(SessionEnd::Closed);
                }
            }
            SmtpCommandResult::StartTls => {
                if tls_active {
                    protocol.write_line("503 Bad sequence of commands").await?;
                } else if context.tls.is_none() {
                    protocol.write_line("454 TLS not available").await?;
                } else {
                    protocol.write_line("220 Ready to start TLS").await?;
                    return Ok(SessionEnd::StartTls(protocol.into_inner()));
                }
            }
            // Data content results only occur inside collect_data.
            SmtpCommandResult::DataLine(_) | SmtpCommandResult::DataEnd => {}
        }
    }
}

/// Reads one line under the per-command deadline. `Ok(None)` means the
/// connection should close silently: the peer went away or the
/// deadline passed.
async fn read_with_deadline<S>(
    protocol: &mut SmtpProtocol<S>,
    deadline: Duration,
) -> Result<Option<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(deadline, protocol.read_line()).await {
        Ok(result) => result,
        Err(_) => {
            debug!("command deadline exceeded, closing connection");
            Ok(None)
        }
    }
}

/// Reads DATA content until the terminator, then commits the message.
/// Returns `false` when the connection closed mid-payload.
async fn collect_data<S>(
    protocol: &mut SmtpProtocol<S>,
    context: &SessionContext,
    envelope: &mut Envelope,
) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut payload = String::new();
    let mut oversized = false;

    loop {
        let Some(line) = read_with_deadline(protocol, context.command_timeout).await? else {
            return Ok(false);
        };

        match protocol.process_command(&line).await? {
            SmtpCommandResult::DataLine(content) => {
                if oversized {
                    continue;
                }
                payload.push_str(&content);
                payload.push_str("\r\n");
                if payload.len() > MAX_MESSAGE_SIZE {
                    debug!("DATA payload exceeded the size limit, draining to terminator");
                    oversized = true;
                }
            }
            SmtpCommandResult::DataEnd => break,
            other => debug!(?other, "ignoring non-data result in DATA mode"),
        }
    }

    if oversized {
        protocol
            .write_line("552 Message size exceeds fixed maximum")
            .await?;
        envelope.clear();
        return Ok(true);
    }

    let message = build_message(envelope, payload);
    match context.storage.save(message).await {
        Ok(stored) => {
            info!(
                id = %stored.id,
                from = %stored.from,
                subject = %stored.subject,
                authenticated = envelope.authenticated,
                "email accepted"
            );
            // Fire-and-forget: the 250 must not wait on subscribers.
            let webhooks = Arc::clone(&context.webhooks);
            tokio::spawn(async move {
                webhooks.dispatch(&stored).await;
            });
            protocol.write_line("250 OK: Message accepted").await?;
        }
        Err(e) => {
            error!("failed to save email: {e}");
            protocol.write_line("554 Transaction failed").await?;
        }
    }

    envelope.clear();
    Ok(true)
}

/// Assembles a `Message` from the envelope and the collected payload.
/// The store stamps `received_at` when it accepts the message.
fn build_message(envelope: &Envelope, payload: String) -> Message {
    let size = payload.len() as u64;
    let parsed = EmailParser::parse(&payload);

    Message {
        id: new_message_id(),
        from: envelope.from.clone(),
        to: envelope.to.clone(),
        subject: parsed.subject,
        body: parsed.body,
        html: None,
        headers: parsed.headers,
        attachments: Vec::new(),
        received_at: Utc::now(),
        size,
    }
}

/// Runs an AUTH challenge dialogue. Credentials are accepted without
/// validation: this is a compatibility shim for clients that insist on
/// authenticating, not a security control, and the server logs it as
/// such at startup. Returns `false` when the connection closed mid-
/// dialogue.
async fn authenticate<S>(
    protocol: &mut SmtpProtocol<S>,
    context: &SessionContext,
    envelope: &mut Envelope,
    mechanism: &str,
) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !context.enable_auth {
        protocol.write_line("503 Authentication not enabled").await?;
        return Ok(true);
    }
    if mechanism.is_empty() {
        protocol
            .write_line("501 Syntax error in parameters")
            .await?;
        return Ok(true);
    }

    match mechanism {
        "PLAIN" => {
            protocol.write_line("334 ").await?;
            let Some(credentials) =
                read_with_deadline(protocol, context.command_timeout).await?
            else {
                return Ok(false);
            };
            if let Some(identity) = plain_identity(&credentials) {
                debug!(%identity, "AUTH PLAIN credentials received");
            }
            accept_authentication(protocol, envelope).await?;
        }
        "LOGIN" => {
            // Challenges are "Username:" and "Password:" in base64.
            protocol.write_line("334 VXNlcm5hbWU6").await?;
            if read_with_deadline(protocol, context.command_timeout)
                .await?
                .is_none()
            {
                return Ok(false);
            }
            protocol.write_line("334 UGFzc3dvcmQ6").await?;
            if read_with_deadline(protocol, context.command_timeout)
                .await?
                .is_none()
            {
                return Ok(false);
            }
            accept_authentication(protocol, envelope).await?;
        }
        _ => {
            protocol
                .write_line("504 Authentication mechanism not supported")
                .await?;
        }
    }

    Ok(true)
}

async fn accept_authentication<S>(
    protocol: &mut SmtpProtocol<S>,
    envelope: &mut Envelope,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    envelope.authenticated = true;
    protocol.mark_greeted();
    protocol.write_line("235 Authentication successful").await
}

/// Extracts the authentication identity from an AUTH PLAIN initial
/// response (`base64("authzid NUL authcid NUL password")`), for
/// logging only.
fn plain_identity(credentials: &str) -> Option<String> {
    let decoded = BASE64.decode(credentials.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let mut parts = decoded.split('\0');
    let _authzid = parts.next()?;
    parts.next().map(str::to_string)
}
