//! Implements the state machine and command handling logic for the SMTP protocol.
//!
//! This module defines the states of an SMTP conversation (`SmtpState`),
//! manages reading commands and writing responses over the connection,
//! parses command lines, and transitions the state accordingly. Envelope
//! accumulation, AUTH dialogues, timeouts, and the TLS upgrade live in
//! the session layer; this type owns line framing and sequencing only.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::debug;

/// Maximum DATA payload size advertised on EHLO and enforced by the
/// session, in bytes (10 MiB).
pub const MAX_MESSAGE_SIZE: usize = 10_485_760;

/// Represents the possible states during an SMTP session.
///
/// The protocol handler transitions between these states based on the
/// commands received.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SmtpState {
    /// Greeting sent, client has not yet identified with HELO/EHLO.
    Initial,
    /// Client identified; envelope empty, awaiting MAIL.
    Greeted,
    /// Reverse-path fixed; awaiting RCPT.
    MailFrom,
    /// At least one recipient accepted; awaiting more RCPT, DATA, or RSET.
    RcptTo,
    /// Reading message content until the `.` terminator line.
    Data,
}

/// Capabilities advertised in the multi-line EHLO response.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmtpCapabilities {
    /// Advertise STARTTLS. Off when TLS is not configured or the
    /// session is already encrypted.
    pub starttls: bool,
    /// Advertise AUTH PLAIN LOGIN.
    pub auth: bool,
}

/// Manages the state and I/O for a single SMTP client connection.
///
/// Generic over the underlying stream so sessions can run over plain
/// TCP, a TLS stream after STARTTLS, or an in-memory duplex in tests.
pub struct SmtpProtocol<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream: BufStream<S>,
    capabilities: SmtpCapabilities,
    state: SmtpState,
}

impl<S> SmtpProtocol<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a new protocol handler in `SmtpState::Initial`.
    pub fn new(stream: S, capabilities: SmtpCapabilities) -> Self {
        SmtpProtocol {
            stream: BufStream::new(stream),
            capabilities,
            state: SmtpState::Initial,
        }
    }

    /// Sends the initial SMTP greeting (220) to the client.
    ///
    /// Called once, immediately after the TCP connection is accepted.
    /// Not repeated after a STARTTLS upgrade.
    pub async fn send_greeting(&mut self) -> Result<()> {
        self.write_line("220 SMTP Server Ready").await
    }

    /// Processes a single input line according to the current state.
    ///
    /// In command states the first whitespace-delimited token is the
    /// verb, matched case-insensitively. In `Data` state every line is
    /// content until the bare `.` terminator. Responses for fully
    /// protocol-level outcomes are written here; results that need
    /// configuration or storage (AUTH, STARTTLS, end of DATA) are
    /// returned to the session unanswered.
    pub async fn process_command(&mut self, line: &str) -> Result<SmtpCommandResult> {
        if self.state == SmtpState::Data {
            return Ok(self.process_data_line(line));
        }

        debug!(state = ?self.state, %line, "processing command");
        let verb = line
            .split_ascii_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        match verb.as_str() {
            "NOOP" => {
                self.write_line("250 OK").await?;
                Ok(SmtpCommandResult::Continue)
            }
            "RSET" => {
                self.write_line("250 OK").await?;
                self.state = SmtpState::Greeted;
                Ok(SmtpCommandResult::Reset)
            }
            "QUIT" => {
                self.write_line("221 Bye").await?;
                Ok(SmtpCommandResult::Quit)
            }
            "HELO" => {
                self.write_line("250 Hello").await?;
                self.state = SmtpState::Greeted;
                Ok(SmtpCommandResult::Helo)
            }
            "EHLO" => {
                self.write_line("250-Hello").await?;
                if self.capabilities.starttls {
                    self.write_line("250-STARTTLS").await?;
                }
                if self.capabilities.auth {
                    self.write_line("250-AUTH PLAIN LOGIN").await?;
                }
                self.write_line(&format!("250 SIZE {}", MAX_MESSAGE_SIZE)).await?;
                self.state = SmtpState::Greeted;
                Ok(SmtpCommandResult::Helo)
            }
            "MAIL" => match self.state {
                SmtpState::Greeted | SmtpState::MailFrom | SmtpState::RcptTo => {
                    match extract_address(line) {
                        Some(address) => {
                            self.write_line("250 OK").await?;
                            self.state = SmtpState::MailFrom;
                            Ok(SmtpCommandResult::MailFrom(address))
                        }
                        None => {
                            self.write_line("501 Syntax error in parameters").await?;
                            Ok(SmtpCommandResult::Continue)
                        }
                    }
                }
                _ => self.bad_sequence().await,
            },
            "RCPT" => match self.state {
                SmtpState::MailFrom | SmtpState::RcptTo => match extract_address(line) {
                    Some(address) => {
                        self.write_line("250 OK").await?;
                        self.state = SmtpState::RcptTo;
                        Ok(SmtpCommandResult::RcptTo(address))
                    }
                    None => {
                        self.write_line("501 Syntax error in parameters").await?;
                        Ok(SmtpCommandResult::Continue)
                    }
                },
                _ => self.bad_sequence().await,
            },
            "DATA" => match self.state {
                SmtpState::RcptTo => {
                    self.write_line("354 Start mail input; end with <CRLF>.<CRLF>")
                        .await?;
                    self.state = SmtpState::Data;
                    Ok(SmtpCommandResult::DataStart)
                }
                _ => self.bad_sequence().await,
            },
            "AUTH" => {
                // The session decides whether AUTH is enabled and runs
                // the challenge dialogue.
                let mechanism = line
                    .split_ascii_whitespace()
                    .nth(1)
                    .unwrap_or("")
                    .to_ascii_uppercase();
                Ok(SmtpCommandResult::Auth(mechanism))
            }
            "STARTTLS" => match self.state {
                SmtpState::Initial | SmtpState::Greeted => Ok(SmtpCommandResult::StartTls),
                _ => self.bad_sequence().await,
            },
            _ => {
                self.write_line("500 Command not recognized").await?;
                Ok(SmtpCommandResult::Continue)
            }
        }
    }

    /// Handles one line of DATA content: the terminator ends the
    /// transaction, and dot-stuffed lines have their leading dot
    /// removed per RFC 5321.
    fn process_data_line(&mut self, line: &str) -> SmtpCommandResult {
        if line == "." {
            self.state = SmtpState::Greeted;
            return SmtpCommandResult::DataEnd;
        }
        let content = line.strip_prefix('.').unwrap_or(line);
        SmtpCommandResult::DataLine(content.to_string())
    }

    /// Reads a single line from the client stream.
    ///
    /// Accepts CRLF or bare LF terminators and strips them. Returns
    /// `None` when the peer closed the connection.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buffer = String::new();
        let bytes_read = self.stream.read_line(&mut buffer).await?;

        if bytes_read == 0 {
            Ok(None)
        } else {
            let line = buffer.trim_end_matches(['\r', '\n']).to_string();
            debug!(%line, "smtp read");
            Ok(Some(line))
        }
    }

    /// Writes a single line (appending CRLF) and flushes it.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!(%line, "smtp write");
        self.stream.write_all(line.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Returns the current state of the conversation.
    pub fn state(&self) -> SmtpState {
        self.state
    }

    /// Marks the client as identified, used when an AUTH dialogue
    /// completes.
    pub fn mark_greeted(&mut self) {
        self.state = SmtpState::Greeted;
    }

    /// Consumes the handler and returns the underlying stream, e.g.
    /// to hand the socket to the TLS acceptor after STARTTLS.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    async fn bad_sequence(&mut self) -> Result<SmtpCommandResult> {
        self.write_line("503 Bad sequence of commands").await?;
        Ok(SmtpCommandResult::Continue)
    }
}

/// Extracts the address from a `MAIL FROM:<addr>` / `RCPT TO:<addr>`
/// line: the substring after the first `:`, stripped of surrounding
/// ASCII whitespace and angle brackets. The null reverse-path `<>`
/// yields an empty string. Returns `None` when no `:` is present.
fn extract_address(line: &str) -> Option<String> {
    let (_, raw) = line.split_once(':')?;

    // Bracketed form first; this ignores trailing ESMTP parameters
    // such as the SIZE declaration clients send after seeing it
    // advertised.
    if let (Some(start), Some(end)) = (raw.find('<'), raw.find('>')) {
        if start < end {
            return Some(raw[start + 1..end].trim().to_string());
        }
    }

    Some(
        raw.trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .trim()
            .to_string(),
    )
}

/// Represents the outcome of processing a single SMTP input line.
#[derive(Debug)]
pub enum SmtpCommandResult {
    /// Command handled in full, continue reading.
    Continue,
    /// QUIT received and acknowledged; close the connection.
    Quit,
    /// HELO/EHLO accepted; the envelope must be cleared.
    Helo,
    /// RSET acknowledged; the envelope must be cleared.
    Reset,
    /// MAIL accepted with the extracted reverse-path.
    MailFrom(String),
    /// RCPT accepted with the extracted forward-path.
    RcptTo(String),
    /// DATA acknowledged with 354; content lines follow.
    DataStart,
    /// One line of DATA content, dot-stuffing already reversed.
    DataLine(String),
    /// The `.` terminator; the session commits and writes the reply.
    DataEnd,
    /// AUTH requested with the (uppercased) mechanism token; the
    /// session owns the dialogue and all replies.
    Auth(String),
    /// STARTTLS requested in a valid state; the session checks
    /// availability and replies.
    StartTls,
}
