//! Provides basic parsing functionality to decompose a raw DATA payload
//! into its header block, subject, and body.

use crate::message::Header;
use tracing::debug;

/// The decomposed pieces of a DATA payload.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedEmail {
    /// Value of the first `Subject` header, or empty.
    pub subject: String,
    /// Every header in appearance order; duplicate keys yield one
    /// entry per occurrence.
    pub headers: Vec<Header>,
    /// Everything after the blank line terminating the header block,
    /// with its original line terminators.
    pub body: String,
}

/// A namespace struct for email parsing logic.
///
/// This parser is intentionally simple: it understands `Name: value`
/// header lines with whitespace-continuation folding, terminated by an
/// empty line. It does not handle MIME parts, encoded words, or
/// attachments.
pub struct EmailParser;

impl EmailParser {
    /// Parses raw email data into headers and body.
    ///
    /// Parsing never fails the transaction: when the payload does not
    /// look like an RFC 5322 message (malformed header line, a
    /// continuation with nothing to continue, or no blank-line
    /// separator), the entire payload becomes the body and the header
    /// list stays empty.
    pub fn parse(raw_data: &str) -> ParsedEmail {
        match Self::try_parse(raw_data) {
            Some(parsed) => parsed,
            None => {
                debug!("payload did not parse as a message, storing raw body");
                ParsedEmail {
                    subject: String::new(),
                    headers: Vec::new(),
                    body: raw_data.to_string(),
                }
            }
        }
    }

    fn try_parse(raw_data: &str) -> Option<ParsedEmail> {
        let mut headers: Vec<Header> = Vec::new();
        let mut body_offset = None;
        let mut offset = 0;

        // Walk line by line, keeping byte offsets so the body can be
        // taken verbatim from the original payload.
        for segment in raw_data.split_inclusive('\n') {
            offset += segment.len();
            let line = segment.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                body_offset = Some(offset);
                break;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                // Continuation line: fold into the previous value.
                let previous = headers.last_mut()?;
                previous.value.push(' ');
                previous.value.push_str(line.trim_start());
                continue;
            }

            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            headers.push(Header {
                key: key.to_string(),
                value: value.trim().to_string(),
            });
        }

        // A message without the header-terminating blank line is not
        // one we can split; let the caller fall back to the raw body.
        let body_offset = body_offset?;

        let subject = headers
            .iter()
            .find(|header| header.key.eq_ignore_ascii_case("subject"))
            .map(|header| header.value.clone())
            .unwrap_or_default();

        Some(ParsedEmail {
            subject,
            headers,
            body: raw_data[body_offset..].to_string(),
        })
    }
}
