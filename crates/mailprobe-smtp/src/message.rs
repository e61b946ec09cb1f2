//! Outgoing message construction and DATA encoding.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use mailprobe_wire::sanitize::sanitize;

use crate::types::{Address, Mailbox};

static MESSAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// An email message to send.
///
/// Bcc recipients are part of the envelope only and never appear in the
/// rendered headers.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Sender.
    pub from: Mailbox,
    /// Recipients.
    pub to: Vec<Mailbox>,
    /// CC recipients.
    pub cc: Vec<Mailbox>,
    /// BCC recipients.
    pub bcc: Vec<Mailbox>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body: String,
    /// Date header; the current time when unset.
    pub date: Option<DateTime<Utc>>,
    /// Message-ID header (without angle brackets); generated when unset.
    pub message_id: Option<String>,
    /// Additional headers in order.
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Creates a new outgoing message.
    #[must_use]
    pub fn new(from: Mailbox, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            from,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            body: body.into(),
            date: None,
            message_id: None,
            headers: Vec::new(),
        }
    }

    /// Adds a recipient.
    #[must_use]
    pub fn to(mut self, mailbox: Mailbox) -> Self {
        self.to.push(mailbox);
        self
    }

    /// Adds a CC recipient.
    #[must_use]
    pub fn cc(mut self, mailbox: Mailbox) -> Self {
        self.cc.push(mailbox);
        self
    }

    /// Adds a BCC recipient.
    #[must_use]
    pub fn bcc(mut self, mailbox: Mailbox) -> Self {
        self.bcc.push(mailbox);
        self
    }

    /// Sets the Date header.
    #[must_use]
    pub const fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Sets the Message-ID.
    #[must_use]
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Adds a custom header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns all envelope recipients (to, cc, bcc).
    #[must_use]
    pub fn recipients(&self) -> Vec<&Address> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(|mailbox| &mailbox.address)
            .collect()
    }

    /// Returns true if any part of the message needs 8-bit transport.
    #[must_use]
    pub fn is_8bit(&self) -> bool {
        !self.body.is_ascii()
            || !self.subject.is_ascii()
            || self.headers.iter().any(|(_, v)| !v.is_ascii())
    }

    /// Returns true if any address needs SMTPUTF8.
    #[must_use]
    pub fn needs_smtputf8(&self) -> bool {
        self.from.address.is_utf8() || self.recipients().iter().any(|a| a.is_utf8())
    }

    /// Renders the message as RFC 5322 text with CRLF line endings.
    ///
    /// Header values are stripped of CR/LF so user input cannot add headers.
    #[must_use]
    pub fn to_rfc5322(&self) -> String {
        use std::fmt::Write;

        let mut message = String::new();
        let date = self.date.unwrap_or_else(Utc::now);
        let id = self
            .message_id
            .clone()
            .unwrap_or_else(|| generate_message_id(&self.from.address, date));

        let _ = write!(message, "Date: {}\r\n", date.to_rfc2822());
        let _ = write!(message, "From: {}\r\n", self.from.to_header_value());

        if !self.to.is_empty() {
            let _ = write!(message, "To: {}\r\n", join(&self.to));
        }

        if !self.cc.is_empty() {
            let _ = write!(message, "Cc: {}\r\n", join(&self.cc));
        }

        let _ = write!(message, "Subject: {}\r\n", sanitize(&self.subject));
        let _ = write!(message, "Message-ID: <{}>\r\n", sanitize(id.trim_matches(['<', '>'])));

        for (name, value) in &self.headers {
            let name = sanitize(name);
            let name = name.trim_end_matches(':').trim();
            if name.is_empty() || name.eq_ignore_ascii_case("bcc") {
                continue;
            }
            let _ = write!(message, "{name}: {}\r\n", sanitize(value));
        }

        message.push_str("MIME-Version: 1.0\r\n");
        message.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        if self.is_8bit() {
            message.push_str("Content-Transfer-Encoding: 8bit\r\n");
        } else {
            message.push_str("Content-Transfer-Encoding: 7bit\r\n");
        }

        // Empty line between headers and body
        message.push_str("\r\n");
        message.push_str(&normalize_line_endings(&self.body));
        message
    }
}

fn join(mailboxes: &[Mailbox]) -> String {
    mailboxes
        .iter()
        .map(Mailbox::to_header_value)
        .collect::<Vec<_>>()
        .join(", ")
}

fn generate_message_id(from: &Address, date: DateTime<Utc>) -> String {
    let seq = MESSAGE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let domain = from.domain().unwrap_or("localhost");
    format!(
        "{}.{}.{seq}@{domain}",
        date.timestamp_millis(),
        std::process::id()
    )
}

fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 32);
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push_str("\r\n");
        }
        out.push_str(line.strip_suffix('\r').unwrap_or(line));
    }
    out
}

/// Encodes a message for the DATA phase.
///
/// Line endings are normalized to CRLF, lines starting with `.` are
/// dot-stuffed, and the `.` terminator line is appended.
#[must_use]
pub fn encode_data(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + message.len() / 32 + 5);
    let body = message.strip_suffix(b"\n").unwrap_or(message);
    let body = body.strip_suffix(b"\r").unwrap_or(body);

    if !message.is_empty() {
        for line in body.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
    }

    out.extend_from_slice(b".\r\n");
    out
}
