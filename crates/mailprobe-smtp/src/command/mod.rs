//! SMTP command builder.
//!
//! Every textual argument is passed through the shared sanitizer, so a
//! command built from input containing CR/LF is still one well-formed line.

use mailprobe_wire::Mechanism;
use mailprobe_wire::connection::REDACTED;
use mailprobe_wire::sanitize::{command_line, sanitize};

use crate::types::Address;

/// `BODY=` parameter of `MAIL FROM` (RFC 6152).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    /// `7BIT`
    SevenBit,
    /// `8BITMIME`
    EightBitMime,
}

impl BodyType {
    /// Returns the parameter value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SevenBit => "7BIT",
            Self::EightBitMime => "8BITMIME",
        }
    }
}

/// SMTP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HELO - Simple greeting
    Helo {
        /// Client hostname
        hostname: String,
    },
    /// EHLO - Extended greeting
    Ehlo {
        /// Client hostname
        hostname: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// AUTH - Begin authentication
    Auth {
        /// Authentication mechanism
        mechanism: Mechanism,
        /// Base64 initial response (SASL-IR); empty is sent as `=`
        initial_response: Option<String>,
    },
    /// Base64 answer to a `334` challenge
    AuthResponse(String),
    /// `*` - Abort an authentication exchange
    AuthCancel,
    /// MAIL FROM - Start mail transaction
    MailFrom {
        /// Sender address
        from: Address,
        /// BODY parameter
        body: Option<BodyType>,
        /// SIZE parameter
        size: Option<u64>,
        /// SMTPUTF8 parameter
        smtputf8: bool,
    },
    /// RCPT TO - Add recipient
    RcptTo {
        /// Recipient address
        to: Address,
    },
    /// DATA - Begin message data
    Data,
    /// RSET - Reset transaction
    Rset,
    /// VRFY - Verify address
    Vrfy {
        /// Address or user name to verify
        address: String,
    },
    /// EXPN - Expand mailing list
    Expn {
        /// List name
        list: String,
    },
    /// HELP - Ask for help text
    Help {
        /// Optional topic
        topic: Option<String>,
    },
    /// NOOP - No operation
    Noop,
    /// QUIT - Close connection
    Quit,
}

impl Command {
    /// Command name used in error messages.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Helo { .. } => "HELO",
            Self::Ehlo { .. } => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::Auth { .. } | Self::AuthResponse(_) | Self::AuthCancel => "AUTH",
            Self::MailFrom { .. } => "MAIL FROM",
            Self::RcptTo { .. } => "RCPT TO",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Vrfy { .. } => "VRFY",
            Self::Expn { .. } => "EXPN",
            Self::Help { .. } => "HELP",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
        }
    }

    /// Returns true if the serialized command carries credentials.
    #[must_use]
    pub const fn is_sensitive(&self) -> bool {
        matches!(
            self,
            Self::Auth {
                initial_response: Some(_),
                ..
            } | Self::AuthResponse(_)
        )
    }

    /// Serializes the command to bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Self::Helo { hostname } => command_line("HELO", &[hostname.as_str()]),
            Self::Ehlo { hostname } => command_line("EHLO", &[hostname.as_str()]),
            Self::StartTls => command_line("STARTTLS", &[]),
            Self::Auth {
                mechanism,
                initial_response,
            } => match initial_response.as_deref() {
                Some("") => command_line("AUTH", &[mechanism.as_str(), "="]),
                Some(resp) => command_line("AUTH", &[mechanism.as_str(), resp]),
                None => command_line("AUTH", &[mechanism.as_str()]),
            },
            Self::AuthResponse(resp) => {
                let mut line = sanitize(resp).into_owned().into_bytes();
                line.extend_from_slice(b"\r\n");
                line
            }
            Self::AuthCancel => command_line("*", &[]),
            Self::MailFrom {
                from,
                body,
                size,
                smtputf8,
            } => {
                let path = format!("FROM:<{}>", sanitize(from.as_str()));
                let size = size.map(|s| format!("SIZE={s}"));
                let body = body.map(|b| format!("BODY={}", b.as_str()));
                let utf8 = if *smtputf8 { "SMTPUTF8" } else { "" };
                command_line(
                    "MAIL",
                    &[
                        path.as_str(),
                        size.as_deref().unwrap_or_default(),
                        body.as_deref().unwrap_or_default(),
                        utf8,
                    ],
                )
            }
            Self::RcptTo { to } => {
                let path = format!("TO:<{}>", sanitize(to.as_str()));
                command_line("RCPT", &[path.as_str()])
            }
            Self::Data => command_line("DATA", &[]),
            Self::Rset => command_line("RSET", &[]),
            Self::Vrfy { address } => command_line("VRFY", &[address.as_str()]),
            Self::Expn { list } => command_line("EXPN", &[list.as_str()]),
            Self::Help { topic } => command_line("HELP", &[topic.as_deref().unwrap_or_default()]),
            Self::Noop => command_line("NOOP", &[]),
            Self::Quit => command_line("QUIT", &[]),
        }
    }

    /// Returns the line as it may appear in logs and traces.
    #[must_use]
    pub fn redacted(&self) -> String {
        match self {
            Self::Auth {
                mechanism,
                initial_response: Some(_),
            } => format!("AUTH {mechanism} {REDACTED}"),
            Self::AuthResponse(_) => REDACTED.to_string(),
            _ => {
                let line = self.serialize();
                String::from_utf8_lossy(&line).trim_end().to_string()
            }
        }
    }
}
