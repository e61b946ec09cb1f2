//! POP3 command builder.
//!
//! Arguments go through the shared sanitizer; a user name or password with
//! embedded CR/LF still produces exactly one command line.

use mailprobe_wire::Mechanism;
use mailprobe_wire::connection::REDACTED;
use mailprobe_wire::sanitize::{command_line, sanitize};

/// POP3 command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// USER - Name the maildrop
    User {
        /// Mailbox name
        name: String,
    },
    /// PASS - Password for the named maildrop
    Pass {
        /// Password
        password: String,
    },
    /// APOP - Digest login
    Apop {
        /// Mailbox name
        name: String,
        /// Hex MD5 digest of timestamp and password
        digest: String,
    },
    /// AUTH - SASL login (RFC 5034)
    Auth {
        /// Authentication mechanism
        mechanism: Mechanism,
        /// Base64 initial response; empty is sent as `=`
        initial_response: Option<String>,
    },
    /// Base64 answer to a `+` continuation
    AuthResponse(String),
    /// `*` - Abort an authentication exchange
    AuthCancel,
    /// CAPA - List capabilities
    Capa,
    /// STLS - Upgrade to TLS
    Stls,
    /// STAT - Maildrop summary
    Stat,
    /// LIST - Scan listing of one or all messages
    List {
        /// Message number, or all messages
        msg: Option<u32>,
    },
    /// UIDL - Unique-id listing of one or all messages
    Uidl {
        /// Message number, or all messages
        msg: Option<u32>,
    },
    /// RETR - Retrieve a message
    Retr {
        /// Message number
        msg: u32,
    },
    /// DELE - Mark a message deleted
    Dele {
        /// Message number
        msg: u32,
    },
    /// TOP - Headers and the first lines of the body
    Top {
        /// Message number
        msg: u32,
        /// Number of body lines
        lines: u32,
    },
    /// NOOP - No operation
    Noop,
    /// RSET - Unmark deleted messages
    Rset,
    /// QUIT - Enter UPDATE state and close
    Quit,
}

impl Command {
    /// Command name used in error messages.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::User { .. } => "USER",
            Self::Pass { .. } => "PASS",
            Self::Apop { .. } => "APOP",
            Self::Auth { .. } | Self::AuthResponse(_) | Self::AuthCancel => "AUTH",
            Self::Capa => "CAPA",
            Self::Stls => "STLS",
            Self::Stat => "STAT",
            Self::List { .. } => "LIST",
            Self::Uidl { .. } => "UIDL",
            Self::Retr { .. } => "RETR",
            Self::Dele { .. } => "DELE",
            Self::Top { .. } => "TOP",
            Self::Noop => "NOOP",
            Self::Rset => "RSET",
            Self::Quit => "QUIT",
        }
    }

    /// Returns true if the serialized command carries credentials.
    #[must_use]
    pub const fn is_sensitive(&self) -> bool {
        matches!(
            self,
            Self::Pass { .. }
                | Self::Apop { .. }
                | Self::Auth {
                    initial_response: Some(_),
                    ..
                }
                | Self::AuthResponse(_)
        )
    }

    /// Returns true if a `+OK` answer is followed by a dot-terminated block.
    #[must_use]
    pub const fn is_multiline(&self) -> bool {
        matches!(
            self,
            Self::Capa
                | Self::List { msg: None }
                | Self::Uidl { msg: None }
                | Self::Retr { .. }
                | Self::Top { .. }
        )
    }

    /// Serializes the command to bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Self::User { name } => command_line("USER", &[name.as_str()]),
            Self::Pass { password } => command_line("PASS", &[password.as_str()]),
            Self::Apop { name, digest } => command_line("APOP", &[name.as_str(), digest.as_str()]),
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
            Self::AuthCancel => b"*\r\n".to_vec(),
            Self::List { msg } | Self::Uidl { msg } => {
                let arg = msg.map(|n| n.to_string()).unwrap_or_default();
                command_line(self.verb(), &[arg.as_str()])
            }
            Self::Retr { msg } | Self::Dele { msg } => {
                command_line(self.verb(), &[msg.to_string().as_str()])
            }
            Self::Top { msg, lines } => {
                command_line("TOP", &[msg.to_string().as_str(), lines.to_string().as_str()])
            }
            Self::Capa | Self::Stls | Self::Stat | Self::Noop | Self::Rset | Self::Quit => {
                command_line(self.verb(), &[])
            }
        }
    }

    /// Form shown in traces and logs, with secrets replaced.
    #[must_use]
    pub fn redacted(&self) -> String {
        match self {
            Self::Pass { .. } => format!("PASS {REDACTED}"),
            Self::Apop { name, .. } => format!("APOP {} {REDACTED}", sanitize(name)),
            Self::Auth {
                mechanism,
                initial_response: Some(_),
            } => format!("AUTH {mechanism} {REDACTED}"),
            Self::AuthResponse(_) => REDACTED.to_string(),
            _ => {
                let line = self.serialize();
                String::from_utf8_lossy(line.strip_suffix(b"\r\n").unwrap_or(&line)).into_owned()
            }
        }
    }
}
