//! # mailprobe-smtp
//!
//! SMTP diagnostic client implementing RFC 5321 on top of the shared
//! `mailprobe-wire` engine.
//!
//! ## Features
//!
//! - **Session lifecycle**: greeting, EHLO with HELO fallback, STARTTLS with
//!   a mandatory fresh EHLO, authentication, mail transactions, QUIT
//! - **TLS**: implicit TLS (port 465) and STARTTLS, with certificate analysis
//! - **Authentication**: PLAIN, LOGIN, CRAM-MD5, XOAUTH2
//! - **Extensions**: SIZE, 8BITMIME, SMTPUTF8, enhanced status codes
//! - **Safety**: every argument is stripped of CR/LF; AUTH payloads are
//!   redacted in traces and errors
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailprobe_smtp::connection::establish;
//! use mailprobe_smtp::{Mailbox, OutgoingMessage};
//! use mailprobe_wire::{CancellationToken, Config, Credentials, Protocol, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::new(Protocol::Smtp, "smtp.example.com");
//!     let creds = Credentials::new("user@example.com", "password");
//!     let mut client = establish(
//!         config,
//!         RateLimiter::disabled(),
//!         CancellationToken::new(),
//!         Some(&creds),
//!         None,
//!     )
//!     .await?;
//!
//!     let message = OutgoingMessage::new(Mailbox::new("user@example.com")?, "Test", "Hello")
//!         .to(Mailbox::new("recipient@example.com")?);
//!     client.send_mail(&message).await?;
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`command`]: SMTP command builders
//! - [`connection`]: Session client, connect and establish helpers
//! - [`message`]: Outgoing message builder and DATA encoding
//! - [`parser`]: Reply parser
//! - [`types`]: Core SMTP types (addresses, replies)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod connection;
pub mod message;
pub mod parser;
pub mod types;

pub use connection::{Client, MailOptions, ServerInfo, connect, establish};
pub use mailprobe_wire::{Error, Result};
pub use message::OutgoingMessage;
pub use types::{Address, EnhancedStatus, Mailbox, Reply, ReplyCode};

/// SMTP protocol version supported.
pub const SMTP_VERSION: &str = "SMTP/ESMTP (RFC 5321)";
