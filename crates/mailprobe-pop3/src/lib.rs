//! # mailprobe-pop3
//!
//! POP3 diagnostic client implementing RFC 1939 (with RFC 2449 CAPA and
//! response codes, RFC 2595 STLS and RFC 5034 SASL) on top of the shared
//! `mailprobe-wire` engine.
//!
//! ## Features
//!
//! - **Session lifecycle**: greeting, CAPA, STLS with a mandatory fresh CAPA,
//!   login, maildrop inspection, QUIT
//! - **TLS**: implicit TLS (port 995) and STLS, with certificate analysis
//! - **Authentication**: APOP, USER/PASS, and SASL PLAIN, LOGIN, CRAM-MD5,
//!   XOAUTH2
//! - **Maildrop**: STAT, LIST, UIDL, RETR, TOP, DELE, RSET, NOOP
//! - **Safety**: every argument is stripped of CR/LF; PASS, APOP and AUTH
//!   payloads are redacted in traces and errors
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailprobe_pop3::establish;
//! use mailprobe_wire::{CancellationToken, Config, Credentials, Protocol, RateLimiter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::new(Protocol::Pop3, "pop.example.com");
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
//!     for info in client.message_infos().await? {
//!         println!("{} {} {:?}", info.number, info.size, info.uid);
//!     }
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`command`]: POP3 command builders
//! - [`connection`]: Session client, connect and establish helpers
//! - [`parser`]: Status line and multi-line block parser
//! - [`types`]: Responses, response codes and maildrop listings

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod connection;
pub mod parser;
pub mod types;

pub use connection::{Client, connect, establish};
pub use mailprobe_wire::{Error, Result};
pub use types::{MessageInfo, Response, ResponseCode, Stat, Status};
