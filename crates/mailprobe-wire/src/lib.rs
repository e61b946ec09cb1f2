//! # mailprobe-wire
//!
//! Shared protocol engine for the mailprobe SMTP and POP3 diagnostic clients.
//!
//! ## Features
//!
//! - **Transport**: buffered line I/O over TCP, SOCKS5 or TLS, with an atomic
//!   STARTTLS/STLS upgrade that refuses pending plaintext
//! - **TLS analysis**: leaf certificate details, verification status, cipher
//!   strength, warnings and recommendations
//! - **Authentication**: PLAIN, LOGIN, CRAM-MD5, XOAUTH2 state machines, APOP
//!   digests and a mechanism selection policy
//! - **Resilience**: exponential-backoff retry with transient/fatal error
//!   classification and a shared token-bucket rate limiter
//! - **Observability**: `tracing` logs and an optional wire-trace hook with
//!   secrets redacted
//!
//! ## Modules
//!
//! - [`config`]: Connection configuration and builder
//! - [`transport`] / [`connection`]: Byte transport and line connection
//! - [`dial`]: Direct and proxied dialing
//! - [`tls`] / [`cert`]: TLS connector and certificate analysis
//! - [`capability`] / [`auth`]: Capability sets and authentication
//! - [`retry`] / [`ratelimit`]: Retry policy and rate limiter
//! - [`state`]: Session state machine
//! - [`audit`]: Diagnostics and outcome records

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod audit;
pub mod auth;
pub mod capability;
pub mod cert;
pub mod config;
pub mod connection;
pub mod dial;
mod error;
pub mod ratelimit;
pub mod retry;
pub mod sanitize;
pub mod state;
pub mod tls;
pub mod trace;
pub mod transport;

pub use audit::{Diagnostics, OutcomeRecord, OutcomeStatus, SessionFailure};
pub use auth::{Authenticator, Credentials, Mechanism};
pub use capability::CapabilitySet;
pub use cert::{CertificateAnalysis, CertificateInfo, CipherStrength, VerificationStatus};
pub use config::{Config, ConfigBuilder, Protocol, TlsMode, TlsOptions, TlsVersion};
pub use connection::Connection;
pub use error::{Error, Result, is_retryable_http_status, is_transient_message};
pub use ratelimit::RateLimiter;
pub use retry::RetryPolicy;
pub use state::SessionState;
pub use trace::{LogTracer, RecordingTracer, SharedTracer, TraceEvent, WireTracer};
pub use transport::{AsyncStream, BoxedStream, Transport};

/// Re-export of the cancellation token used by every blocking wait.
pub use tokio_util::sync::CancellationToken;
