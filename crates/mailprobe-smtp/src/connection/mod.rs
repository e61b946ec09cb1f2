//! SMTP session management.

mod client;

pub use client::{Client, MailOptions};

use mailprobe_wire::dial::dial;
use mailprobe_wire::{
    BoxedStream, CancellationToken, CapabilitySet, Config, Connection, Credentials, Diagnostics,
    Protocol, RateLimiter, Result, SessionFailure, SharedTracer,
};

/// Server identity and capabilities from the greeting and EHLO/HELO.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Server hostname from greeting.
    pub hostname: String,
    /// True if the server accepted EHLO, false after a HELO fallback.
    pub esmtp: bool,
    /// Advertised extensions.
    pub capabilities: CapabilitySet,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            esmtp: false,
            capabilities: CapabilitySet::empty(Protocol::Smtp),
        }
    }
}

impl ServerInfo {
    /// Checks if the server advertised an extension (case-insensitive).
    #[must_use]
    pub fn supports(&self, extension: &str) -> bool {
        self.capabilities.has(extension)
    }

    /// Checks if STARTTLS is supported.
    #[must_use]
    pub fn supports_starttls(&self) -> bool {
        self.capabilities.supports_starttls()
    }

    /// Returns the maximum message size, if advertised.
    #[must_use]
    pub fn max_message_size(&self) -> Option<u64> {
        self.capabilities.max_message_size()
    }

    /// Returns supported authentication mechanisms.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<String> {
        self.capabilities.auth_mechanisms()
    }
}

/// Dials the server described by `config`.
///
/// The greeting is not read yet; see [`Client::read_greeting`].
///
/// # Errors
///
/// Returns the dial error after the configured retries.
pub async fn connect(
    config: Config,
    limiter: RateLimiter,
    cancel: CancellationToken,
) -> Result<Client<BoxedStream>> {
    let transport = dial(&config, &limiter, &cancel).await?;
    let conn = Connection::new(transport, &config, limiter, cancel);
    Ok(Client::new(conn, config))
}

/// Connects and runs the full negotiation: greeting, EHLO, STARTTLS (in
/// STARTTLS mode) with a fresh EHLO, and authentication when credentials
/// are given.
///
/// # Errors
///
/// Returns the terminal error together with the banner, capabilities and
/// TLS outcome gathered before it. The connection is closed on failure.
pub async fn establish(
    config: Config,
    limiter: RateLimiter,
    cancel: CancellationToken,
    credentials: Option<&Credentials>,
    tracer: Option<SharedTracer>,
) -> std::result::Result<Client<BoxedStream>, SessionFailure> {
    let implicit = config.tls_mode == mailprobe_wire::TlsMode::Implicit;
    let mut client = match connect(config, limiter, cancel).await {
        Ok(client) => client,
        Err(error) => {
            let diagnostics = Diagnostics {
                tls_attempted: implicit,
                tls_outcome: implicit.then(|| format!("failed: {error}")),
                ..Diagnostics::default()
            };
            return Err(SessionFailure::new(error, diagnostics));
        }
    };
    client.set_tracer(tracer);

    match client.negotiate(credentials).await {
        Ok(()) => Ok(client),
        Err(error) => {
            let diagnostics = client.diagnostics().clone();
            client.close().await;
            Err(SessionFailure::new(error, diagnostics))
        }
    }
}
