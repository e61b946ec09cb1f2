//! POP3 session management.

mod client;

pub use client::Client;

use mailprobe_wire::dial::dial;
use mailprobe_wire::{
    BoxedStream, CancellationToken, Config, Connection, Credentials, Diagnostics, RateLimiter,
    Result, SessionFailure, SharedTracer, TlsMode,
};

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

/// Connects and runs the full negotiation: greeting, CAPA, STLS (in
/// STARTTLS mode) with a fresh CAPA, and login when credentials are given.
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
    let implicit = config.tls_mode == TlsMode::Implicit;
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
