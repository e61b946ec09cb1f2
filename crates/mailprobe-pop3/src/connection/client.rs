//! POP3 client session.
//!
//! One [`Client`] drives one connection through the session lifecycle:
//!
//! ```text
//! Disconnected -> Connected (+OK greeting) -> CapabilitiesKnown (CAPA)
//!     -> [STLS, CAPA again -> SecureCapabilitiesKnown]
//!     -> Authenticated (APOP, USER/PASS or AUTH)
//!     -> Operating (STAT/LIST/UIDL/RETR/TOP/DELE) -> Closed
//! ```
//!
//! Commands are strictly sequential; every call sends one command and reads
//! its complete response, including any dot-terminated block, before
//! returning.

use std::collections::HashMap;

use mailprobe_wire::auth::{self, Authenticator, choose_mechanism};
use mailprobe_wire::tls::create_tls_connector;
use mailprobe_wire::{
    AsyncStream, CapabilitySet, CertificateAnalysis, Config, Connection, Credentials, Diagnostics,
    Error, Mechanism, Protocol, Result, SessionState, SharedTracer, TlsMode,
};

use crate::command::Command;
use crate::parser::{BlockAccumulator, parse_status_line};
use crate::types::{
    MessageInfo, Response, ResponseCode, Stat, Status, parse_list_line, parse_uidl_line,
};

/// Upper bound on `+` round trips in one AUTH exchange.
const MAX_AUTH_STEPS: usize = 8;

/// POP3 client session over any byte stream.
pub struct Client<S> {
    conn: Connection<S>,
    config: Config,
    state: SessionState,
    capabilities: CapabilitySet,
    greeting: Option<Response>,
    apop_timestamp: Option<String>,
    diagnostics: Diagnostics,
}

impl<S> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.state)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl<S: AsyncStream> Client<S> {
    /// Wraps an open connection. The greeting has not been read yet.
    #[must_use]
    pub fn new(conn: Connection<S>, config: Config) -> Self {
        let mut diagnostics = Diagnostics::default();
        if let Some(analysis) = conn.tls_analysis() {
            diagnostics.tls_attempted = true;
            diagnostics.tls_outcome = Some(format!(
                "implicit TLS established ({})",
                analysis.protocol_version
            ));
            diagnostics.tls = Some(analysis.clone());
        }

        Self {
            conn,
            config,
            state: SessionState::Disconnected,
            capabilities: CapabilitySet::empty(Protocol::Pop3),
            greeting: None,
            apop_timestamp: None,
            diagnostics,
        }
    }

    /// Installs or removes the wire tracer.
    pub fn set_tracer(&mut self, tracer: Option<SharedTracer>) {
        self.conn.set_tracer(tracer);
    }

    /// Current session state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Current capability set. Empty until CAPA succeeded.
    #[must_use]
    pub const fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Greeting response, once read.
    #[must_use]
    pub const fn greeting(&self) -> Option<&Response> {
        self.greeting.as_ref()
    }

    /// APOP timestamp from the greeting, brackets included.
    #[must_use]
    pub fn apop_timestamp(&self) -> Option<&str> {
        self.apop_timestamp.as_deref()
    }

    /// Diagnostics gathered so far.
    #[must_use]
    pub const fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// TLS analysis of the current connection, if encrypted.
    #[must_use]
    pub const fn tls_analysis(&self) -> Option<&CertificateAnalysis> {
        self.conn.tls_analysis()
    }

    /// Returns true if the connection is encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.conn.is_tls()
    }

    /// Reads the server greeting and remembers its APOP timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rejected`] for a `-ERR` greeting, [`Error::Parse`]
    /// for anything that is not a status line, or the read error.
    pub async fn read_greeting(&mut self) -> Result<&Response> {
        if self.state != SessionState::Disconnected {
            return Err(Error::InvalidState(format!(
                "greeting already read (state: {})",
                self.state
            )));
        }

        let line = self.conn.read_line().await?;
        self.diagnostics.banner = Some(line.clone());
        let response = parse_status_line(line)?.expect_ok("greeting")?;

        self.apop_timestamp = auth::apop_timestamp(&response.message).map(str::to_string);
        tracing::debug!(
            host = %self.config.host,
            apop = self.apop_timestamp.is_some(),
            tls = self.conn.is_tls(),
            "POP3 greeting received"
        );

        self.state.advance(SessionState::Connected)?;
        Ok(self.greeting.insert(response))
    }

    /// Sends CAPA and records the advertised capabilities.
    ///
    /// A server that answers `-ERR` predates RFC 2449; its capability set is
    /// empty and only `USER`/`PASS` (and APOP) remain available.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] before the greeting, or the read error.
    pub async fn capa(&mut self) -> Result<&CapabilitySet> {
        if self.state != SessionState::Connected {
            return Err(Error::InvalidState(format!(
                "CAPA requires a fresh connection (state: {})",
                self.state
            )));
        }
        self.fetch_capabilities().await?;
        Ok(&self.capabilities)
    }

    async fn fetch_capabilities(&mut self) -> Result<()> {
        let response = self.command(&Command::Capa).await?;
        let capabilities = if response.is_ok() {
            CapabilitySet::parse(Protocol::Pop3, &response.data)
        } else {
            tracing::debug!(message = %response.message, "CAPA not supported");
            CapabilitySet::empty(Protocol::Pop3)
        };

        if let Some(delay) = capabilities.login_delay() {
            tracing::debug!(seconds = delay, "server enforces LOGIN-DELAY");
        }
        self.diagnostics.capabilities = capabilities.lines().to_vec();
        self.capabilities = capabilities;

        let next = if self.conn.is_tls() {
            SessionState::SecureCapabilitiesKnown
        } else {
            SessionState::CapabilitiesKnown
        };
        self.state.advance(next)
    }

    /// Upgrades the connection with STLS and repeats CAPA.
    ///
    /// The plaintext capabilities are discarded before the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] if STLS is not advertised,
    /// [`Error::TlsUpgrade`] if the server does not answer `+OK` or the
    /// handshake fails. A failed handshake leaves the session closed.
    pub async fn stls(&mut self) -> Result<&CertificateAnalysis> {
        if self.state != SessionState::CapabilitiesKnown || self.conn.is_tls() {
            return Err(Error::InvalidState(format!(
                "STLS requires a plaintext session after CAPA (state: {})",
                self.state
            )));
        }
        if !self.capabilities.supports_starttls() {
            return Err(Error::NotSupported("server does not advertise STLS".into()));
        }

        let connector = create_tls_connector(&self.config.tls)?;
        self.diagnostics.tls_attempted = true;

        let response = self.command(&Command::Stls).await?;
        if !response.is_ok() {
            let error = Error::TlsUpgrade(format!(
                "STLS rejected: {} {}",
                response.status, response.message
            ));
            self.diagnostics.tls_outcome = Some(error.to_string());
            return Err(error);
        }

        self.capabilities = CapabilitySet::empty(Protocol::Pop3);
        self.diagnostics.capabilities.clear();

        let analysis = match self.conn.upgrade(&connector).await {
            Ok(analysis) => analysis.clone(),
            Err(error) => {
                self.diagnostics.tls_outcome = Some(format!("handshake failed: {error}"));
                self.state = SessionState::Closed;
                return Err(error);
            }
        };
        self.diagnostics.tls_outcome = Some(format!(
            "STLS established ({}, {})",
            analysis.protocol_version,
            analysis.status.as_str()
        ));
        self.diagnostics.tls = Some(analysis);

        self.fetch_capabilities().await?;
        self.conn
            .tls_analysis()
            .ok_or_else(|| Error::TlsUpgrade("no TLS session after upgrade".into()))
    }

    /// Logs in with the configured or best available mechanism.
    ///
    /// Without an override the order is XOAUTH2 (with a token), PLAIN,
    /// LOGIN, then `USER`/`PASS`. APOP and CRAM-MD5 are used only when
    /// requested; APOP additionally needs a greeting timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCompatibleMechanism`] if the override is not
    /// available, [`Error::Auth`] carrying the server's (redacted) text, or a
    /// retryable [`Error::Rejected`] for `[IN-USE]`/`[SYS/TEMP]`.
    pub async fn authenticate(&mut self, credentials: &Credentials) -> Result<Mechanism> {
        self.state.require_capabilities("AUTH")?;
        if self.state.is_authenticated() {
            return Err(Error::InvalidState("already authenticated".into()));
        }

        let mechanism = self.choose_mechanism(credentials)?;
        self.diagnostics.mechanism = Some(mechanism);
        tracing::debug!(
            host = %self.config.host,
            mechanism = %mechanism,
            user = %credentials.masked_username(),
            "authenticating"
        );

        let login = match mechanism {
            Mechanism::Apop => self.login_apop(credentials).await,
            Mechanism::User => self.login_user(credentials).await,
            sasl => self.login_sasl(sasl, credentials).await,
        };
        login.map_err(|error| credentials.redact_error(error))?;

        self.state.advance(SessionState::Authenticated)?;
        tracing::info!(host = %self.config.host, mechanism = %mechanism, "authenticated");
        Ok(mechanism)
    }

    fn choose_mechanism(&self, credentials: &Credentials) -> Result<Mechanism> {
        let requested = self
            .config
            .auth_method
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty());

        if requested.and_then(Mechanism::parse) == Some(Mechanism::Apop) {
            return if self.apop_timestamp.is_some() {
                Ok(Mechanism::Apop)
            } else {
                Err(Error::Auth("APOP requires a timestamp in the server greeting".into()))
            };
        }
        choose_mechanism(&self.capabilities, credentials.has_token(), requested)
    }

    async fn login_apop(&mut self, credentials: &Credentials) -> Result<()> {
        let timestamp = self
            .apop_timestamp
            .clone()
            .ok_or_else(|| Error::Auth("APOP requires a timestamp in the server greeting".into()))?;
        let digest = auth::apop_digest(&timestamp, credentials.password_for(Mechanism::Apop)?);

        let response = self
            .command(&Command::Apop {
                name: credentials.username().to_string(),
                digest,
            })
            .await?;
        check_login(Mechanism::Apop, "APOP", credentials, &response)
    }

    async fn login_user(&mut self, credentials: &Credentials) -> Result<()> {
        let password = credentials.password_for(Mechanism::User)?.to_string();

        let response = self
            .command(&Command::User {
                name: credentials.username().to_string(),
            })
            .await?;
        check_login(Mechanism::User, "USER", credentials, &response)?;

        let response = self.command(&Command::Pass { password }).await?;
        check_login(Mechanism::User, "PASS", credentials, &response)
    }

    async fn login_sasl(&mut self, mechanism: Mechanism, credentials: &Credentials) -> Result<()> {
        let mut exchange = Authenticator::new(mechanism, credentials)?;
        let initial = exchange.initial_response().map(|r| auth::encode(&r));
        let mut response = self
            .command(&Command::Auth {
                mechanism,
                initial_response: initial,
            })
            .await?;

        for _ in 0..MAX_AUTH_STEPS {
            match response.status {
                Status::Ok => return Ok(()),
                Status::Continue => {
                    let answer = auth::decode(&response.message).and_then(|c| exchange.respond(&c));
                    match answer {
                        Ok(answer) => {
                            response = self
                                .command(&Command::AuthResponse(auth::encode(&answer)))
                                .await?;
                        }
                        Err(error) => {
                            self.cancel_auth().await;
                            return Err(error);
                        }
                    }
                }
                Status::Err if is_transient(&response) => {
                    return Err(redacted_rejection("AUTH", credentials, &response));
                }
                Status::Err => return Err(exchange.failure(credentials, &response.message)),
            }
        }

        self.cancel_auth().await;
        Err(Error::Auth(format!("{mechanism} exchange did not complete")))
    }

    async fn cancel_auth(&mut self) {
        if let Err(err) = self.command(&Command::AuthCancel).await {
            tracing::debug!(error = %err, "AUTH cancel failed");
        }
    }

    /// Runs greeting, CAPA, STLS (in STARTTLS mode) and, with credentials,
    /// authentication.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error. In STARTTLS mode a server
    /// that does not advertise STLS is a [`Error::TlsUpgrade`] failure.
    pub async fn negotiate(&mut self, credentials: Option<&Credentials>) -> Result<()> {
        self.read_greeting().await?;
        self.capa().await?;

        if self.config.tls_mode == TlsMode::StartTls && !self.conn.is_tls() {
            if !self.capabilities.supports_starttls() {
                let error = Error::TlsUpgrade("server does not advertise STLS".into());
                self.diagnostics.tls_attempted = true;
                self.diagnostics.tls_outcome = Some(error.to_string());
                return Err(error);
            }
            self.stls().await?;
        }

        if let Some(credentials) = credentials {
            self.authenticate(credentials).await?;
        }
        Ok(())
    }

    /// Returns the message count and total maildrop size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] before login, the server's rejection,
    /// or [`Error::Parse`] for a malformed answer.
    pub async fn stat(&mut self) -> Result<Stat> {
        let response = self.transact(Command::Stat).await?;
        Stat::parse(&response.message)
    }

    /// Lists the number and size of every message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] before login, the server's rejection,
    /// or [`Error::Parse`] for a malformed scan line.
    pub async fn list(&mut self) -> Result<Vec<MessageInfo>> {
        let response = self.transact(Command::List { msg: None }).await?;
        response.data.iter().map(|line| parse_list_line(line)).collect()
    }

    /// Returns the scan line of one message.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection (e.g. no such message) or
    /// [`Error::Parse`].
    pub async fn list_one(&mut self, msg: u32) -> Result<MessageInfo> {
        let response = self.transact(Command::List { msg: Some(msg) }).await?;
        parse_list_line(&response.message)
    }

    /// Lists the unique-id of every message.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection or [`Error::Parse`].
    pub async fn uidl(&mut self) -> Result<Vec<(u32, String)>> {
        let response = self.transact(Command::Uidl { msg: None }).await?;
        response.data.iter().map(|line| parse_uidl_line(line)).collect()
    }

    /// Returns the unique-id of one message.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection or [`Error::Parse`].
    pub async fn uidl_one(&mut self, msg: u32) -> Result<String> {
        let response = self.transact(Command::Uidl { msg: Some(msg) }).await?;
        parse_uidl_line(&response.message).map(|(_, uid)| uid)
    }

    /// Lists every message with its size and, where UIDL is available, its
    /// unique-id.
    ///
    /// # Errors
    ///
    /// Returns the LIST error, or a UIDL error other than a rejection.
    pub async fn message_infos(&mut self) -> Result<Vec<MessageInfo>> {
        let mut infos = self.list().await?;

        // Without CAPA we cannot tell; UIDL is optional, so just try it.
        if !self.capabilities.is_empty() && !self.capabilities.supports_uidl() {
            return Ok(infos);
        }
        match self.uidl().await {
            Ok(uids) => {
                let mut uids: HashMap<u32, String> = uids.into_iter().collect();
                for info in &mut infos {
                    info.uid = uids.remove(&info.number);
                }
            }
            Err(Error::Rejected { message, .. }) => {
                tracing::debug!(%message, "UIDL rejected, listing without unique-ids");
            }
            Err(err) => return Err(err),
        }
        Ok(infos)
    }

    /// Retrieves a whole message, un-stuffed, with CRLF line endings.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection or the read error.
    pub async fn retr(&mut self, msg: u32) -> Result<String> {
        let response = self.transact(Command::Retr { msg }).await?;
        Ok(join_block(&response.data))
    }

    /// Retrieves the headers and the first `lines` body lines of a message.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection or the read error.
    pub async fn top(&mut self, msg: u32, lines: u32) -> Result<String> {
        let response = self.transact(Command::Top { msg, lines }).await?;
        Ok(join_block(&response.data))
    }

    /// Marks a message for deletion at QUIT.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection.
    pub async fn dele(&mut self, msg: u32) -> Result<Response> {
        self.transact(Command::Dele { msg }).await
    }

    /// Sends NOOP.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection.
    pub async fn noop(&mut self) -> Result<Response> {
        self.transact(Command::Noop).await
    }

    /// Unmarks every message marked for deletion.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection.
    pub async fn rset(&mut self) -> Result<Response> {
        self.transact(Command::Rset).await
    }

    async fn transact(&mut self, cmd: Command) -> Result<Response> {
        self.state.require_authenticated(cmd.verb())?;
        let response = self.command(&cmd).await?;
        self.state.advance(SessionState::Operating)?;
        response.expect_ok(cmd.verb())
    }

    /// Sends QUIT within the close timeout and closes the transport.
    ///
    /// Idempotent. QUIT failures are logged, never returned.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            self.conn.close().await;
            return;
        }

        if !self.conn.is_closed() && self.state != SessionState::Disconnected {
            let timeout = self.config.close_timeout;
            match tokio::time::timeout(timeout, self.quit()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(host = %self.config.host, error = %err, "QUIT failed");
                }
                Err(_) => {
                    tracing::warn!(host = %self.config.host, ?timeout, "QUIT timed out");
                }
            }
        }

        self.conn.close().await;
        self.state = SessionState::Closed;
    }

    async fn quit(&mut self) -> Result<()> {
        self.command(&Command::Quit).await?.expect_ok("QUIT")?;
        Ok(())
    }

    async fn command(&mut self, cmd: &Command) -> Result<Response> {
        let line = cmd.serialize();
        if cmd.is_sensitive() {
            self.conn.send_redacted(&line, &cmd.redacted()).await?;
        } else {
            self.conn.send(&line).await?;
        }
        tracing::trace!(command = %cmd.redacted(), "sent");

        let response = self.read_response(cmd.is_multiline()).await?;
        let in_auth = matches!(
            cmd,
            Command::Auth { .. } | Command::AuthResponse(_) | Command::AuthCancel
        );
        if response.status == Status::Continue && !in_auth {
            return Err(Error::Parse(format!(
                "continuation in answer to {}",
                cmd.verb()
            )));
        }
        tracing::debug!(command = cmd.verb(), status = %response.status, "response");
        Ok(response)
    }

    async fn read_response(&mut self, multiline: bool) -> Result<Response> {
        let response = parse_status_line(self.conn.read_line().await?)?;
        if !(multiline && response.is_ok()) {
            return Ok(response);
        }

        let mut block = BlockAccumulator::new();
        loop {
            let line = self.conn.read_line().await?;
            if block.push(line) {
                return Ok(block.finish(response));
            }
        }
    }
}

fn is_transient(response: &Response) -> bool {
    response.code.as_ref().is_some_and(ResponseCode::is_transient)
}

fn check_login(
    mechanism: Mechanism,
    command: &str,
    credentials: &Credentials,
    response: &Response,
) -> Result<()> {
    if response.is_ok() {
        return Ok(());
    }
    if is_transient(response) {
        return Err(redacted_rejection(command, credentials, response));
    }
    let text = credentials.redact(&response.message);
    Err(match &response.code {
        Some(code) => Error::Auth(format!("{mechanism} rejected: [{code}] {text}")),
        None => Error::Auth(format!("{mechanism} rejected: {text}")),
    })
}

fn redacted_rejection(command: &str, credentials: &Credentials, response: &Response) -> Error {
    let mut response = response.clone();
    response.message = credentials.redact(&response.message);
    response.rejection(command)
}

fn join_block(lines: &[String]) -> String {
    let mut text = String::with_capacity(lines.iter().map(|l| l.len() + 2).sum());
    for line in lines {
        text.push_str(line);
        text.push_str("\r\n");
    }
    text
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use mailprobe_wire::{CancellationToken, RateLimiter, RecordingTracer, Transport};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::io::{Builder, Mock};

    fn builder() -> mailprobe_wire::ConfigBuilder {
        Config::builder(Protocol::Pop3, "pop.example.com").tls_mode(TlsMode::None)
    }

    fn client_with(mock: Mock, config: Config) -> Client<Mock> {
        let conn = Connection::new(
            Transport::plain(mock, 1024),
            &config,
            RateLimiter::disabled(),
            CancellationToken::new(),
        );
        Client::new(conn, config)
    }

    fn client(mock: Mock) -> Client<Mock> {
        client_with(mock, builder().build())
    }

    const GREETING: &[u8] = b"+OK POP3 server ready <1896.697170952@dbc.mtview.ca.us>\r\n";
    const CAPA: &[u8] = b"+OK Capability list follows\r\nTOP\r\nUIDL\r\nUSER\r\nRESP-CODES\r\nSASL PLAIN LOGIN CRAM-MD5 XOAUTH2\r\nIMPLEMENTATION Shlemazle-Plotz-v302\r\n.\r\n";

    fn ready_mock() -> Builder {
        let mut builder = Builder::new();
        builder.read(GREETING).write(b"CAPA\r\n").read(CAPA);
        builder
    }

    async fn ready(mock: Mock, config: Config) -> Client<Mock> {
        let mut client = client_with(mock, config);
        client.read_greeting().await.unwrap();
        client.capa().await.unwrap();
        client
    }

    fn logged_in_mock() -> Builder {
        let mut builder = Builder::new();
        builder
            .read(GREETING)
            .write(b"CAPA\r\n")
            .read(b"+OK\r\nUSER\r\nUIDL\r\n.\r\n")
            .write(b"USER alice\r\n")
            .read(b"+OK\r\n")
            .write(b"PASS s3cret\r\n")
            .read(b"+OK maildrop locked and ready\r\n");
        builder
    }

    async fn logged_in(mock: Mock) -> Client<Mock> {
        let mut client = ready(mock, builder().build()).await;
        client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn greeting_and_capa() {
        let mut client = client(ready_mock().build());

        let greeting = client.read_greeting().await.unwrap();
        assert!(greeting.is_ok());
        assert_eq!(
            client.apop_timestamp(),
            Some("<1896.697170952@dbc.mtview.ca.us>")
        );
        assert_eq!(client.state(), SessionState::Connected);

        let caps = client.capa().await.unwrap();
        assert!(caps.supports_top());
        assert!(caps.supports_uidl());
        assert!(caps.supports_resp_codes());
        assert_eq!(caps.implementation().as_deref(), Some("Shlemazle-Plotz-v302"));
        assert_eq!(caps.auth_mechanisms(), vec!["PLAIN", "LOGIN", "CRAM-MD5", "XOAUTH2"]);
        assert_eq!(client.state(), SessionState::CapabilitiesKnown);
        assert_eq!(client.diagnostics().capabilities.len(), 6);
    }

    #[tokio::test]
    async fn capa_unsupported_leaves_empty_set() {
        let mock = Builder::new()
            .read(b"+OK ready\r\n")
            .write(b"CAPA\r\n")
            .read(b"-ERR unknown command\r\n")
            .build();
        let mut client = client(mock);
        client.read_greeting().await.unwrap();
        assert!(client.apop_timestamp().is_none());
        assert!(client.capa().await.unwrap().is_empty());
        assert_eq!(client.state(), SessionState::CapabilitiesKnown);
    }

    #[tokio::test]
    async fn err_greeting_is_rejected() {
        let mock = Builder::new().read(b"-ERR [SYS/TEMP] try later\r\n").build();
        let mut client = client(mock);
        let err = client.read_greeting().await.unwrap_err();
        assert!(matches!(err, Error::Rejected { .. }));
        assert!(err.is_retryable());
        assert_eq!(
            client.diagnostics().banner.as_deref(),
            Some("-ERR [SYS/TEMP] try later")
        );
    }

    #[tokio::test]
    async fn garbage_greeting_is_a_parse_error() {
        let mock = Builder::new().read(b"220 smtp.example.com ESMTP\r\n").build();
        let mut client = client(mock);
        assert!(matches!(client.read_greeting().await, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn user_pass_is_redacted_in_trace() {
        let tracer = Arc::new(RecordingTracer::new());
        let mock = Builder::new()
            .read(b"+OK ready\r\n")
            .write(b"CAPA\r\n")
            .read(b"+OK\r\nUSER\r\n.\r\n")
            .write(b"USER alice\r\n")
            .read(b"+OK\r\n")
            .write(b"PASS s3cret\r\n")
            .read(b"+OK logged in\r\n")
            .build();
        let mut client = ready(mock, builder().build()).await;
        client.set_tracer(Some(tracer.clone()));

        let mechanism = client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap();
        assert_eq!(mechanism, Mechanism::User);
        assert_eq!(client.state(), SessionState::Authenticated);
        assert_eq!(tracer.writes(), vec!["USER alice", "PASS [redacted]"]);
    }

    #[tokio::test]
    async fn apop_login() {
        // RFC 1939 example: timestamp + "tanstaaf".
        let mock = ready_mock()
            .write(b"APOP mrose c4c9334bac560ecc979e58001b3e22fb\r\n")
            .read(b"+OK mrose's maildrop has 2 messages (320 octets)\r\n")
            .build();
        let mut client = ready(mock, builder().auth_method("apop").build()).await;
        let mechanism = client
            .authenticate(&Credentials::new("mrose", "tanstaaf"))
            .await
            .unwrap();
        assert_eq!(mechanism, Mechanism::Apop);
    }

    #[tokio::test]
    async fn apop_without_timestamp_is_refused() {
        let mock = Builder::new()
            .read(b"+OK ready\r\n")
            .write(b"CAPA\r\n")
            .read(b"+OK\r\nUSER\r\n.\r\n")
            .build();
        let mut client = ready(mock, builder().auth_method("APOP").build()).await;
        let err = client
            .authenticate(&Credentials::new("mrose", "tanstaaf"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(err.to_string().contains("timestamp"));
    }

    #[tokio::test]
    async fn sasl_plain_with_initial_response() {
        // "\0alice\0s3cret"
        let mock = ready_mock()
            .write(b"AUTH PLAIN AGFsaWNlAHMzY3JldA==\r\n")
            .read(b"+OK authenticated\r\n")
            .build();
        let mut client = ready(mock, builder().build()).await;
        let mechanism = client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap();
        assert_eq!(mechanism, Mechanism::Plain);
        assert_eq!(client.diagnostics().mechanism, Some(Mechanism::Plain));
    }

    #[tokio::test]
    async fn sasl_plain_echo_is_redacted() {
        let mock = ready_mock()
            .write(b"AUTH PLAIN AGFsaWNlAHMzY3JldA==\r\n")
            .read(b"-ERR [AUTH] bad AGFsaWNlAHMzY3JldA==\r\n")
            .build();
        let mut client = ready(mock, builder().build()).await;
        let err = client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(!err.to_string().contains("AGFsaWNlAHMzY3JldA=="), "{err}");
    }

    #[tokio::test]
    async fn malformed_echo_during_auth_is_redacted() {
        let mock = ready_mock()
            .write(b"AUTH PLAIN AGFsaWNlAHMzY3JldA==\r\n")
            .read(b"AGFsaWNlAHMzY3JldA==\r\n")
            .build();
        let mut client = ready(mock, builder().build()).await;
        let err = client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "{err}");
        assert!(!err.to_string().contains("AGFsaWNlAHMzY3JldA=="), "{err}");
    }

    #[tokio::test]
    async fn sasl_login_continuations() {
        let mock = ready_mock()
            .write(b"AUTH LOGIN\r\n")
            .read(b"+ VXNlcm5hbWU6\r\n")
            .write(b"YWxpY2U=\r\n")
            .read(b"+ UGFzc3dvcmQ6\r\n")
            .write(b"czNjcmV0\r\n")
            .read(b"+OK\r\n")
            .build();
        let mut client = ready(mock, builder().auth_method("LOGIN").build()).await;
        client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn locked_maildrop_is_retryable_and_redacted() {
        let mock = Builder::new()
            .read(b"+OK ready\r\n")
            .write(b"CAPA\r\n")
            .read(b"+OK\r\nUSER\r\nRESP-CODES\r\n.\r\n")
            .write(b"USER alice\r\n")
            .read(b"+OK\r\n")
            .write(b"PASS s3cret\r\n")
            .read(b"-ERR [IN-USE] s3cret: maildrop already locked\r\n")
            .build();
        let mut client = ready(mock, builder().build()).await;
        let err = client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let text = err.to_string();
        assert!(text.contains("IN-USE"), "{text}");
        assert!(!text.contains("s3cret"), "{text}");
    }

    #[tokio::test]
    async fn bad_password_is_an_auth_error() {
        let mock = Builder::new()
            .read(b"+OK ready\r\n")
            .write(b"CAPA\r\n")
            .read(b"+OK\r\nUSER\r\n.\r\n")
            .write(b"USER alice\r\n")
            .read(b"+OK\r\n")
            .write(b"PASS wrong\r\n")
            .read(b"-ERR [AUTH] invalid password\r\n")
            .build();
        let mut client = ready(mock, builder().build()).await;
        let err = client
            .authenticate(&Credentials::new("alice", "wrong"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("[AUTH] invalid password"));
    }

    #[tokio::test]
    async fn unadvertised_sasl_override_is_rejected_locally() {
        let mock = Builder::new()
            .read(b"+OK ready\r\n")
            .write(b"CAPA\r\n")
            .read(b"+OK\r\nUSER\r\n.\r\n")
            .build();
        let mut client = ready(mock, builder().auth_method("CRAM-MD5").build()).await;
        let err = client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoCompatibleMechanism(_)));
    }

    #[tokio::test]
    async fn maildrop_operations() {
        let mock = logged_in_mock()
            .write(b"STAT\r\n")
            .read(b"+OK 2 320\r\n")
            .write(b"LIST\r\n")
            .read(b"+OK 2 messages\r\n1 120\r\n2 200\r\n.\r\n")
            .write(b"LIST 2\r\n")
            .read(b"+OK 2 200\r\n")
            .write(b"UIDL 1\r\n")
            .read(b"+OK 1 whqtswO00WBw418f9t5JxYwZ\r\n")
            .write(b"RETR 1\r\n")
            .read(b"+OK 120 octets\r\nSubject: hi\r\n\r\n..signature\r\n.\r\n")
            .write(b"TOP 2 0\r\n")
            .read(b"+OK\r\nSubject: second\r\n\r\n.\r\n")
            .write(b"DELE 1\r\n")
            .read(b"+OK message 1 deleted\r\n")
            .write(b"RSET\r\n")
            .read(b"+OK\r\n")
            .write(b"NOOP\r\n")
            .read(b"+OK\r\n")
            .build();
        let mut client = logged_in(mock).await;

        assert_eq!(client.stat().await.unwrap(), Stat { count: 2, size: 320 });
        assert_eq!(client.state(), SessionState::Operating);

        let list = client.list().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!((list[1].number, list[1].size), (2, 200));

        assert_eq!(client.list_one(2).await.unwrap().size, 200);
        assert_eq!(client.uidl_one(1).await.unwrap(), "whqtswO00WBw418f9t5JxYwZ");
        assert_eq!(
            client.retr(1).await.unwrap(),
            "Subject: hi\r\n\r\nsignature\r\n"
        );
        assert_eq!(client.top(2, 0).await.unwrap(), "Subject: second\r\n\r\n");
        client.dele(1).await.unwrap();
        client.rset().await.unwrap();
        client.noop().await.unwrap();
    }

    #[tokio::test]
    async fn message_infos_merges_uidl() {
        let mock = logged_in_mock()
            .write(b"LIST\r\n")
            .read(b"+OK\r\n1 120\r\n2 200\r\n.\r\n")
            .write(b"UIDL\r\n")
            .read(b"+OK\r\n1 aaa\r\n2 bbb\r\n.\r\n")
            .build();
        let mut client = logged_in(mock).await;
        let infos = client.message_infos().await.unwrap();
        assert_eq!(infos[0].uid.as_deref(), Some("aaa"));
        assert_eq!(infos[1].uid.as_deref(), Some("bbb"));
    }

    #[tokio::test]
    async fn missing_message_is_rejected() {
        let mock = logged_in_mock()
            .write(b"RETR 9\r\n")
            .read(b"-ERR no such message\r\n")
            .build();
        let mut client = logged_in(mock).await;
        let err = client.retr(9).await.unwrap_err();
        assert!(matches!(err, Error::Rejected { ref command, .. } if command == "RETR"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn operations_before_login_fail_fast() {
        let mut client = ready(ready_mock().build(), builder().build()).await;
        let err = client.stat().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn unexpected_continuation_is_a_parse_error() {
        let mock = logged_in_mock()
            .write(b"STAT\r\n")
            .read(b"+ what\r\n")
            .build();
        let mut client = logged_in(mock).await;
        assert!(matches!(client.stat().await, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn stls_rejection() {
        let mock = Builder::new()
            .read(b"+OK ready\r\n")
            .write(b"CAPA\r\n")
            .read(b"+OK\r\nSTLS\r\nUSER\r\n.\r\n")
            .write(b"STLS\r\n")
            .read(b"-ERR TLS not available right now\r\n")
            .build();
        let mut client = ready(mock, builder().build()).await;
        let err = client.stls().await.unwrap_err();
        assert!(matches!(err, Error::TlsUpgrade(_)));
        assert!(client.diagnostics().tls_attempted);
        assert!(!client.is_tls());
    }

    #[tokio::test]
    async fn negotiate_refuses_stripped_stls() {
        let mock = ready_mock().build();
        let config = builder().tls_mode(TlsMode::StartTls).build();
        let mut client = client_with(mock, config);
        let err = client.negotiate(None).await.unwrap_err();
        assert!(matches!(err, Error::TlsUpgrade(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mock = ready_mock()
            .write(b"QUIT\r\n")
            .read(b"+OK dewey POP3 server signing off\r\n")
            .build();
        let mut client = ready(mock, builder().build()).await;
        client.close().await;
        assert_eq!(client.state(), SessionState::Closed);
        client.close().await;
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_block_is_a_timeout() {
        let mock = logged_in_mock()
            .write(b"LIST\r\n")
            .read(b"+OK\r\n1 120\r\n")
            .wait(Duration::from_secs(120))
            .build();
        let mut client = client_with(mock, builder().io_timeout(Duration::from_secs(5)).build());
        client.read_greeting().await.unwrap();
        client.capa().await.unwrap();
        client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap();
        let err = client.list().await.unwrap_err();
        assert!(err.is_timeout());
    }
}
