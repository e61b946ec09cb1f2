//! SMTP client session.
//!
//! One [`Client`] drives one connection through the session lifecycle:
//!
//! ```text
//! Disconnected -> Connected (220 greeting) -> CapabilitiesKnown (EHLO)
//!     -> [STARTTLS, EHLO again -> SecureCapabilitiesKnown]
//!     -> Authenticated (AUTH) -> Operating (MAIL/RCPT/DATA) -> Closed
//! ```
//!
//! Commands are strictly sequential; every call sends one command and reads
//! its complete reply before returning.

use mailprobe_wire::auth::{self, Authenticator, choose_mechanism};
use mailprobe_wire::tls::create_tls_connector;
use mailprobe_wire::{
    AsyncStream, CapabilitySet, CertificateAnalysis, Config, Connection, Credentials, Diagnostics,
    Error, Mechanism, Protocol, Result, SessionState, SharedTracer, TlsMode,
};

use super::ServerInfo;
use crate::command::{BodyType, Command};
use crate::message::{OutgoingMessage, encode_data};
use crate::parser::ReplyAccumulator;
use crate::types::{Address, Reply, ReplyCode};

/// Upper bound on `334` round trips in one AUTH exchange.
const MAX_AUTH_STEPS: usize = 8;

/// Per-transaction `MAIL FROM` parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailOptions {
    /// Message size in bytes, announced with `SIZE=` when the server supports it.
    pub size: Option<u64>,
    /// The message contains 8-bit data.
    pub eight_bit: bool,
    /// An envelope address needs SMTPUTF8.
    pub smtputf8: bool,
}

/// SMTP client session over any byte stream.
pub struct Client<S> {
    conn: Connection<S>,
    config: Config,
    state: SessionState,
    server_info: ServerInfo,
    greeting: Option<Reply>,
    diagnostics: Diagnostics,
    in_transaction: bool,
    recipients: usize,
}

impl<S> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("state", &self.state)
            .field("server_info", &self.server_info)
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
            server_info: ServerInfo::default(),
            greeting: None,
            diagnostics,
            in_transaction: false,
            recipients: 0,
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

    /// Server identity and current capabilities.
    #[must_use]
    pub const fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Current capability set. Empty until EHLO succeeded.
    #[must_use]
    pub const fn capabilities(&self) -> &CapabilitySet {
        &self.server_info.capabilities
    }

    /// Greeting reply, once read.
    #[must_use]
    pub const fn greeting(&self) -> Option<&Reply> {
        self.greeting.as_ref()
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

    /// Reads the server greeting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rejected`] for anything but `220` (a `421` greeting
    /// is retryable), or the read error.
    pub async fn read_greeting(&mut self) -> Result<&Reply> {
        if self.state != SessionState::Disconnected {
            return Err(Error::InvalidState(format!(
                "greeting already read (state: {})",
                self.state
            )));
        }

        let reply = self.read_reply().await?;
        self.diagnostics.banner = Some(reply.lines.join("\n"));
        let reply = reply.expect_code("greeting", ReplyCode::SERVICE_READY)?;

        self.server_info.hostname = reply
            .message
            .first()
            .and_then(|msg| msg.split_whitespace().next())
            .unwrap_or_default()
            .to_string();
        tracing::debug!(
            host = %self.config.host,
            server = %self.server_info.hostname,
            tls = self.conn.is_tls(),
            "SMTP greeting received"
        );

        self.state.advance(SessionState::Connected)?;
        Ok(self.greeting.insert(reply))
    }

    /// Sends EHLO (falling back to HELO on a 5xx reply) and records the
    /// advertised capabilities.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] before the greeting, or the rejection
    /// of both EHLO and HELO.
    pub async fn hello(&mut self) -> Result<&CapabilitySet> {
        if self.state != SessionState::Connected {
            return Err(Error::InvalidState(format!(
                "EHLO requires a fresh connection (state: {})",
                self.state
            )));
        }
        self.negotiate_capabilities().await?;
        Ok(&self.server_info.capabilities)
    }

    async fn negotiate_capabilities(&mut self) -> Result<()> {
        let hostname = self.config.client_name.clone();
        let reply = self
            .command(&Command::Ehlo {
                hostname: hostname.clone(),
            })
            .await?;

        let (esmtp, capabilities) = if reply.is_success() {
            let caps = CapabilitySet::parse(Protocol::Smtp, reply.message.iter().skip(1));
            (true, caps)
        } else if reply.is_permanent_error() {
            tracing::debug!(code = reply.code.as_u16(), "EHLO rejected, falling back to HELO");
            self.command(&Command::Helo { hostname })
                .await?
                .expect_success("HELO")?;
            (false, CapabilitySet::empty(Protocol::Smtp))
        } else {
            return Err(reply.rejection("EHLO", "2xx"));
        };

        self.server_info.esmtp = esmtp;
        self.diagnostics.capabilities = capabilities.lines().to_vec();
        self.server_info.capabilities = capabilities;

        let next = if self.conn.is_tls() {
            SessionState::SecureCapabilitiesKnown
        } else {
            SessionState::CapabilitiesKnown
        };
        self.state.advance(next)
    }

    /// Upgrades the connection with STARTTLS and repeats EHLO.
    ///
    /// The plaintext capabilities are discarded before the handshake; only
    /// what the server advertises over TLS is trusted afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] if STARTTLS is not advertised,
    /// [`Error::TlsUpgrade`] if the server does not answer `220` or the
    /// handshake fails. A failed handshake leaves the session closed.
    pub async fn starttls(&mut self) -> Result<&CertificateAnalysis> {
        if self.state != SessionState::CapabilitiesKnown || self.conn.is_tls() {
            return Err(Error::InvalidState(format!(
                "STARTTLS requires a plaintext session after EHLO (state: {})",
                self.state
            )));
        }
        if !self.server_info.supports_starttls() {
            return Err(Error::NotSupported("server does not advertise STARTTLS".into()));
        }

        let connector = create_tls_connector(&self.config.tls)?;
        self.diagnostics.tls_attempted = true;

        let reply = self.command(&Command::StartTls).await?;
        if reply.code != ReplyCode::SERVICE_READY {
            let error = Error::TlsUpgrade(format!(
                "STARTTLS rejected: {} {}",
                reply.code,
                reply.message_text()
            ));
            self.diagnostics.tls_outcome = Some(error.to_string());
            return Err(error);
        }

        self.server_info.capabilities = CapabilitySet::empty(Protocol::Smtp);
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
            "STARTTLS established ({}, {})",
            analysis.protocol_version,
            analysis.status.as_str()
        ));
        self.diagnostics.tls = Some(analysis);

        self.negotiate_capabilities().await?;
        self.conn
            .tls_analysis()
            .ok_or_else(|| Error::TlsUpgrade("no TLS session after upgrade".into()))
    }

    /// Authenticates with the configured or best advertised mechanism.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCompatibleMechanism`] if nothing usable is
    /// advertised, or [`Error::Auth`] carrying the server's (redacted) text.
    pub async fn authenticate(&mut self, credentials: &Credentials) -> Result<Mechanism> {
        self.state.require_capabilities("AUTH")?;
        if self.state.is_authenticated() || self.state == SessionState::Operating {
            return Err(Error::InvalidState("AUTH is allowed once per session".into()));
        }

        let mechanism = choose_mechanism(
            &self.server_info.capabilities,
            credentials.has_token(),
            self.config.auth_method.as_deref(),
        )?;
        self.diagnostics.mechanism = Some(mechanism);
        tracing::debug!(
            host = %self.config.host,
            mechanism = %mechanism,
            user = %credentials.masked_username(),
            "authenticating"
        );

        self.run_exchange(mechanism, credentials)
            .await
            .map_err(|error| credentials.redact_error(error))
    }

    async fn run_exchange(
        &mut self,
        mechanism: Mechanism,
        credentials: &Credentials,
    ) -> Result<Mechanism> {
        let mut exchange = Authenticator::new(mechanism, credentials)?;
        let initial = exchange.initial_response().map(|r| auth::encode(&r));
        let mut reply = self
            .command(&Command::Auth {
                mechanism,
                initial_response: initial,
            })
            .await?;

        for _ in 0..MAX_AUTH_STEPS {
            match reply.code {
                ReplyCode::AUTH_SUCCESS => {
                    self.state.advance(SessionState::Authenticated)?;
                    tracing::info!(host = %self.config.host, mechanism = %mechanism, "authenticated");
                    return Ok(mechanism);
                }
                ReplyCode::AUTH_CONTINUE => {
                    let challenge = reply.message.first().map_or("", String::as_str);
                    let answer = auth::decode(challenge).and_then(|c| exchange.respond(&c));
                    match answer {
                        Ok(answer) => {
                            reply = self
                                .command(&Command::AuthResponse(auth::encode(&answer)))
                                .await?;
                        }
                        Err(error) => {
                            self.cancel_auth().await;
                            return Err(error);
                        }
                    }
                }
                _ => return Err(exchange.failure(credentials, &reply.message_text())),
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

    /// Runs greeting, EHLO, STARTTLS (in STARTTLS mode) and, with
    /// credentials, authentication.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub async fn negotiate(&mut self, credentials: Option<&Credentials>) -> Result<()> {
        self.read_greeting().await?;
        self.hello().await?;

        if self.config.tls_mode == TlsMode::StartTls && !self.conn.is_tls() {
            if !self.server_info.supports_starttls() {
                let error = Error::TlsUpgrade("server does not advertise STARTTLS".into());
                self.diagnostics.tls_attempted = true;
                self.diagnostics.tls_outcome = Some(error.to_string());
                return Err(error);
            }
            self.starttls().await?;
        }

        if let Some(credentials) = credentials {
            self.authenticate(credentials).await?;
        }
        Ok(())
    }

    /// Starts a mail transaction.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection (4xx retryable).
    pub async fn mail_from(&mut self, from: &Address) -> Result<Reply> {
        self.mail_from_with(from, MailOptions::default()).await
    }

    /// Starts a mail transaction with `SIZE`/`BODY`/`SMTPUTF8` parameters.
    ///
    /// Parameters are only sent when the server advertises the extension.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSupported`] if the message exceeds the advertised
    /// SIZE or needs SMTPUTF8 the server lacks, else the server's rejection.
    pub async fn mail_from_with(&mut self, from: &Address, options: MailOptions) -> Result<Reply> {
        self.state.require_capabilities("MAIL FROM")?;
        if self.in_transaction {
            return Err(Error::InvalidState("mail transaction already open".into()));
        }

        let caps = &self.server_info.capabilities;
        if let (Some(size), Some(max)) = (options.size, caps.max_message_size()) {
            if size > max {
                return Err(Error::NotSupported(format!(
                    "message size {size} exceeds server limit {max}"
                )));
            }
        }
        if options.smtputf8 && !caps.supports_smtputf8() {
            return Err(Error::NotSupported(
                "address needs SMTPUTF8, which the server does not advertise".into(),
            ));
        }
        let body = (options.eight_bit && caps.supports_8bitmime()).then_some(BodyType::EightBitMime);
        let size = options.size.filter(|_| caps.has("SIZE"));

        let reply = self
            .command(&Command::MailFrom {
                from: from.clone(),
                body,
                size,
                smtputf8: options.smtputf8,
            })
            .await?
            .expect_success("MAIL FROM")?;

        self.state.advance(SessionState::Operating)?;
        self.in_transaction = true;
        self.recipients = 0;
        Ok(reply)
    }

    /// Adds a recipient to the open transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] without a transaction, else the
    /// server's rejection.
    pub async fn rcpt_to(&mut self, to: &Address) -> Result<Reply> {
        if !self.in_transaction {
            return Err(Error::InvalidState("RCPT TO requires MAIL FROM first".into()));
        }
        let reply = self
            .command(&Command::RcptTo { to: to.clone() })
            .await?
            .expect_success("RCPT TO")?;
        self.recipients += 1;
        Ok(reply)
    }

    /// Sends DATA, the dot-stuffed message and the terminator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] without accepted recipients, else the
    /// server's rejection of DATA or of the message.
    pub async fn data(&mut self, message: &[u8]) -> Result<Reply> {
        if !self.in_transaction || self.recipients == 0 {
            return Err(Error::InvalidState("DATA requires an accepted recipient".into()));
        }

        self.command(&Command::Data)
            .await?
            .expect_code("DATA", ReplyCode::START_DATA)?;

        let payload = encode_data(message);
        self.conn.send_raw(&payload).await?;
        self.conn
            .diagnostic(format!("sent {} bytes of message data", payload.len()));

        let reply = self.read_reply().await;
        self.in_transaction = false;
        self.recipients = 0;
        reply?.expect_success("DATA")
    }

    /// Sends a complete message to all envelope recipients.
    ///
    /// On failure after MAIL FROM the transaction is reset best-effort.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAddress`] without recipients, else the first
    /// failing step's error.
    pub async fn send_mail(&mut self, message: &OutgoingMessage) -> Result<Reply> {
        let recipients = message.recipients();
        if recipients.is_empty() {
            return Err(Error::InvalidAddress("no recipients specified".into()));
        }

        let text = message.to_rfc5322();
        let options = MailOptions {
            size: u64::try_from(text.len()).ok(),
            eight_bit: message.is_8bit(),
            smtputf8: message.needs_smtputf8(),
        };
        self.mail_from_with(&message.from.address, options).await?;

        let result = async {
            for rcpt in recipients {
                self.rcpt_to(rcpt).await?;
            }
            self.data(text.as_bytes()).await
        }
        .await;

        if result.is_err() && self.in_transaction {
            if let Err(err) = self.rset().await {
                tracing::debug!(error = %err, "RSET after failed send failed");
            }
        }
        result
    }

    /// Asks the server to verify an address or user name.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection (`252` counts as success).
    pub async fn vrfy(&mut self, address: &str) -> Result<Reply> {
        self.simple("VRFY", Command::Vrfy {
            address: address.to_string(),
        })
        .await
    }

    /// Asks the server to expand a mailing list.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection.
    pub async fn expn(&mut self, list: &str) -> Result<Reply> {
        self.simple("EXPN", Command::Expn {
            list: list.to_string(),
        })
        .await
    }

    /// Requests help text.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection.
    pub async fn help(&mut self, topic: Option<&str>) -> Result<Reply> {
        self.simple("HELP", Command::Help {
            topic: topic.map(str::to_string),
        })
        .await
    }

    /// Sends NOOP.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection.
    pub async fn noop(&mut self) -> Result<Reply> {
        self.simple("NOOP", Command::Noop).await
    }

    /// Resets the current mail transaction.
    ///
    /// # Errors
    ///
    /// Returns the server's rejection.
    pub async fn rset(&mut self) -> Result<Reply> {
        let reply = self.simple("RSET", Command::Rset).await?;
        self.in_transaction = false;
        self.recipients = 0;
        Ok(reply)
    }

    async fn simple(&mut self, operation: &str, cmd: Command) -> Result<Reply> {
        self.state.require_open(operation)?;
        if self.state == SessionState::Connected {
            return Err(Error::InvalidState(format!("{operation} requires EHLO first")));
        }
        self.command(&cmd).await?.expect_success(operation)
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
        let reply = self.command(&Command::Quit).await?;
        if reply.code != ReplyCode::CLOSING && !reply.is_success() {
            return Err(reply.rejection("QUIT", "221"));
        }
        Ok(())
    }

    async fn command(&mut self, cmd: &Command) -> Result<Reply> {
        let line = cmd.serialize();
        if cmd.is_sensitive() {
            self.conn.send_redacted(&line, &cmd.redacted()).await?;
        } else {
            self.conn.send(&line).await?;
        }
        tracing::trace!(command = %cmd.redacted(), "sent");

        let reply = self.read_reply().await?;
        tracing::debug!(command = cmd.verb(), code = reply.code.as_u16(), "reply");
        Ok(reply)
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut acc = ReplyAccumulator::new();
        loop {
            let line = self.conn.read_line().await?;
            if let Some(reply) = acc.push(line)? {
                return Ok(reply);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use crate::types::Mailbox;
    use mailprobe_wire::{CancellationToken, RateLimiter, RecordingTracer, Transport};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::io::{Builder, Mock};

    fn config() -> Config {
        Config::builder(Protocol::Smtp, "mail.example.com")
            .tls_mode(TlsMode::None)
            .client_name("probe.local")
            .build()
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
        client_with(mock, config())
    }

    const GREETING: &[u8] = b"220 mail.example.com ESMTP ready\r\n";
    const EHLO: &[u8] = b"EHLO probe.local\r\n";

    #[tokio::test]
    async fn greeting_and_ehlo() {
        let mock = Builder::new()
            .read(GREETING)
            .write(EHLO)
            .read(b"250-mail.example.com\r\n250-SIZE 1000\r\n250-8BITMIME\r\n250 AUTH PLAIN LOGIN\r\n")
            .build();
        let mut client = client(mock);

        let greeting = client.read_greeting().await.unwrap();
        assert_eq!(greeting.code, ReplyCode::SERVICE_READY);
        assert_eq!(client.server_info().hostname, "mail.example.com");
        assert_eq!(client.state(), SessionState::Connected);

        let caps = client.hello().await.unwrap();
        assert_eq!(caps.max_message_size(), Some(1000));
        assert_eq!(caps.auth_mechanisms(), vec!["PLAIN", "LOGIN"]);
        assert!(client.server_info().esmtp);
        assert_eq!(client.state(), SessionState::CapabilitiesKnown);
        assert_eq!(
            client.diagnostics().banner.as_deref(),
            Some("220 mail.example.com ESMTP ready")
        );
    }

    #[tokio::test]
    async fn helo_fallback() {
        let mock = Builder::new()
            .read(GREETING)
            .write(EHLO)
            .read(b"502 5.5.1 EHLO not implemented\r\n")
            .write(b"HELO probe.local\r\n")
            .read(b"250 mail.example.com\r\n")
            .build();
        let mut client = client(mock);
        client.read_greeting().await.unwrap();
        let caps = client.hello().await.unwrap();
        assert!(caps.is_empty());
        assert!(!client.server_info().esmtp);
    }

    #[tokio::test]
    async fn transient_greeting_is_retryable() {
        let mock = Builder::new()
            .read(b"421 4.3.2 too busy\r\n")
            .build();
        let mut client = client(mock);
        let err = client.read_greeting().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            client.diagnostics().banner.as_deref(),
            Some("421 4.3.2 too busy")
        );
    }

    #[tokio::test]
    async fn code_change_mid_reply_is_fatal() {
        let mock = Builder::new()
            .read(GREETING)
            .write(EHLO)
            .read(b"250-mail.example.com\r\n251 odd\r\n")
            .build();
        let mut client = client(mock);
        client.read_greeting().await.unwrap();
        let err = client.hello().await.unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    async fn ready(mock: Mock, config: Config) -> Client<Mock> {
        let mut client = client_with(mock, config);
        client.read_greeting().await.unwrap();
        client.hello().await.unwrap();
        client
    }

    fn ready_mock() -> Builder {
        let mut builder = Builder::new();
        builder
            .read(GREETING)
            .write(EHLO)
            .read(b"250-mail.example.com\r\n250-SIZE 100\r\n250-8BITMIME\r\n250 AUTH PLAIN LOGIN CRAM-MD5 XOAUTH2\r\n");
        builder
    }

    #[tokio::test]
    async fn plain_auth_is_redacted_in_trace() {
        // "\0alice\0s3cret"
        let mock = ready_mock()
            .write(b"AUTH PLAIN AGFsaWNlAHMzY3JldA==\r\n")
            .read(b"235 2.7.0 Authentication successful\r\n")
            .build();
        let tracer = Arc::new(RecordingTracer::new());
        let mut client = ready(mock, config()).await;
        client.set_tracer(Some(tracer.clone()));

        let mechanism = client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap();
        assert_eq!(mechanism, Mechanism::Plain);
        assert_eq!(client.state(), SessionState::Authenticated);
        assert_eq!(tracer.writes(), vec!["AUTH PLAIN [redacted]"]);
    }

    #[tokio::test]
    async fn login_exchange() {
        let mock = ready_mock()
            .write(b"AUTH LOGIN\r\n")
            .read(b"334 VXNlcm5hbWU6\r\n")
            .write(b"YWxpY2U=\r\n")
            .read(b"334 UGFzc3dvcmQ6\r\n")
            .write(b"czNjcmV0\r\n")
            .read(b"235 ok\r\n")
            .build();
        let config = Config::builder(Protocol::Smtp, "mail.example.com")
            .tls_mode(TlsMode::None)
            .client_name("probe.local")
            .auth_method("login")
            .build();
        let mut client = ready(mock, config).await;
        let mechanism = client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap();
        assert_eq!(mechanism, Mechanism::Login);
    }

    #[tokio::test]
    async fn unexpected_login_prompt_cancels() {
        let mock = ready_mock()
            .write(b"AUTH LOGIN\r\n")
            .read(b"334 V2hvIGFyZSB5b3U/\r\n") // "Who are you?"
            .write(b"*\r\n")
            .read(b"501 5.7.0 cancelled\r\n")
            .build();
        let config = Config::builder(Protocol::Smtp, "mail.example.com")
            .tls_mode(TlsMode::None)
            .client_name("probe.local")
            .auth_method("LOGIN")
            .build();
        let mut client = ready(mock, config).await;
        let err = client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn auth_failure_never_echoes_secret() {
        let mock = ready_mock()
            .write(b"AUTH PLAIN AGFsaWNlAHMzY3JldA==\r\n")
            .read(b"535 5.7.8 bad credentials for AGFsaWNlAHMzY3JldA== (s3cret)\r\n")
            .build();
        let mut client = ready(mock, config()).await;
        let err = client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("bad credentials"));
        assert!(!text.contains("s3cret"), "{text}");
        assert!(!text.contains("AGFsaWNlAHMzY3JldA=="), "{text}");
        assert_eq!(client.state(), SessionState::CapabilitiesKnown);
    }

    #[tokio::test]
    async fn malformed_echo_during_auth_is_redacted() {
        let mock = ready_mock()
            .write(b"AUTH PLAIN AGFsaWNlAHMzY3JldA==\r\n")
            .read(b"5x5 AGFsaWNlAHMzY3JldA==\r\n")
            .build();
        let mut client = ready(mock, config()).await;
        let err = client
            .authenticate(&Credentials::new("alice", "s3cret"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "{err}");
        assert!(!err.to_string().contains("AGFsaWNlAHMzY3JldA=="), "{err}");
    }

    #[tokio::test]
    async fn xoauth2_json_error() {
        // user=alice\x01auth=Bearer tok\x01\x01
        let initial = auth::encode(b"user=alice\x01auth=Bearer tok\x01\x01");
        let challenge = auth::encode(br#"{"status":"401","schemes":"Bearer","scope":"https://mail.example.com/"}"#);
        let mock = ready_mock()
            .write(format!("AUTH XOAUTH2 {initial}\r\n").as_bytes())
            .read(format!("334 {challenge}\r\n").as_bytes())
            .write(b"\r\n")
            .read(b"535 5.7.8 Username and Password not accepted\r\n")
            .build();
        let mut client = ready(mock, config()).await;
        let err = client
            .authenticate(&Credentials::with_token("alice", "tok"))
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("401"), "{text}");
        assert!(text.contains("not accepted"), "{text}");
        assert_eq!(client.diagnostics().mechanism, Some(Mechanism::XOAuth2));
    }

    #[tokio::test]
    async fn cram_md5_exchange() {
        // RFC 2195 example challenge.
        let challenge = auth::encode(b"<1896.697170952@postoffice.reston.mci.net>");
        let answer = auth::encode(b"tim b913a602c7eda7a495b4e6e7334d3890");
        let mock = ready_mock()
            .write(b"AUTH CRAM-MD5\r\n")
            .read(format!("334 {challenge}\r\n").as_bytes())
            .write(format!("{answer}\r\n").as_bytes())
            .read(b"235 ok\r\n")
            .build();
        let config = Config::builder(Protocol::Smtp, "mail.example.com")
            .tls_mode(TlsMode::None)
            .client_name("probe.local")
            .auth_method("CRAM-MD5")
            .build();
        let mut client = ready(mock, config).await;
        client
            .authenticate(&Credentials::new("tim", "tanstaaftanstaaf"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unadvertised_override_is_rejected_locally() {
        let mock = Builder::new()
            .read(GREETING)
            .write(EHLO)
            .read(b"250-mail.example.com\r\n250 AUTH LOGIN\r\n")
            .build();
        let config = Config::builder(Protocol::Smtp, "mail.example.com")
            .tls_mode(TlsMode::None)
            .client_name("probe.local")
            .auth_method("PLAIN")
            .build();
        let mut client = ready(mock, config).await;
        let err = client
            .authenticate(&Credentials::new("a", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoCompatibleMechanism(_)));
    }

    #[tokio::test]
    async fn mail_transaction() {
        let mock = ready_mock()
            .write(b"MAIL FROM:<alice@example.com> SIZE=12\r\n")
            .read(b"250 2.1.0 ok\r\n")
            .write(b"RCPT TO:<bob@example.org>\r\n")
            .read(b"250 2.1.5 ok\r\n")
            .write(b"DATA\r\n")
            .read(b"354 go ahead\r\n")
            .write(b"hi\r\n..dot\r\n.\r\n")
            .read(b"250 2.0.0 queued as ABC\r\n")
            .build();
        let mut client = ready(mock, config()).await;

        let from = Address::new("alice@example.com").unwrap();
        let options = MailOptions {
            size: Some(12),
            ..MailOptions::default()
        };
        client.mail_from_with(&from, options).await.unwrap();
        assert_eq!(client.state(), SessionState::Operating);
        client.rcpt_to(&Address::new("bob@example.org").unwrap()).await.unwrap();
        let reply = client.data(b"hi\n.dot\n").await.unwrap();
        assert_eq!(reply.enhanced_status().unwrap().to_string(), "2.0.0");
    }

    #[tokio::test]
    async fn oversized_message_is_refused_before_sending() {
        let mock = ready_mock().build();
        let mut client = ready(mock, config()).await;
        let options = MailOptions {
            size: Some(101),
            ..MailOptions::default()
        };
        let err = client
            .mail_from_with(&Address::new("a@b.c").unwrap(), options)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn greylisted_recipient_is_retryable() {
        let mock = ready_mock()
            .write(b"MAIL FROM:<a@b.c>\r\n")
            .read(b"250 ok\r\n")
            .write(b"RCPT TO:<x@y.z>\r\n")
            .read(b"451 4.7.1 greylisted, try again later\r\n")
            .build();
        let mut client = ready(mock, config()).await;
        client.mail_from(&Address::new("a@b.c").unwrap()).await.unwrap();
        let err = client.rcpt_to(&Address::new("x@y.z").unwrap()).await.unwrap_err();
        assert!(err.is_retryable());

        let err = client.data(b"body").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn send_mail_resets_after_rejection() {
        let mock = ready_mock()
            .write(b"MAIL FROM:<alice@example.com>\r\n")
            .read(b"250 ok\r\n")
            .write(b"RCPT TO:<bob@example.org>\r\n")
            .read(b"550 5.1.1 no such user\r\n")
            .write(b"RSET\r\n")
            .read(b"250 flushed\r\n")
            .build();
        // Server without SIZE so no parameter is sent.
        let mut client = ready(mock, config()).await;
        client.server_info.capabilities = CapabilitySet::parse(Protocol::Smtp, ["8BITMIME"]);

        let message = OutgoingMessage::new(Mailbox::new("alice@example.com").unwrap(), "s", "b")
            .to(Mailbox::new("bob@example.org").unwrap());
        let err = client.send_mail(&message).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("no such user"));
    }

    #[tokio::test]
    async fn operations_before_ehlo_fail_fast() {
        let mock = Builder::new().read(GREETING).build();
        let mut client = client(mock);
        client.read_greeting().await.unwrap();

        let err = client.mail_from(&Address::new("a@b.c").unwrap()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let err = client.authenticate(&Credentials::new("a", "b")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let err = client.noop().await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn vrfy_expn_help_noop() {
        let mock = ready_mock()
            .write(b"VRFY postmaster\r\n")
            .read(b"252 2.1.5 cannot verify\r\n")
            .write(b"EXPN staff\r\n")
            .read(b"502 5.5.1 EXPN disabled\r\n")
            .write(b"HELP\r\n")
            .read(b"214-Commands:\r\n214 EHLO MAIL RCPT DATA\r\n")
            .write(b"NOOP\r\n")
            .read(b"250 ok\r\n")
            .build();
        let mut client = ready(mock, config()).await;

        assert_eq!(client.vrfy("postmaster").await.unwrap().code, ReplyCode::CANNOT_VERIFY);
        assert!(client.expn("staff").await.is_err());
        assert_eq!(client.help(None).await.unwrap().message.len(), 2);
        client.noop().await.unwrap();
    }

    #[tokio::test]
    async fn starttls_rejection() {
        let mock = Builder::new()
            .read(GREETING)
            .write(EHLO)
            .read(b"250-mail.example.com\r\n250 STARTTLS\r\n")
            .write(b"STARTTLS\r\n")
            .read(b"454 4.7.0 TLS not available\r\n")
            .build();
        let mut client = ready(mock, config()).await;
        let err = client.starttls().await.unwrap_err();
        assert!(matches!(err, Error::TlsUpgrade(_)));
        assert!(client.diagnostics().tls_attempted);
        assert!(client.diagnostics().tls_outcome.as_deref().unwrap().contains("454"));
    }

    #[tokio::test]
    async fn starttls_requires_advertisement() {
        let mock = ready_mock().build();
        let mut client = ready(mock, config()).await;
        assert!(matches!(client.starttls().await, Err(Error::NotSupported(_))));
    }

    #[tokio::test]
    async fn negotiate_refuses_stripped_starttls() {
        let mock = ready_mock().build();
        let config = Config::builder(Protocol::Smtp, "mail.example.com")
            .tls_mode(TlsMode::StartTls)
            .client_name("probe.local")
            .build();
        let mut client = client_with(mock, config);
        let err = client.negotiate(None).await.unwrap_err();
        assert!(matches!(err, Error::TlsUpgrade(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mock = ready_mock()
            .write(b"QUIT\r\n")
            .read(b"221 2.0.0 bye\r\n")
            .build();
        let mut client = ready(mock, config()).await;
        client.close().await;
        assert_eq!(client.state(), SessionState::Closed);
        client.close().await;
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn close_gives_up_on_silent_server() {
        let mock = ready_mock()
            .write(b"QUIT\r\n")
            .wait(Duration::from_secs(30))
            .build();
        let config = Config::builder(Protocol::Smtp, "mail.example.com")
            .tls_mode(TlsMode::None)
            .client_name("probe.local")
            .close_timeout(Duration::from_secs(2))
            .build();
        let mut client = ready(mock, config).await;
        client.close().await;
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reply_is_a_timeout() {
        let mock = Builder::new()
            .wait(Duration::from_secs(120))
            .build();
        let config = Config::builder(Protocol::Smtp, "mail.example.com")
            .tls_mode(TlsMode::None)
            .io_timeout(Duration::from_secs(5))
            .build();
        let mut client = client_with(mock, config);
        let err = client.read_greeting().await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.is_retryable());
    }
}
