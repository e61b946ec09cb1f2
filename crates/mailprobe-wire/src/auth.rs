//! Authentication mechanisms.
//!
//! Implements:
//! - PLAIN (RFC 4616)
//! - LOGIN (draft-murchison-sasl-login)
//! - CRAM-MD5 (RFC 2195)
//! - XOAUTH2 (Google/Microsoft proprietary)
//! - APOP (RFC 1939) digest
//!
//! SASL mechanisms run as an [`Authenticator`] state machine that turns
//! decoded server challenges into raw responses; the protocol clients do the
//! base64 encoding and the wire exchange. APOP and POP3 `USER`/`PASS` are plain
//! protocol commands and are driven by the POP3 client directly.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use serde::Deserialize;

use crate::capability::CapabilitySet;
use crate::{Error, Result};

/// Authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Mechanism {
    /// PLAIN - one-shot username and password.
    Plain,
    /// LOGIN - prompted username and password.
    Login,
    /// CRAM-MD5 - keyed MD5 challenge-response.
    CramMd5,
    /// `XOAUTH2` - `OAuth2` bearer token.
    XOAuth2,
    /// APOP - POP3 MD5 digest of the greeting timestamp.
    Apop,
    /// POP3 `USER`/`PASS`.
    User,
}

impl Mechanism {
    /// Parses a mechanism name, case-insensitively.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            "CRAM-MD5" => Some(Self::CramMd5),
            "XOAUTH2" => Some(Self::XOAuth2),
            "APOP" => Some(Self::Apop),
            "USER" => Some(Self::User),
            _ => None,
        }
    }

    /// Returns the wire name of the mechanism.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
            Self::XOAuth2 => "XOAUTH2",
            Self::Apop => "APOP",
            Self::User => "USER",
        }
    }

    /// Returns true for mechanisms negotiated with `AUTH`.
    #[must_use]
    pub const fn is_sasl(self) -> bool {
        matches!(self, Self::Plain | Self::Login | Self::CramMd5 | Self::XOAuth2)
    }

    /// Returns true if the mechanism needs an access token rather than a password.
    #[must_use]
    pub const fn uses_token(self) -> bool {
        matches!(self, Self::XOAuth2)
    }
}

impl std::fmt::Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Username with a password and/or access token.
///
/// `Debug` never prints the secrets.
#[derive(Clone, Default)]
pub struct Credentials {
    username: String,
    password: Option<String>,
    access_token: Option<String>,
}

impl Credentials {
    /// Creates password credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
            access_token: None,
        }
    }

    /// Creates `OAuth2` bearer-token credentials.
    #[must_use]
    pub fn with_token(username: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: None,
            access_token: Some(token.into()),
        }
    }

    /// Adds an access token to password credentials.
    #[must_use]
    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns true if an access token was supplied.
    #[must_use]
    pub fn has_token(&self) -> bool {
        self.access_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Returns the password or an error naming the mechanism that needs it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if no password was supplied.
    pub fn password_for(&self, mechanism: Mechanism) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| Error::Auth(format!("{mechanism} requires a password")))
    }

    /// Returns the access token or an error naming the mechanism that needs it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if no token was supplied.
    pub fn token_for(&self, mechanism: Mechanism) -> Result<&str> {
        self.access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Auth(format!("{mechanism} requires an access token")))
    }

    /// Username with the local part masked, for audit records.
    #[must_use]
    pub fn masked_username(&self) -> String {
        mask(&self.username)
    }

    /// Removes every secret from `text`: the raw password and token, their
    /// base64 form, and the encoded PLAIN and XOAUTH2 responses that carry
    /// them.
    ///
    /// Servers sometimes echo what they received; error messages built from
    /// server text pass through here first.
    #[must_use]
    pub fn redact(&self, text: &str) -> String {
        let mut forms = Vec::new();
        if let Some(password) = self.password.as_deref().filter(|s| !s.is_empty()) {
            forms.push(STANDARD.encode(plain_response(&self.username, password)));
            forms.push(STANDARD.encode(password));
            forms.push(password.to_string());
        }
        if let Some(token) = self.access_token.as_deref().filter(|s| !s.is_empty()) {
            forms.push(STANDARD.encode(xoauth2_response(&self.username, token)));
            forms.push(STANDARD.encode(token));
            forms.push(token.to_string());
        }

        // Encoded blobs before the raw secrets they contain.
        forms
            .iter()
            .fold(text.to_string(), |out, form| out.replace(form, crate::connection::REDACTED))
    }

    /// Applies [`Credentials::redact`] to the server text an error carries.
    ///
    /// Errors raised during an authentication exchange pass through here, so
    /// a malformed echo of a response cannot leak the secret either.
    #[must_use]
    pub fn redact_error(&self, error: Error) -> Error {
        match error {
            Error::Parse(text) => Error::Parse(self.redact(&text)),
            Error::Auth(text) => Error::Auth(self.redact(&text)),
            Error::Rejected {
                command,
                expected,
                actual,
                message,
                retryable,
            } => Error::Rejected {
                command,
                expected,
                actual,
                message: self.redact(&message),
                retryable,
            },
            Error::RetriesExhausted { retries, source } => Error::RetriesExhausted {
                retries,
                source: Box::new(self.redact_error(*source)),
            },
            other => other,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("access_token", &self.access_token.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Masks a username as `a***@example.com` (or `a***` without a domain).
#[must_use]
pub fn mask(username: &str) -> String {
    let (local, domain) = match username.split_once('@') {
        Some((local, domain)) => (local, Some(domain)),
        None => (username, None),
    };
    let first: String = local.chars().take(1).collect();
    match domain {
        Some(domain) => format!("{first}***@{domain}"),
        None if first.is_empty() => String::new(),
        None => format!("{first}***"),
    }
}

/// Chooses the mechanism for a session.
///
/// With an explicit `requested` name the mechanism must be known and offered
/// by the server. Without one, the capability priority applies.
///
/// # Errors
///
/// Returns [`Error::NoCompatibleMechanism`] when nothing fits.
pub fn choose_mechanism(
    caps: &CapabilitySet,
    has_access_token: bool,
    requested: Option<&str>,
) -> Result<Mechanism> {
    if let Some(name) = requested.map(str::trim).filter(|name| !name.is_empty()) {
        let mechanism = Mechanism::parse(name)
            .ok_or_else(|| Error::NoCompatibleMechanism(format!("unknown mechanism {name}")))?;
        if !caps.offers(mechanism) {
            return Err(Error::NoCompatibleMechanism(format!(
                "{mechanism} is not advertised (server offers: {})",
                offered(caps)
            )));
        }
        return Ok(mechanism);
    }

    caps.select_auth_mechanism(has_access_token).ok_or_else(|| {
        Error::NoCompatibleMechanism(format!("server offers: {}", offered(caps)))
    })
}

fn offered(caps: &CapabilitySet) -> String {
    let mechanisms = caps.auth_mechanisms();
    if mechanisms.is_empty() {
        "none".to_string()
    } else {
        mechanisms.join(" ")
    }
}

/// Builds the PLAIN response `\0username\0password`.
#[must_use]
pub fn plain_response(username: &str, password: &str) -> Vec<u8> {
    format!("\0{username}\0{password}").into_bytes()
}

/// Builds the XOAUTH2 response `user=<user>\x01auth=Bearer <token>\x01\x01`.
#[must_use]
pub fn xoauth2_response(user: &str, token: &str) -> Vec<u8> {
    format!("user={user}\x01auth=Bearer {token}\x01\x01").into_bytes()
}

type HmacMd5 = Hmac<Md5>;

/// Computes the CRAM-MD5 response `username hex(HMAC-MD5(password, challenge))`.
///
/// # Errors
///
/// Returns [`Error::Auth`] if the HMAC key is rejected.
pub fn cram_md5_response(username: &str, password: &str, challenge: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacMd5::new_from_slice(password.as_bytes())
        .map_err(|e| Error::Auth(format!("CRAM-MD5 key: {e}")))?;
    mac.update(challenge);
    let digest = hex::encode(mac.finalize().into_bytes());
    Ok(format!("{username} {digest}").into_bytes())
}

/// Computes the APOP digest `hex(MD5(timestamp + password))`.
#[must_use]
pub fn apop_digest(timestamp: &str, password: &str) -> String {
    hex::encode(Md5::digest(format!("{timestamp}{password}")))
}

/// Extracts the `<...>` timestamp from a POP3 greeting.
///
/// Takes the first `<` and the first `>` after it, brackets included.
#[must_use]
pub fn apop_timestamp(greeting: &str) -> Option<&str> {
    let start = greeting.find('<')?;
    let end = greeting[start..].find('>')? + start;
    let stamp = &greeting[start..=end];
    (stamp.len() > 2 && !stamp.contains(char::is_whitespace)).then_some(stamp)
}

/// `OAuth2` error returned in an XOAUTH2 challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OAuthError {
    /// HTTP-like status code.
    #[serde(default)]
    pub status: String,
    /// Accepted authentication schemes.
    #[serde(default)]
    pub schemes: String,
    /// Scope the token must carry.
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Display for OAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "status {}", self.status)?;
        if !self.schemes.is_empty() {
            write!(f, ", schemes {}", self.schemes)?;
        }
        if let Some(scope) = &self.scope {
            write!(f, ", scope {scope}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Start,
    Username,
    Password,
    Sent,
    Finished,
}

/// SASL exchange for one mechanism.
///
/// Call [`Authenticator::initial_response`] once, then feed every decoded
/// server challenge to [`Authenticator::respond`] until the server reports
/// success or failure.
#[derive(Debug)]
pub struct Authenticator {
    mechanism: Mechanism,
    username: String,
    secret: String,
    step: Step,
    oauth_error: Option<OAuthError>,
}

impl Authenticator {
    /// Prepares an exchange, checking that the needed secret is present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] for non-SASL mechanisms or missing secrets.
    pub fn new(mechanism: Mechanism, credentials: &Credentials) -> Result<Self> {
        if !mechanism.is_sasl() {
            return Err(Error::Auth(format!("{mechanism} is not a SASL mechanism")));
        }
        let secret = if mechanism.uses_token() {
            credentials.token_for(mechanism)?
        } else {
            credentials.password_for(mechanism)?
        };

        Ok(Self {
            mechanism,
            username: credentials.username().to_string(),
            secret: secret.to_string(),
            step: Step::Start,
            oauth_error: None,
        })
    }

    /// Mechanism being run.
    #[must_use]
    pub const fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    /// Response sent together with the `AUTH` command, if the mechanism has one.
    pub fn initial_response(&mut self) -> Option<Vec<u8>> {
        if self.step != Step::Start {
            return None;
        }
        match self.mechanism {
            Mechanism::Plain => {
                self.step = Step::Sent;
                Some(plain_response(&self.username, &self.secret))
            }
            Mechanism::XOAuth2 => {
                self.step = Step::Sent;
                Some(xoauth2_response(&self.username, &self.secret))
            }
            Mechanism::Login => {
                self.step = Step::Username;
                None
            }
            Mechanism::CramMd5 | Mechanism::Apop | Mechanism::User => None,
        }
    }

    /// Answers one decoded server challenge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] when the challenge does not fit the exchange
    /// (unexpected LOGIN prompt, challenge after a one-shot response). The
    /// caller should cancel the exchange with `*`.
    pub fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        match (self.mechanism, self.step) {
            (Mechanism::Login, Step::Username | Step::Password) => {
                let prompt = String::from_utf8_lossy(challenge).to_ascii_lowercase();
                if prompt.contains("username") || prompt.contains("user name") {
                    self.step = Step::Password;
                    Ok(self.username.clone().into_bytes())
                } else if prompt.contains("password") {
                    self.step = Step::Finished;
                    Ok(self.secret.clone().into_bytes())
                } else {
                    self.step = Step::Finished;
                    Err(Error::Auth(format!(
                        "unexpected LOGIN prompt {:?}",
                        String::from_utf8_lossy(challenge)
                    )))
                }
            }
            (Mechanism::CramMd5, Step::Start) => {
                if challenge.is_empty() {
                    return Err(Error::Auth("empty CRAM-MD5 challenge".into()));
                }
                self.step = Step::Finished;
                cram_md5_response(&self.username, &self.secret, challenge)
            }
            (Mechanism::XOAuth2, Step::Sent) => {
                // The server reports the failure as a JSON challenge and
                // expects an empty response before sending the final status.
                self.oauth_error = serde_json::from_slice(challenge).ok();
                self.step = Step::Finished;
                Ok(Vec::new())
            }
            _ => {
                self.step = Step::Finished;
                Err(Error::Auth(format!(
                    "unexpected challenge during {} exchange",
                    self.mechanism
                )))
            }
        }
    }

    /// `OAuth2` error details received during an XOAUTH2 exchange.
    #[must_use]
    pub const fn oauth_error(&self) -> Option<&OAuthError> {
        self.oauth_error.as_ref()
    }

    /// Builds the terminal failure error from the server text.
    ///
    /// Secrets are removed from `server_text` before it is embedded.
    #[must_use]
    pub fn failure(&self, credentials: &Credentials, server_text: &str) -> Error {
        let text = credentials.redact(server_text);
        match &self.oauth_error {
            Some(details) => Error::Auth(format!("{} rejected: {text} ({details})", self.mechanism)),
            None => Error::Auth(format!("{} rejected: {text}", self.mechanism)),
        }
    }
}

/// Encodes a SASL response for the wire. An empty response is sent as an
/// empty line.
#[must_use]
pub fn encode(response: &[u8]) -> String {
    STANDARD.encode(response)
}

/// Decodes a base64 SASL challenge.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the challenge is not valid base64.
pub fn decode(challenge: &str) -> Result<Vec<u8>> {
    let challenge = challenge.trim();
    if challenge.is_empty() {
        return Ok(Vec::new());
    }
    STANDARD
        .decode(challenge)
        .map_err(|e| Error::Parse(format!("invalid base64 challenge: {e}")))
}
