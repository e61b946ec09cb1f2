//! Server capability advertisements.
//!
//! A [`CapabilitySet`] is built from one EHLO reply (SMTP) or one CAPA
//! listing (POP3) and is never mutated afterwards. Clients discard it after
//! a TLS upgrade and parse a fresh one, so a plaintext advertisement can
//! never influence the secured session.

use std::collections::HashMap;

use crate::auth::Mechanism;
use crate::config::Protocol;

/// Parsed capability advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    protocol: Protocol,
    entries: HashMap<String, Vec<String>>,
    lines: Vec<String>,
}

impl CapabilitySet {
    /// Parses capability lines (without the SMTP greeting line or the POP3
    /// status line and terminator).
    ///
    /// Names are matched case-insensitively. The legacy SMTP form
    /// `AUTH=PLAIN LOGIN` is treated like `AUTH PLAIN LOGIN`.
    #[must_use]
    pub fn parse<I, L>(protocol: Protocol, lines: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: AsRef<str>,
    {
        let mut entries: HashMap<String, Vec<String>> = HashMap::new();
        let mut raw = Vec::new();

        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() {
                continue;
            }
            raw.push(line.to_string());

            let mut words = line.split_whitespace();
            let Some(first) = words.next() else {
                continue;
            };
            let (name, inline) = match first.split_once('=') {
                Some((name, value)) if !value.is_empty() => (name, Some(value)),
                Some((name, _)) => (name, None),
                None => (first, None),
            };

            let args = entries.entry(name.to_ascii_uppercase()).or_default();
            args.extend(inline.into_iter().chain(words).map(str::to_string));
        }

        Self {
            protocol,
            entries,
            lines: raw,
        }
    }

    /// Creates an empty set, used when the server does not answer CAPA.
    #[must_use]
    pub fn empty(protocol: Protocol) -> Self {
        Self {
            protocol,
            entries: HashMap::new(),
            lines: Vec::new(),
        }
    }

    /// Protocol the advertisement belongs to.
    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Returns true if nothing was advertised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw capability lines in server order.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Returns true if the capability is advertised.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_uppercase())
    }

    /// Returns the arguments of a capability.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries
            .get(&name.to_ascii_uppercase())
            .map(Vec::as_slice)
    }

    /// SASL mechanism names, uppercased and deduplicated in advertised order.
    ///
    /// Taken from `AUTH` for SMTP and `SASL` for POP3.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<String> {
        let key = match self.protocol {
            Protocol::Smtp => "AUTH",
            Protocol::Pop3 => "SASL",
        };
        let mut mechanisms: Vec<String> = Vec::new();
        for name in self.get(key).unwrap_or_default() {
            let name = name.to_ascii_uppercase();
            if !mechanisms.contains(&name) {
                mechanisms.push(name);
            }
        }
        mechanisms
    }

    /// Returns true if the SASL mechanism list contains `name`.
    #[must_use]
    pub fn has_auth_mechanism(&self, name: &str) -> bool {
        self.auth_mechanisms()
            .iter()
            .any(|m| m.eq_ignore_ascii_case(name))
    }

    /// Returns true if the in-band TLS upgrade is advertised (STARTTLS or STLS).
    #[must_use]
    pub fn supports_starttls(&self) -> bool {
        self.has(self.protocol.upgrade_command())
    }

    /// POP3 `UIDL`.
    #[must_use]
    pub fn supports_uidl(&self) -> bool {
        self.has("UIDL")
    }

    /// POP3 `TOP`.
    #[must_use]
    pub fn supports_top(&self) -> bool {
        self.has("TOP")
    }

    /// POP3 `USER`.
    #[must_use]
    pub fn supports_user(&self) -> bool {
        self.has("USER")
    }

    /// `PIPELINING` (both protocols).
    #[must_use]
    pub fn supports_pipelining(&self) -> bool {
        self.has("PIPELINING")
    }

    /// SMTP `8BITMIME`.
    #[must_use]
    pub fn supports_8bitmime(&self) -> bool {
        self.has("8BITMIME")
    }

    /// SMTP `SMTPUTF8`.
    #[must_use]
    pub fn supports_smtputf8(&self) -> bool {
        self.has("SMTPUTF8")
    }

    /// POP3 `RESP-CODES` (RFC 2449).
    #[must_use]
    pub fn supports_resp_codes(&self) -> bool {
        self.has("RESP-CODES")
    }

    /// Maximum message size from SMTP `SIZE`; `None` when absent or unlimited (0).
    #[must_use]
    pub fn max_message_size(&self) -> Option<u64> {
        self.get("SIZE")
            .and_then(|args| args.first())
            .and_then(|size| size.parse().ok())
            .filter(|&size| size > 0)
    }

    /// POP3 `EXPIRE` policy (`NEVER`, a day count, optionally `USER`).
    #[must_use]
    pub fn expire_policy(&self) -> Option<String> {
        self.get("EXPIRE")
            .filter(|args| !args.is_empty())
            .map(|args| args.join(" "))
    }

    /// POP3 `IMPLEMENTATION` string.
    #[must_use]
    pub fn implementation(&self) -> Option<String> {
        self.get("IMPLEMENTATION")
            .filter(|args| !args.is_empty())
            .map(|args| args.join(" "))
    }

    /// POP3 `LOGIN-DELAY` in seconds.
    #[must_use]
    pub fn login_delay(&self) -> Option<u64> {
        self.get("LOGIN-DELAY")
            .and_then(|args| args.first())
            .and_then(|delay| delay.parse().ok())
    }

    /// Returns true if `mechanism` may be used against this server.
    ///
    /// SASL mechanisms must be advertised. POP3 `USER` is the protocol
    /// fallback and is always offered. APOP depends on the greeting, not on
    /// the capability listing, and is decided by the POP3 client.
    #[must_use]
    pub fn offers(&self, mechanism: Mechanism) -> bool {
        match mechanism {
            Mechanism::User => self.protocol == Protocol::Pop3,
            Mechanism::Apop => false,
            sasl => self.has_auth_mechanism(sasl.as_str()),
        }
    }

    /// Picks the strongest usable mechanism.
    ///
    /// Priority: XOAUTH2 (only with an access token) > PLAIN > LOGIN >
    /// protocol fallback (POP3 `USER`; none for SMTP).
    #[must_use]
    pub fn select_auth_mechanism(&self, has_access_token: bool) -> Option<Mechanism> {
        if has_access_token && self.offers(Mechanism::XOAuth2) {
            return Some(Mechanism::XOAuth2);
        }
        [Mechanism::Plain, Mechanism::Login, Mechanism::User]
            .into_iter()
            .find(|&mechanism| self.offers(mechanism))
    }
}
