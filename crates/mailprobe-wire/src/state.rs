//! Session state machine.
//!
//! Both protocol clients move through the same ordered states:
//!
//! ```text
//! Disconnected -> Connected -> CapabilitiesKnown
//!     -> [SecureCapabilitiesKnown] -> Authenticated -> Operating -> Closed
//! ```
//!
//! `SecureCapabilitiesKnown` is reached either by a STARTTLS/STLS upgrade
//! followed by a fresh capability fetch, or directly from `Connected` on an
//! implicit-TLS connection. `Closed` is reachable from every state.

use crate::{Error, Result};

/// Protocol session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No transport.
    #[default]
    Disconnected,
    /// Greeting received.
    Connected,
    /// Capabilities fetched over plaintext.
    CapabilitiesKnown,
    /// Capabilities fetched over TLS.
    SecureCapabilitiesKnown,
    /// Credentials accepted.
    Authenticated,
    /// At least one post-login (POP3) or mail (SMTP) command issued.
    Operating,
    /// Session ended.
    Closed,
}

impl SessionState {
    /// Returns the snake-case name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::CapabilitiesKnown => "capabilities_known",
            Self::SecureCapabilitiesKnown => "secure_capabilities_known",
            Self::Authenticated => "authenticated",
            Self::Operating => "operating",
            Self::Closed => "closed",
        }
    }

    /// Returns true if moving to `next` keeps the lifecycle order.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{
            Authenticated, CapabilitiesKnown, Closed, Connected, Disconnected, Operating,
            SecureCapabilitiesKnown,
        };

        matches!(
            (self, next),
            (Disconnected, Connected)
                | (Connected, CapabilitiesKnown | SecureCapabilitiesKnown)
                | (
                    CapabilitiesKnown,
                    SecureCapabilitiesKnown | Authenticated | Operating
                )
                | (SecureCapabilitiesKnown, Authenticated | Operating)
                | (Authenticated | Operating, Operating)
                | (_, Closed)
        )
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for out-of-order transitions.
    pub fn advance(&mut self, next: Self) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "cannot move from {} to {}",
                self.as_str(),
                next.as_str()
            )));
        }
        tracing::trace!(from = self.as_str(), to = next.as_str(), "session state");
        *self = next;
        Ok(())
    }

    /// Returns true once capabilities are known (plaintext or secure).
    #[must_use]
    pub const fn has_capabilities(self) -> bool {
        matches!(
            self,
            Self::CapabilitiesKnown
                | Self::SecureCapabilitiesKnown
                | Self::Authenticated
                | Self::Operating
        )
    }

    /// Returns true once credentials were accepted.
    #[must_use]
    pub const fn is_authenticated(self) -> bool {
        matches!(self, Self::Authenticated | Self::Operating)
    }

    /// Fails fast unless the session is authenticated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] naming `operation`.
    pub fn require_authenticated(self, operation: &str) -> Result<()> {
        if self.is_authenticated() {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{operation} requires an authenticated session (state: {})",
                self.as_str()
            )))
        }
    }

    /// Fails fast unless capabilities are known and the session is open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] naming `operation`.
    pub fn require_capabilities(self, operation: &str) -> Result<()> {
        if self.has_capabilities() {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "{operation} requires a negotiated session (state: {})",
                self.as_str()
            )))
        }
    }

    /// Fails fast on a closed or never-connected session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] naming `operation`.
    pub fn require_open(self, operation: &str) -> Result<()> {
        match self {
            Self::Disconnected | Self::Closed => Err(Error::InvalidState(format!(
                "{operation} on a {} session",
                self.as_str()
            ))),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
