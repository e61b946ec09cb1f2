//! POP3 response types.

use mailprobe_wire::Error;

/// Status indicator of a response line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `+OK`
    Ok,
    /// `-ERR`
    Err,
    /// `+` continuation during SASL authentication.
    Continue,
}

impl Status {
    /// Returns the wire form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "+OK",
            Self::Err => "-ERR",
            Self::Continue => "+",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extended response code in brackets after `-ERR` (RFC 2449, RFC 3206).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    /// `[IN-USE]`: the maildrop is locked by another session.
    InUse,
    /// `[LOGIN-DELAY]`: logged in too recently.
    LoginDelay,
    /// `[SYS/TEMP]`: temporary system failure.
    SysTemp,
    /// `[SYS/PERM]`: permanent system failure.
    SysPerm,
    /// `[AUTH]`: credentials were rejected.
    Auth,
    /// Unknown response code.
    Other(String),
}

impl ResponseCode {
    /// Parses the text between the brackets.
    #[must_use]
    pub fn parse(code: &str) -> Self {
        match code.to_ascii_uppercase().as_str() {
            "IN-USE" => Self::InUse,
            "LOGIN-DELAY" => Self::LoginDelay,
            "SYS/TEMP" => Self::SysTemp,
            "SYS/PERM" => Self::SysPerm,
            "AUTH" => Self::Auth,
            _ => Self::Other(code.to_string()),
        }
    }

    /// Returns true if retrying later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::InUse | Self::SysTemp)
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InUse => f.write_str("IN-USE"),
            Self::LoginDelay => f.write_str("LOGIN-DELAY"),
            Self::SysTemp => f.write_str("SYS/TEMP"),
            Self::SysPerm => f.write_str("SYS/PERM"),
            Self::Auth => f.write_str("AUTH"),
            Self::Other(code) => f.write_str(code),
        }
    }
}

/// POP3 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status of the first line.
    pub status: Status,
    /// Text after the status indicator (response code removed).
    pub message: String,
    /// Extended response code, if any.
    pub code: Option<ResponseCode>,
    /// Un-stuffed lines of a multi-line block, without the terminator.
    pub data: Vec<String>,
    /// Raw lines as received, status line first.
    pub lines: Vec<String>,
}

impl Response {
    /// Returns true for `+OK`.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Returns `Ok(self)` for `+OK`, otherwise a rejection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rejected`]; `[IN-USE]` and `[SYS/TEMP]` rejections
    /// are retryable.
    pub fn expect_ok(self, command: &str) -> Result<Self, Error> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(self.rejection(command))
        }
    }

    /// Builds the rejection error for this response.
    #[must_use]
    pub fn rejection(&self, command: &str) -> Error {
        let actual = match &self.code {
            Some(code) => format!("{} [{code}]", self.status),
            None => self.status.to_string(),
        };
        Error::rejected(
            command,
            Status::Ok.as_str(),
            actual,
            self.message.clone(),
            self.code.as_ref().is_some_and(ResponseCode::is_transient),
        )
    }
}
