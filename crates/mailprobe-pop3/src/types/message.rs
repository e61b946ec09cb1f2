//! Maildrop listing types.

use mailprobe_wire::{Error, Result};
use serde::Serialize;

/// Maildrop summary from `STAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stat {
    /// Number of messages.
    pub count: u32,
    /// Total size in octets.
    pub size: u64,
}

impl Stat {
    /// Parses the text after `+OK`, e.g. `2 320`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the two numbers are missing.
    pub fn parse(text: &str) -> Result<Self> {
        let mut fields = text.split_whitespace();
        let count = numeric(fields.next(), "STAT count", text)?;
        let size = numeric(fields.next(), "STAT size", text)?;
        Ok(Self { count, size })
    }
}

/// One message of the maildrop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageInfo {
    /// Message number (1-based, valid for this session).
    pub number: u32,
    /// Size in octets.
    pub size: u64,
    /// Unique-id from `UIDL`, when available.
    pub uid: Option<String>,
}

/// Parses a `LIST` scan line `number size`.
///
/// # Errors
///
/// Returns [`Error::Parse`] if either field is missing or not a number.
pub fn parse_list_line(line: &str) -> Result<MessageInfo> {
    let mut fields = line.split_whitespace();
    let number = numeric(fields.next(), "message number", line)?;
    let size = numeric(fields.next(), "message size", line)?;
    Ok(MessageInfo {
        number,
        size,
        uid: None,
    })
}

/// Parses a `UIDL` line `number unique-id`.
///
/// # Errors
///
/// Returns [`Error::Parse`] if either field is missing.
pub fn parse_uidl_line(line: &str) -> Result<(u32, String)> {
    let mut fields = line.split_whitespace();
    let number = numeric(fields.next(), "message number", line)?;
    let uid = fields
        .next()
        .ok_or_else(|| Error::Parse(format!("missing unique-id in {line:?}")))?;
    Ok((number, uid.to_string()))
}

fn numeric<T: std::str::FromStr>(field: Option<&str>, what: &str, line: &str) -> Result<T> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| Error::Parse(format!("invalid {what} in {line:?}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    #[test]
    fn stat() {
        assert_eq!(Stat::parse("2 320").unwrap(), Stat { count: 2, size: 320 });
        assert_eq!(Stat::parse("0 0 extra").unwrap().count, 0);
        assert!(Stat::parse("2").is_err());
        assert!(Stat::parse("two 320").is_err());
    }

    #[test]
    fn list_and_uidl_lines() {
        let info = parse_list_line("1 120").unwrap();
        assert_eq!((info.number, info.size), (1, 120));
        assert!(parse_list_line("1").is_err());

        assert_eq!(
            parse_uidl_line("2 QhdPYR:00WBw1Ph7x7").unwrap(),
            (2, "QhdPYR:00WBw1Ph7x7".to_string())
        );
        assert!(parse_uidl_line("2").is_err());
    }
}
