//! SMTP reply parser.
//!
//! SMTP replies can be single-line or multi-line:
//! - Single: `250 OK\r\n`
//! - Multi: `250-First line\r\n250-Second line\r\n250 Last line\r\n`
//!
//! Every line of a multi-line reply must carry the same code. A malformed
//! status prefix or a code change mid-reply is a fatal [`Error::Parse`].

use mailprobe_wire::{Error, Result};

use crate::types::{Reply, ReplyCode};

/// Upper bound on lines in one reply.
pub const MAX_REPLY_LINES: usize = 1000;

/// One decoded reply line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyLine<'a> {
    /// Reply code.
    pub code: ReplyCode,
    /// True for the final line (separator ` ` or none).
    pub is_last: bool,
    /// Text after the separator.
    pub text: &'a str,
}

/// Parses one reply line.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the line does not start with a three-digit
/// code in the 2xx-5xx range followed by ` `, `-` or end of line.
pub fn parse_reply_line(line: &str) -> Result<ReplyLine<'_>> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return Err(Error::Parse(format!("malformed reply line: {line:?}")));
    }
    if !matches!(bytes[0], b'2'..=b'5') {
        return Err(Error::Parse(format!("reply code out of range: {line:?}")));
    }

    let code = line[..3]
        .parse::<u16>()
        .map_err(|_| Error::Parse(format!("invalid reply code: {line:?}")))?;

    let (is_last, text) = match bytes.get(3) {
        None => (true, ""),
        Some(b' ') => (true, &line[4..]),
        Some(b'-') => (false, &line[4..]),
        Some(_) => {
            return Err(Error::Parse(format!("invalid reply separator: {line:?}")));
        }
    };

    Ok(ReplyLine {
        code: ReplyCode::new(code),
        is_last,
        text,
    })
}

/// Checks if a line is the last line of a multi-line reply.
///
/// Multi-line replies use `-` separator for continuation and ` ` for the last line.
#[must_use]
pub fn is_last_reply_line(line: &str) -> bool {
    parse_reply_line(line).is_ok_and(|parsed| parsed.is_last)
}

/// Accumulates reply lines as they arrive.
#[derive(Debug, Default)]
pub struct ReplyAccumulator {
    code: Option<ReplyCode>,
    message: Vec<String>,
    lines: Vec<String>,
}

impl ReplyAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line; returns the reply once its final line arrived.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] for malformed lines, a code change on a
    /// continuation line, or an oversized reply.
    pub fn push(&mut self, line: String) -> Result<Option<Reply>> {
        let parsed = parse_reply_line(&line)?;

        match self.code {
            Some(code) if code != parsed.code => {
                return Err(Error::Parse(format!(
                    "reply code changed from {code} to {} mid-reply",
                    parsed.code
                )));
            }
            Some(_) => {}
            None => self.code = Some(parsed.code),
        }

        if self.lines.len() >= MAX_REPLY_LINES {
            return Err(Error::Parse(format!(
                "reply exceeds {MAX_REPLY_LINES} lines"
            )));
        }

        let (code, is_last) = (parsed.code, parsed.is_last);
        self.message.push(parsed.text.to_string());
        self.lines.push(line);

        if !is_last {
            return Ok(None);
        }

        self.code = None;
        Ok(Some(Reply::new(
            code,
            std::mem::take(&mut self.message),
            std::mem::take(&mut self.lines),
        )))
    }
}

/// Parses an SMTP reply from complete response lines.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the reply is empty, malformed, or not
/// terminated by a final line.
pub fn parse_reply(lines: &[String]) -> Result<Reply> {
    let mut acc = ReplyAccumulator::new();
    for (i, line) in lines.iter().enumerate() {
        if let Some(reply) = acc.push(line.clone())? {
            if i + 1 != lines.len() {
                return Err(Error::Parse("lines after final reply line".into()));
            }
            return Ok(reply);
        }
    }
    Err(Error::Parse(if lines.is_empty() {
        "empty reply".into()
    } else {
        "reply has no final line".into()
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;

    fn lines(raw: &str) -> Vec<String> {
        raw.split("\r\n")
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_single_line_reply() {
        let reply = parse_reply(&lines("250 OK\r\n")).unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(reply.message, vec!["OK"]);
        assert!(reply.is_success());
    }

    #[test]
    fn test_parse_multi_line_reply() {
        let reply = parse_reply(&lines("250-a\r\n250-b\r\n250 c\r\n")).unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(reply.message, vec!["a", "b", "c"]);
        assert_eq!(reply.lines, vec!["250-a", "250-b", "250 c"]);
    }

    #[test]
    fn test_parse_greeting() {
        let reply = parse_reply(&lines("220 smtp.example.com ESMTP ready")).unwrap();
        assert_eq!(reply.code, ReplyCode::SERVICE_READY);
        assert_eq!(reply.message, vec!["smtp.example.com ESMTP ready"]);
    }

    #[test]
    fn test_bare_code_line() {
        let reply = parse_reply(&lines("354")).unwrap();
        assert_eq!(reply.code, ReplyCode::START_DATA);
        assert_eq!(reply.message, vec![""]);
    }

    #[test]
    fn test_is_last_reply_line() {
        assert!(is_last_reply_line("250 OK"));
        assert!(is_last_reply_line("250"));
        assert!(!is_last_reply_line("250-Continuing"));
        assert!(!is_last_reply_line("garbage"));
    }

    #[test]
    fn test_code_change_is_fatal() {
        let err = parse_reply(&lines("250-a\r\n251 b")).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_reply(&[]).is_err());
        assert!(parse_reply(&lines("25")).is_err());
        assert!(parse_reply(&lines("ABC OK")).is_err());
        assert!(parse_reply(&lines("250_OK")).is_err());
        assert!(parse_reply(&lines("199 too low")).is_err());
        assert!(parse_reply(&lines("250-only continuation")).is_err());
        assert!(parse_reply(&lines("250 done\r\n250 extra")).is_err());
    }

    #[test]
    fn test_accumulator_resets_between_replies() {
        let mut acc = ReplyAccumulator::new();
        assert!(acc.push("250-first".into()).unwrap().is_none());
        let reply = acc.push("250 second".into()).unwrap().unwrap();
        assert_eq!(reply.message.len(), 2);

        let reply = acc.push("354 go".into()).unwrap().unwrap();
        assert_eq!(reply.code, ReplyCode::START_DATA);
        assert_eq!(reply.lines, vec!["354 go"]);
    }
}
