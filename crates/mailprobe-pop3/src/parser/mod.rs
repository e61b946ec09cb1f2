//! POP3 response parser.
//!
//! A response starts with a status line (`+OK`, `-ERR`, or a bare `+`
//! continuation during SASL). After `+OK` to a multi-line command, data
//! lines follow until a line holding a single `.`; a stuffed data line
//! starting with `..` is un-stuffed here.

use mailprobe_wire::{Error, Result};

use crate::types::{Response, ResponseCode, Status};

/// Parses a status line into a single-line response.
///
/// # Errors
///
/// Returns [`Error::Parse`] if the line does not start with `+OK`, `-ERR`
/// or a `+` continuation.
pub fn parse_status_line(line: String) -> Result<Response> {
    let (status, rest) = split_status(&line)
        .ok_or_else(|| Error::Parse(format!("invalid POP3 status line: {line:?}")))?;

    let (code, message) = if status == Status::Err {
        parse_response_code(rest)
    } else {
        (None, rest)
    };
    let message = message.to_string();

    Ok(Response {
        status,
        message,
        code,
        data: Vec::new(),
        lines: vec![line],
    })
}

fn split_status(line: &str) -> Option<(Status, &str)> {
    for (indicator, status) in [("+OK", Status::Ok), ("-ERR", Status::Err)] {
        if let Some(prefix) = line.get(..indicator.len()) {
            if prefix.eq_ignore_ascii_case(indicator) {
                let rest = &line[indicator.len()..];
                if rest.is_empty() || rest.starts_with(' ') {
                    return Some((status, rest.trim_start()));
                }
            }
        }
    }
    match line.strip_prefix('+') {
        Some("") => Some((Status::Continue, "")),
        Some(rest) if rest.starts_with(' ') => Some((Status::Continue, rest.trim_start())),
        _ => None,
    }
}

/// Splits a leading `[CODE]` off the text of an `-ERR` line.
#[must_use]
pub fn parse_response_code(text: &str) -> (Option<ResponseCode>, &str) {
    let Some(inner) = text.strip_prefix('[') else {
        return (None, text);
    };
    match inner.split_once(']') {
        Some((code, rest)) if !code.is_empty() && !code.contains(' ') => {
            (Some(ResponseCode::parse(code)), rest.trim_start())
        }
        _ => (None, text),
    }
}

/// Removes the dot-stuffing of one data line: `..x` decodes to `x`.
///
/// Lines with at most one leading dot pass through unchanged.
#[must_use]
pub fn unstuff(line: &str) -> &str {
    line.strip_prefix("..").unwrap_or(line)
}

/// Returns true for the block terminator line.
#[must_use]
pub fn is_terminator(line: &str) -> bool {
    line == "."
}

/// Collects the data lines of a multi-line response.
#[derive(Debug, Default)]
pub struct BlockAccumulator {
    data: Vec<String>,
    raw: Vec<String>,
}

impl BlockAccumulator {
    /// Creates an empty accumulator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            data: Vec::new(),
            raw: Vec::new(),
        }
    }

    /// Adds one line. Returns true once the terminator was seen.
    pub fn push(&mut self, line: String) -> bool {
        let done = is_terminator(&line);
        if !done {
            self.data.push(unstuff(&line).to_string());
        }
        self.raw.push(line);
        done
    }

    /// Attaches the collected block to its status response.
    #[must_use]
    pub fn finish(self, mut response: Response) -> Response {
        response.data = self.data;
        response.lines.extend(self.raw);
        response
    }
}

/// Parses a complete response from already received lines.
///
/// With `multiline`, a `+OK` status line must be followed by a terminated
/// block. An `-ERR` is always a single line.
///
/// # Errors
///
/// Returns [`Error::Parse`] on an empty input, an invalid status line, a
/// missing terminator or lines after the end of the response.
pub fn parse_response(lines: &[String], multiline: bool) -> Result<Response> {
    let (first, rest) = lines
        .split_first()
        .ok_or_else(|| Error::Parse("empty POP3 response".into()))?;
    let response = parse_status_line(first.clone())?;

    if !(multiline && response.is_ok()) {
        if !rest.is_empty() {
            return Err(Error::Parse(format!(
                "{} unexpected line(s) after single-line response",
                rest.len()
            )));
        }
        return Ok(response);
    }

    let mut block = BlockAccumulator::new();
    let mut iter = rest.iter();
    for line in iter.by_ref() {
        if block.push(line.clone()) {
            if iter.next().is_some() {
                return Err(Error::Parse("data after block terminator".into()));
            }
            return Ok(block.finish(response));
        }
    }
    Err(Error::Parse("multi-line response missing terminator".into()))
}
