//! Argument sanitizing for line-oriented commands.
//!
//! Every textual argument that ends up on a command line goes through
//! [`sanitize`] first, so user-controlled input (usernames, passwords,
//! addresses, subjects) can never terminate a line early and smuggle a
//! second command onto the wire.

use std::borrow::Cow;

/// Strips every `\r` and `\n` byte from an argument.
///
/// Borrows when there is nothing to strip.
#[must_use]
pub fn sanitize(arg: &str) -> Cow<'_, str> {
    if arg.contains(['\r', '\n']) {
        Cow::Owned(arg.chars().filter(|c| !matches!(c, '\r' | '\n')).collect())
    } else {
        Cow::Borrowed(arg)
    }
}

/// Builds a CRLF-terminated command line from a verb and sanitized arguments.
///
/// Empty arguments are skipped so a missing optional argument never leaves a
/// trailing space.
#[must_use]
pub fn command_line(verb: &str, args: &[&str]) -> Vec<u8> {
    let mut line = Vec::with_capacity(verb.len() + 2 + args.iter().map(|a| a.len() + 1).sum::<usize>());
    line.extend_from_slice(sanitize(verb).as_bytes());
    for arg in args {
        let arg = sanitize(arg);
        if arg.is_empty() {
            continue;
        }
        line.push(b' ');
        line.extend_from_slice(arg.as_bytes());
    }
    line.extend_from_slice(b"\r\n");
    line
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::redundant_clone, clippy::manual_string_new, clippy::needless_collect, clippy::unreadable_literal, clippy::used_underscore_items, clippy::similar_names)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn clean_input_is_borrowed() {
        assert!(matches!(sanitize("user@example.com"), Cow::Borrowed(_)));
    }

    #[test]
    fn strips_crlf() {
        assert_eq!(sanitize("evil\r\nRSET"), "evilRSET");
        assert_eq!(sanitize("\n\r"), "");
    }

    #[test]
    fn command_line_joins_arguments() {
        assert_eq!(command_line("USER", &["alice"]), b"USER alice\r\n");
        assert_eq!(command_line("QUIT", &[]), b"QUIT\r\n");
        assert_eq!(command_line("TOP", &["1", "10"]), b"TOP 1 10\r\n");
    }

    #[test]
    fn command_line_skips_emptied_arguments() {
        assert_eq!(command_line("NOOP", &["\r\n"]), b"NOOP\r\n");
    }

    proptest! {
        #[test]
        fn encoded_line_has_single_terminator(arg in ".*[\r\n].*", verb in "[A-Z]{4}") {
            let line = command_line(&verb, &[&arg, "tail\r\nRSET"]);
            let body = &line[..line.len() - 2];
            prop_assert!(line.ends_with(b"\r\n"));
            prop_assert!(!body.contains(&b'\r'));
            prop_assert!(!body.contains(&b'\n'));
        }
    }
}
