//-
// Copyright (c) 2024, the Mdsync contributors
//
// This file is part of Mdsync.
//
// Mdsync is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Mdsync is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mdsync. If not, see <http://www.gnu.org/licenses/>.

//! The interface to message header parsing.
//!
//! The maildir engine does not care about message content beyond the location
//! of the body and a few envelope fields for callers; anything more is the
//! business of a `HeaderParser` implementation.

use std::io::{self, BufRead};

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

/// The handful of header fields callers commonly need without reopening the
/// message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub subject: Option<String>,
    pub from: Option<String>,
    pub message_id: Option<String>,
    pub date: Option<DateTime<FixedOffset>>,
}

/// The result of parsing a message header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedHeader {
    pub envelope: Envelope,
    /// Offset of the first byte of the body.
    pub body_offset: u64,
    /// Length of the body, in bytes.
    pub body_length: u64,
}

pub trait HeaderParser {
    /// Parse the header of a message `size` bytes long, reading from `src`,
    /// which is positioned at the start of the message.
    fn parse(&self, src: &mut dyn BufRead, size: u64)
        -> io::Result<ParsedHeader>;
}

/// Parses plain RFC 5322 headers.
#[derive(Clone, Copy, Debug, Default)]
pub struct Rfc822Parser;

impl HeaderParser for Rfc822Parser {
    fn parse(
        &self,
        src: &mut dyn BufRead,
        size: u64,
    ) -> io::Result<ParsedHeader> {
        let mut envelope = Envelope::default();
        let mut offset = 0u64;
        let mut line = Vec::new();
        let mut current: Option<(String, String)> = None;

        loop {
            line.clear();
            let nread = src.read_until(b'\n', &mut line)?;
            if 0 == nread {
                break;
            }
            offset += nread as u64;

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(|c: char| '\r' == c || '\n' == c);
            if text.is_empty() {
                break;
            }

            if text.starts_with(' ') || text.starts_with('\t') {
                // Continuation of a folded header
                if let Some((_, ref mut value)) = current {
                    value.push(' ');
                    value.push_str(text.trim());
                }
                continue;
            }

            if let Some((name, value)) = current.take() {
                apply_header(&mut envelope, &name, value);
            }

            if let Some(colon) = text.find(':') {
                current = Some((
                    text[..colon].trim().to_owned(),
                    text[colon + 1..].trim().to_owned(),
                ));
            }
        }

        if let Some((name, value)) = current.take() {
            apply_header(&mut envelope, &name, value);
        }

        Ok(ParsedHeader {
            envelope,
            body_offset: offset,
            body_length: size.saturating_sub(offset),
        })
    }
}

fn apply_header(envelope: &mut Envelope, name: &str, value: String) {
    if name.eq_ignore_ascii_case("subject") {
        envelope.subject = Some(value);
    } else if name.eq_ignore_ascii_case("from") {
        envelope.from = Some(value);
    } else if name.eq_ignore_ascii_case("message-id") {
        envelope.message_id = Some(value);
    } else if name.eq_ignore_ascii_case("date") {
        envelope.date = parse_date(&value);
    }
}

fn parse_date(value: &str) -> Option<DateTime<FixedOffset>> {
    // Strip trailing comments like "(UTC)", which the RFC 2822 parser rejects
    let value = match value.find('(') {
        Some(paren) => value[..paren].trim(),
        None => value.trim(),
    };
    DateTime::parse_from_rfc2822(value).ok()
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(text: &str) -> ParsedHeader {
        Rfc822Parser
            .parse(&mut text.as_bytes(), text.len() as u64)
            .unwrap()
    }

    #[test]
    fn parse_simple_header() {
        let text = "From: alice@example.com\r\n\
                    Subject: Hello\r\n\
                    \tworld\r\n\
                    Message-ID: <1@example.com>\r\n\
                    Date: Tue, 1 Jul 2003 10:52:37 +0200 (CEST)\r\n\
                    \r\n\
                    body\r\n";
        let parsed = parse(text);
        assert_eq!(Some("alice@example.com"), parsed.envelope.from.as_deref());
        assert_eq!(Some("Hello world"), parsed.envelope.subject.as_deref());
        assert_eq!(
            Some("<1@example.com>"),
            parsed.envelope.message_id.as_deref()
        );
        assert_eq!(
            Some(
                FixedOffset::east(7200)
                    .ymd(2003, 7, 1)
                    .and_hms(10, 52, 37)
            ),
            parsed.envelope.date
        );
        assert_eq!(text.len() as u64 - 6, parsed.body_offset);
        assert_eq!(6, parsed.body_length);
    }

    #[test]
    fn parse_headers_only() {
        let text = "Subject: foo\n";
        let parsed = parse(text);
        assert_eq!(Some("foo"), parsed.envelope.subject.as_deref());
        assert_eq!(text.len() as u64, parsed.body_offset);
        assert_eq!(0, parsed.body_length);
    }

    #[test]
    fn bad_date_is_ignored() {
        let parsed = parse("Date: yesterday\n\n");
        assert_eq!(None, parsed.envelope.date);
    }
}
