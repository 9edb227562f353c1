//! RFC 6376 section 3.4 canonicalization, and the header/body split it works on.

use core::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Canonicalization {
    Simple,
    #[default]
    Relaxed,
}

impl Display for Canonicalization {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simple => "simple",
            Self::Relaxed => "relaxed",
        })
    }
}

impl FromStr for Canonicalization {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            s if s.eq_ignore_ascii_case("simple") => Ok(Self::Simple),
            s if s.eq_ignore_ascii_case("relaxed") => Ok(Self::Relaxed),
            other => Err(format!("Unknown canonicalization '{other}'")),
        }
    }
}

const fn is_wsp(byte: u8) -> bool {
    byte == b' ' || byte == b'\t'
}

/// Replaces every run of whitespace with a single space. With `unfold`,
/// line breaks count as whitespace too.
fn compress_whitespace(input: &[u8], unfold: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut in_space = false;

    for &byte in input {
        if is_wsp(byte) || (unfold && (byte == b'\r' || byte == b'\n')) {
            in_space = true;
        } else {
            if in_space {
                out.push(b' ');
                in_space = false;
            }
            out.push(byte);
        }
    }
    if in_space {
        out.push(b' ');
    }
    out
}

fn trim_wsp(mut input: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = input
        && is_wsp(*first)
    {
        input = rest;
    }
    while let [rest @ .., last] = input
        && is_wsp(*last)
    {
        input = rest;
    }
    input
}

/// Splits a body into lines without their CRLF. A final CRLF does not start
/// another line.
fn lines(body: &[u8]) -> Vec<&[u8]> {
    let mut lines = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        match rest.windows(2).position(|w| w == b"\r\n") {
            Some(end) => {
                lines.push(&rest[..end]);
                rest = &rest[end + 2..];
            }
            None => {
                lines.push(rest);
                break;
            }
        }
    }
    lines
}

impl Canonicalization {
    /// Canonical form of one header field (`raw` is the whole field, folded
    /// lines included, without its final CRLF). The result ends in CRLF.
    #[must_use]
    pub fn header(self, raw: &[u8]) -> Vec<u8> {
        let mut out = match self {
            Self::Simple => raw.to_vec(),
            Self::Relaxed => {
                let colon = raw.iter().position(|&b| b == b':').unwrap_or(raw.len());
                let name = trim_wsp(&raw[..colon]).to_ascii_lowercase();
                let value = raw.get(colon + 1..).unwrap_or_default();
                let value = compress_whitespace(value, true);

                let mut out = name;
                out.push(b':');
                out.extend_from_slice(trim_wsp(&value));
                out
            }
        };
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Canonical form of a CRLF-normalized body.
    #[must_use]
    pub fn body(self, body: &[u8]) -> Vec<u8> {
        let mut lines: Vec<Vec<u8>> = lines(body)
            .into_iter()
            .map(|line| match self {
                Self::Simple => line.to_vec(),
                Self::Relaxed => {
                    let mut line = compress_whitespace(line, false);
                    if line.last() == Some(&b' ') {
                        line.pop();
                    }
                    line
                }
            })
            .collect();

        while lines.last().is_some_and(Vec::is_empty) {
            lines.pop();
        }

        if lines.is_empty() {
            return match self {
                Self::Simple => b"\r\n".to_vec(),
                Self::Relaxed => Vec::new(),
            };
        }

        let mut out = Vec::with_capacity(body.len() + 2);
        for line in lines {
            out.extend_from_slice(&line);
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

/// Rewrites lone LF and lone CR line endings as CRLF.
#[must_use]
pub fn normalize_line_endings(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 32);
    let mut iter = input.iter().copied().peekable();

    while let Some(byte) = iter.next() {
        match byte {
            b'\r' => {
                out.extend_from_slice(b"\r\n");
                if iter.peek() == Some(&b'\n') {
                    iter.next();
                }
            }
            b'\n' => out.extend_from_slice(b"\r\n"),
            other => out.push(other),
        }
    }
    out
}

/// One header field of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header<'a> {
    pub name: &'a [u8],
    /// The whole field including folded continuation lines, without the final CRLF.
    pub raw: &'a [u8],
}

impl Header<'_> {
    #[must_use]
    pub fn is(&self, name: &str) -> bool {
        trim_wsp(self.name).eq_ignore_ascii_case(name.as_bytes())
    }
}

/// A CRLF-normalized message split into header fields and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage<'a> {
    pub headers: Vec<Header<'a>>,
    pub body: &'a [u8],
}

impl<'a> ParsedMessage<'a> {
    /// Splits at the first empty line. `None` when the message does not start
    /// with a header field.
    #[must_use]
    pub fn parse(message: &'a [u8]) -> Option<Self> {
        let mut headers: Vec<Header<'a>> = Vec::new();
        let mut start: Option<usize> = None;
        let mut pos = 0;

        let body = loop {
            if pos >= message.len() {
                break &message[message.len()..];
            }
            if message[pos..].starts_with(b"\r\n") {
                break &message[pos + 2..];
            }

            let line_end = message[pos..]
                .windows(2)
                .position(|w| w == b"\r\n")
                .map_or(message.len(), |offset| pos + offset);
            let line = &message[pos..line_end];

            if is_wsp(line[0]) {
                // Continuation of the previous field
                let field_start = start?;
                let last = headers.last_mut()?;
                last.raw = &message[field_start..line_end];
            } else {
                let colon = line.iter().position(|&b| b == b':')?;
                let name = &line[..colon];
                if trim_wsp(name).is_empty()
                    || trim_wsp(name)
                        .iter()
                        .any(|&b| !(b.is_ascii_graphic()))
                {
                    return None;
                }
                start = Some(pos);
                headers.push(Header { name, raw: line });
            }

            pos = (line_end + 2).min(message.len());
        };

        if headers.is_empty() {
            return None;
        }

        Some(Self { headers, body })
    }

    /// Header fields to sign for `names`: for each name, every instance from
    /// the bottom of the header block up (RFC 6376 section 5.4.2).
    #[must_use]
    pub fn select<'n>(&self, names: impl IntoIterator<Item = &'n str>) -> Vec<(&'n str, Header<'a>)> {
        let mut selected = Vec::new();
        for name in names {
            if selected.iter().any(|(seen, _): &(&str, Header<'_>)| seen.eq_ignore_ascii_case(name)) {
                continue;
            }
            selected.extend(
                self.headers
                    .iter()
                    .rev()
                    .filter(|header| header.is(name))
                    .map(|header| (name, *header)),
            );
        }
        selected
    }
}
