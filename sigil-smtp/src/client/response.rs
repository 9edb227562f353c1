//! SMTP reply parsing.

use core::fmt::{self, Display, Formatter};

use super::error::{ClientError, Result};

/// One line of a (possibly multi-line) SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    /// The SMTP status code (e.g., 220, 250, 550).
    pub code: u16,
    /// `false` for `250-...` continuation lines.
    pub is_last: bool,
    /// The text following the status code and separator.
    pub message: String,
}

/// A complete SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// All text lines joined by newlines.
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    /// 2xx
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    /// 3xx, e.g. `354` after DATA.
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code >= 300 && self.code < 400
    }

    /// Whether an EHLO reply advertises `keyword` (case-insensitive).
    ///
    /// The first line of an EHLO reply is the server's greeting, so it is skipped.
    #[must_use]
    pub fn has_extension(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|word| word.eq_ignore_ascii_case(keyword))
        })
    }

    /// Parses a single reply line (without its line ending).
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the line doesn't match SMTP format.
    pub fn parse_line(line: &str) -> Result<ResponseLine> {
        let (code, rest) = line
            .split_at_checked(3)
            .ok_or_else(|| ClientError::ParseError(format!("Response line too short: '{line}'")))?;

        if !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ClientError::ParseError(format!(
                "Invalid status code: '{code}'"
            )));
        }
        let code = code
            .parse::<u16>()
            .map_err(|e| ClientError::ParseError(format!("Invalid status code '{code}': {e}")))?;

        let mut chars = rest.chars();
        let is_last = match chars.next() {
            None | Some(' ') => true,
            Some('-') => false,
            Some(c) => {
                return Err(ClientError::ParseError(format!(
                    "Invalid separator character: '{c}'"
                )));
            }
        };

        Ok(ResponseLine {
            code,
            is_last,
            message: chars.as_str().to_string(),
        })
    }

    /// Parses the first complete reply in `buffer`.
    ///
    /// Returns the reply and the number of bytes it occupied, or `None` when
    /// more data is needed.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the reply is malformed, or the
    /// lines of a multi-line reply disagree on the status code.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut consumed = 0;
        let mut code = None;
        let mut lines = Vec::new();

        while let Some(newline) = buffer[consumed..].iter().position(|&b| b == b'\n') {
            let raw = &buffer[consumed..consumed + newline];
            consumed += newline + 1;

            let text = std::str::from_utf8(raw)?.trim_end_matches('\r');
            if text.is_empty() {
                continue;
            }

            let line = Self::parse_line(text)?;
            match code {
                Some(expected) if expected != line.code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {expected}, got {}",
                        line.code
                    )));
                }
                Some(_) => {}
                None => code = Some(line.code),
            }

            lines.push(line.message);

            if line.is_last {
                return Ok(code.map(|code| (Self::new(code, lines), consumed)));
            }
        }

        Ok(None)
    }
}

impl Display for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" / "))
    }
}
