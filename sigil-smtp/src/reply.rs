use core::fmt::{self, Display, Formatter};

/// A reply to send to a submission client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    #[must_use]
    pub const fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// The reply as it goes on the wire, e.g. `250-first\r\n250 last\r\n`.
    #[must_use]
    pub fn to_wire(&self) -> String {
        if self.lines.is_empty() {
            return format!("{}\r\n", self.code);
        }

        let last = self.lines.len() - 1;
        self.lines
            .iter()
            .enumerate()
            .map(|(idx, line)| {
                let separator = if idx == last { ' ' } else { '-' };
                format!("{}{separator}{line}\r\n", self.code)
            })
            .collect()
    }
}

impl Display for Reply {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" / "))
    }
}
