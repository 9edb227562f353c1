use core::fmt::{self, Display, Formatter};

use mailparse::MailAddr;

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

impl Display for HeloVariant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ehlo(id) => write!(f, "EHLO {id}"),
            Self::Helo(id) => write!(f, "HELO {id}"),
        }
    }
}

/// A command received from a submission client.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    /// `None` is the null reverse-path (`MAIL FROM:<>`). The second field is
    /// the declared `SIZE=` parameter, if any.
    MailFrom(Option<String>, Option<usize>),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    Auth {
        mechanism: String,
        initial_response: Option<String>,
    },
    /// A known command with bad arguments.
    Invalid(String),
    /// Not a command this server knows.
    Unknown(String),
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(v) => v.fmt(fmt),
            Self::MailFrom(from, size) => {
                write!(fmt, "MAIL FROM:<{}>", from.as_deref().unwrap_or_default())?;
                if let Some(size) = size {
                    write!(fmt, " SIZE={size}")?;
                }
                Ok(())
            }
            Self::RcptTo(rcpt) => write!(fmt, "RCPT TO:<{rcpt}>"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            // Never log credentials
            Self::Auth { mechanism, .. } => write!(fmt, "AUTH {mechanism}"),
            Self::Invalid(s) | Self::Unknown(s) => fmt.write_str(s),
        }
    }
}

/// Strips a case-insensitive `prefix` from `s`.
fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    s.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &s[prefix.len()..])
}

/// Parses a single mailbox, with or without angle brackets.
fn parse_mailbox(text: &str) -> Result<String, String> {
    let addrs = mailparse::addrparse(text).map_err(|e| e.to_string())?;

    match addrs.iter().next() {
        Some(MailAddr::Single(single)) if addrs.len() == 1 => Ok(single.addr.clone()),
        Some(MailAddr::Group(_)) => Err(format!("Group addresses are not allowed: {text}")),
        _ => Err(format!("Expected exactly one address: {text}")),
    }
}

/// Parses `SIZE=` out of the MAIL FROM parameters. Other parameters
/// (`BODY=8BITMIME` and the like) are accepted and ignored.
fn parse_size(params: &str) -> Result<Option<usize>, String> {
    let mut size = None;

    for token in params.split_whitespace() {
        let (key, value) = token.split_once('=').unwrap_or((token, ""));
        if key.eq_ignore_ascii_case("SIZE") {
            if size.is_some() {
                return Err("Duplicate parameter 'SIZE' not allowed".to_string());
            }
            match value.parse::<usize>() {
                Ok(0) => return Err(String::from("SIZE=0 is not allowed")),
                Ok(value) => size = Some(value),
                Err(_) => return Err(format!("Invalid SIZE value: {value}")),
            }
        }
    }

    Ok(size)
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let trimmed = command.trim();

        if let Some(rest) = strip_prefix_ci(trimmed, "MAIL FROM:") {
            let rest = rest.trim();
            let (addr, params) = rest
                .split_once(char::is_whitespace)
                .unwrap_or((rest, ""));

            if addr.is_empty() {
                return Err(Self::Invalid(format!("Expected sender in {trimmed}")));
            }

            let size = parse_size(params).map_err(Self::Invalid)?;

            // mailparse doesn't accept the null reverse-path
            if addr == "<>" {
                return Ok(Self::MailFrom(None, size));
            }

            parse_mailbox(addr)
                .map(|from| Self::MailFrom(Some(from), size))
                .map_err(Self::Invalid)
        } else if let Some(rest) = strip_prefix_ci(trimmed, "RCPT TO:") {
            let rest = rest.trim();
            let addr = rest.split_whitespace().next().unwrap_or_default();
            if addr.is_empty() || addr == "<>" {
                return Err(Self::Invalid(format!("Expected recipient in {trimmed}")));
            }

            parse_mailbox(addr)
                .map(Self::RcptTo)
                .map_err(Self::Invalid)
        } else {
            let (verb, argument) = trimmed
                .split_once(char::is_whitespace)
                .map_or((trimmed, ""), |(verb, argument)| (verb, argument.trim()));

            match verb.to_ascii_uppercase().as_str() {
                "EHLO" | "HELO" if argument.is_empty() => {
                    Err(Self::Invalid(format!("Expected hostname in {trimmed}")))
                }
                "EHLO" => Ok(Self::Helo(HeloVariant::Ehlo(argument.to_string()))),
                "HELO" => Ok(Self::Helo(HeloVariant::Helo(argument.to_string()))),
                "AUTH" => {
                    let mut parts = argument.split_whitespace();
                    parts.next().map_or_else(
                        || Err(Self::Invalid("Expected mechanism in AUTH".to_string())),
                        |mechanism| {
                            Ok(Self::Auth {
                                mechanism: mechanism.to_ascii_uppercase(),
                                initial_response: parts.next().map(ToString::to_string),
                            })
                        },
                    )
                }
                "DATA" if argument.is_empty() => Ok(Self::Data),
                "RSET" if argument.is_empty() => Ok(Self::Rset),
                "QUIT" if argument.is_empty() => Ok(Self::Quit),
                // NOOP may carry an argument that is ignored
                "NOOP" => Ok(Self::Noop),
                "DATA" | "RSET" | "QUIT" => Err(Self::Invalid(format!(
                    "{verb} takes no arguments"
                ))),
                _ => Err(Self::Unknown(trimmed.to_string())),
            }
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Invalid("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}
