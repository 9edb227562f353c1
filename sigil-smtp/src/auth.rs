//! AUTH PLAIN (RFC 4616) against a static credentials file.

use std::{collections::HashMap, path::Path};

use base64::{Engine, engine::general_purpose::STANDARD};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unable to read credentials from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid credentials file {path}: line {line} is not 'user:password'")]
    Format { path: String, line: usize },

    #[error("Malformed AUTH PLAIN response: {0}")]
    Malformed(String),

    #[error("Authentication credentials invalid")]
    InvalidCredentials,
}

impl AuthError {
    /// The reply code a session sends for this error.
    #[must_use]
    pub const fn reply_code(&self) -> u16 {
        match self {
            Self::Malformed(_) => 501,
            Self::InvalidCredentials => 535,
            Self::Read { .. } | Self::Format { .. } => 454,
        }
    }
}

/// Accounts allowed to submit mail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    accounts: HashMap<String, String>,
}

impl Credentials {
    /// Loads `user:password` lines. Blank lines and lines starting with `#`
    /// are skipped; the password is everything after the first `:`.
    ///
    /// # Errors
    ///
    /// Fails if the file can't be read or a line has no `:`.
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let contents = std::fs::read_to_string(path).map_err(|source| AuthError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let mut accounts = HashMap::new();
        for (idx, line) in contents.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }

            let (user, password) = line
                .split_once(':')
                .filter(|(user, _)| !user.trim().is_empty())
                .ok_or_else(|| AuthError::Format {
                    path: path.display().to_string(),
                    line: idx + 1,
                })?;
            accounts.insert(user.trim().to_string(), password.to_string());
        }

        Ok(Self { accounts })
    }

    pub fn from_pairs<U, P>(pairs: impl IntoIterator<Item = (U, P)>) -> Self
    where
        U: Into<String>,
        P: Into<String>,
    {
        Self {
            accounts: pairs
                .into_iter()
                .map(|(user, password)| (user.into(), password.into()))
                .collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Checks a base64 `authzid NUL authcid NUL password` response and
    /// returns the authenticated user.
    ///
    /// An authorization identity other than the user itself is refused.
    ///
    /// # Errors
    ///
    /// `Malformed` if the response does not decode, `InvalidCredentials` otherwise.
    pub fn verify_plain(&self, response: &str) -> Result<String, AuthError> {
        let decoded = STANDARD
            .decode(response.trim())
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| AuthError::Malformed("response is not UTF-8".to_string()))?;

        let mut parts = decoded.split('\0');
        let (Some(authzid), Some(user), Some(password), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed(
                "expected authzid\\0user\\0password".to_string(),
            ));
        };

        if !authzid.is_empty() && authzid != user {
            return Err(AuthError::InvalidCredentials);
        }

        match self.accounts.get(user) {
            Some(expected) if expected == password => Ok(user.to_string()),
            _ => Err(AuthError::InvalidCredentials),
        }
    }
}
