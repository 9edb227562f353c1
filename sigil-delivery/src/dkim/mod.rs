//! DKIM (RFC 6376) signing with RSA-SHA256.
//!
//! A message is signed once, before any delivery, and the signed bytes are
//! shared by every recipient's delivery.

mod canonicalization;
mod key;
mod sign;
mod verify;

use std::{path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use canonicalization::{Canonicalization, Header, ParsedMessage, normalize_line_endings};
pub use key::{KeyError, load_private_key, parse_private_key};
pub use sign::{DkimSigner, SigningIdentity, Unsigned};
pub use verify::{VerificationError, verify};

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("Message has no header section")]
    NoHeaderSection,

    #[error("Message has no From header")]
    MissingFrom,

    #[error("RSA signing failed: {0}")]
    Rsa(String),
}

/// The bytes actually transmitted: the message with its `DKIM-Signature`
/// field prepended. Cloning shares the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage(Arc<[u8]>);

impl SignedMessage {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Produces the signed form of a message.
pub trait MessageSigner: Send + Sync {
    /// # Errors
    ///
    /// A `SigningError` means the message must not be delivered at all.
    fn sign(&self, message: &[u8]) -> Result<SignedMessage, SigningError>;
}

/// Signing settings as they appear in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DkimConfig {
    /// Signing domain (`d=`).
    ///
    /// Default: `example.com`
    #[serde(default = "defaults::domain")]
    pub domain: String,

    /// Selector (`s=`); the public key is published at `<selector>._domainkey.<domain>`.
    ///
    /// Default: `default`
    #[serde(default = "defaults::selector")]
    pub selector: String,

    /// PEM file with the RSA private key, PKCS#1 or PKCS#8.
    pub private_key: PathBuf,

    #[serde(default)]
    pub header_canonicalization: Canonicalization,

    #[serde(default)]
    pub body_canonicalization: Canonicalization,

    /// Header fields to sign, when present. `From` is always signed.
    #[serde(default = "defaults::headers")]
    pub headers: Vec<String>,

    /// Adds an expiry (`x=`) this many seconds after signing.
    #[serde(default)]
    pub expire_secs: Option<u64>,
}

mod defaults {
    pub fn domain() -> String {
        String::from("example.com")
    }

    pub fn selector() -> String {
        String::from("default")
    }

    pub fn headers() -> Vec<String> {
        [
            "from",
            "sender",
            "reply-to",
            "to",
            "cc",
            "subject",
            "date",
            "message-id",
            "in-reply-to",
            "references",
            "mime-version",
            "content-type",
            "content-transfer-encoding",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

/// A 1024 bit key, generated once per test binary.
#[cfg(test)]
pub(crate) fn test_key() -> &'static rsa::RsaPrivateKey {
    static KEY: std::sync::OnceLock<rsa::RsaPrivateKey> = std::sync::OnceLock::new();
    KEY.get_or_init(|| {
        rsa::RsaPrivateKey::new(&mut rsa::rand_core::OsRng, 1024).expect("generate test key")
    })
}
