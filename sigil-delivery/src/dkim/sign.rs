use std::sync::Arc;

use base64::{Engine, engine::general_purpose::STANDARD};
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1v15::SigningKey,
    signature::{SignatureEncoding, Signer},
};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{
    Canonicalization, DkimConfig, KeyError, MessageSigner, SignedMessage, SigningError,
    canonicalization::{ParsedMessage, normalize_line_endings},
    load_private_key,
};

/// The process-wide signing identity. Built once at startup and never changed.
pub struct SigningIdentity {
    pub domain: String,
    pub selector: String,
    pub header_canonicalization: Canonicalization,
    pub body_canonicalization: Canonicalization,
    /// Lowercased names of the header fields to sign.
    pub headers: Vec<String>,
    pub expire_secs: Option<u64>,
    key: RsaPrivateKey,
}

impl core::fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("domain", &self.domain)
            .field("selector", &self.selector)
            .field("header_canonicalization", &self.header_canonicalization)
            .field("body_canonicalization", &self.body_canonicalization)
            .field("headers", &self.headers)
            .field("expire_secs", &self.expire_secs)
            .finish_non_exhaustive()
    }
}

impl SigningIdentity {
    /// An identity with relaxed/relaxed canonicalization and the default header list.
    pub fn new(domain: impl Into<String>, selector: impl Into<String>, key: RsaPrivateKey) -> Self {
        Self {
            domain: domain.into(),
            selector: selector.into(),
            header_canonicalization: Canonicalization::Relaxed,
            body_canonicalization: Canonicalization::Relaxed,
            headers: Vec::new(),
            expire_secs: None,
            key,
        }
        .with_headers(super::defaults::headers())
    }

    /// Loads the key named in `config`.
    ///
    /// # Errors
    ///
    /// A `KeyError` if the key file is missing, unreadable or not an RSA key.
    pub fn from_config(config: &DkimConfig) -> Result<Self, KeyError> {
        let key = load_private_key(&config.private_key)?;

        Ok(Self::new(config.domain.clone(), config.selector.clone(), key)
            .with_canonicalization(config.header_canonicalization, config.body_canonicalization)
            .with_headers(config.headers.clone())
            .with_expiry(config.expire_secs))
    }

    #[must_use]
    pub const fn with_canonicalization(
        mut self,
        header: Canonicalization,
        body: Canonicalization,
    ) -> Self {
        self.header_canonicalization = header;
        self.body_canonicalization = body;
        self
    }

    /// Sets the signed header list. `from` is added when missing.
    #[must_use]
    pub fn with_headers(mut self, headers: impl IntoIterator<Item = String>) -> Self {
        let mut names: Vec<String> = Vec::new();
        for name in headers {
            let name = name.trim().to_ascii_lowercase();
            if !name.is_empty() && !names.contains(&name) {
                names.push(name);
            }
        }
        if !names.iter().any(|name| name == "from") {
            names.insert(0, "from".to_string());
        }
        self.headers = names;
        self
    }

    #[must_use]
    pub const fn with_expiry(mut self, expire_secs: Option<u64>) -> Self {
        self.expire_secs = expire_secs;
        self
    }

    #[must_use]
    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }
}

/// Signs with a [`SigningIdentity`].
#[derive(Debug, Clone)]
pub struct DkimSigner {
    identity: Arc<SigningIdentity>,
    key: SigningKey<Sha256>,
}

impl DkimSigner {
    pub fn new(identity: Arc<SigningIdentity>) -> Self {
        let key = SigningKey::<Sha256>::new(identity.key.clone());
        Self { identity, key }
    }

    #[must_use]
    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    /// Signs with `t=` set to `timestamp` (seconds since the epoch).
    ///
    /// Line endings are normalized to CRLF first; the result is the
    /// normalized message with the `DKIM-Signature` field in front.
    ///
    /// # Errors
    ///
    /// Fails if the message has no header section or no `From` field, or if
    /// the RSA operation fails.
    pub fn sign_at(&self, message: &[u8], timestamp: i64) -> Result<SignedMessage, SigningError> {
        let identity = &self.identity;
        let message = normalize_line_endings(message);
        let parsed = ParsedMessage::parse(&message).ok_or(SigningError::NoHeaderSection)?;

        if !parsed.headers.iter().any(|header| header.is("from")) {
            return Err(SigningError::MissingFrom);
        }

        let body_hash = STANDARD.encode(Sha256::digest(
            identity.body_canonicalization.body(parsed.body),
        ));

        let selected = parsed.select(identity.headers.iter().map(String::as_str));
        let signed_names: Vec<&str> = selected.iter().map(|(name, _)| *name).collect();

        let mut field = format!(
            "DKIM-Signature: v=1; a=rsa-sha256; c={}/{}; d={}; s={};\r\n\tt={timestamp};",
            identity.header_canonicalization,
            identity.body_canonicalization,
            identity.domain,
            identity.selector,
        );
        if let Some(expire) = identity.expire_secs {
            let expiry = timestamp.saturating_add(i64::try_from(expire).unwrap_or(i64::MAX));
            field.push_str(&format!(" x={expiry};"));
        }
        field.push_str(&format!(
            "\r\n\th={};\r\n\tbh={body_hash};\r\n\tb=",
            signed_names.join(":")
        ));

        let mut signing_input = Vec::new();
        for (_, header) in &selected {
            signing_input.extend(identity.header_canonicalization.header(header.raw));
        }
        let mut own = identity.header_canonicalization.header(field.as_bytes());
        own.truncate(own.len() - 2);
        signing_input.extend(own);

        let signature = self
            .key
            .try_sign(&signing_input)
            .map_err(|e| SigningError::Rsa(e.to_string()))?;
        field.push_str(&STANDARD.encode(signature.to_bytes()));
        field.push_str("\r\n");

        debug!(
            domain = %identity.domain,
            selector = %identity.selector,
            headers = %signed_names.join(":"),
            "Signed message"
        );

        let mut signed = Vec::with_capacity(field.len() + message.len());
        signed.extend_from_slice(field.as_bytes());
        signed.extend_from_slice(&message);
        Ok(SignedMessage::new(signed))
    }
}

impl MessageSigner for DkimSigner {
    fn sign(&self, message: &[u8]) -> Result<SignedMessage, SigningError> {
        self.sign_at(message, chrono::Utc::now().timestamp())
    }
}

/// Sends messages as submitted, for relays without a signing key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unsigned;

impl MessageSigner for Unsigned {
    fn sign(&self, message: &[u8]) -> Result<SignedMessage, SigningError> {
        Ok(SignedMessage::new(normalize_line_endings(message)))
    }
}
