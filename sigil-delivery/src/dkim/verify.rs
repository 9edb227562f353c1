use std::collections::HashMap;

use base64::{Engine, engine::general_purpose::STANDARD};
use rsa::{
    RsaPublicKey,
    pkcs1v15::{Signature, VerifyingKey},
    signature::Verifier,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{
    Canonicalization,
    canonicalization::{Header, ParsedMessage, normalize_line_endings},
};

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("Message has no DKIM-Signature field")]
    MissingSignature,

    #[error("Malformed DKIM-Signature: {0}")]
    Malformed(String),

    #[error("Unsupported signing algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("Body hash does not match")]
    BodyHashMismatch,

    #[error("Signature does not verify")]
    BadSignature,
}

fn unfold(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .chars()
        .filter(|&c| c != '\r' && c != '\n')
        .collect()
}

/// The tag list of a `DKIM-Signature` field.
fn tags(field: &Header<'_>) -> Result<HashMap<String, String>, VerificationError> {
    let value = field
        .raw
        .iter()
        .position(|&b| b == b':')
        .map(|colon| &field.raw[colon + 1..])
        .ok_or_else(|| VerificationError::Malformed("no value".to_string()))?;

    let mut tags = HashMap::new();
    for spec in unfold(value).split(';') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        let (name, value) = spec
            .split_once('=')
            .ok_or_else(|| VerificationError::Malformed(format!("tag without '=': {spec}")))?;
        let name = name.trim().to_string();
        if tags.contains_key(&name) {
            return Err(VerificationError::Malformed(format!("duplicate tag {name}")));
        }
        tags.insert(name, value.trim().to_string());
    }
    Ok(tags)
}

/// The field with the `b=` value removed, as it was when it was signed.
fn without_signature(raw: &[u8]) -> Vec<u8> {
    let Some(colon) = raw.iter().position(|&b| b == b':') else {
        return raw.to_vec();
    };

    let mut out = raw[..=colon].to_vec();
    for (idx, spec) in raw[colon + 1..].split(|&b| b == b';').enumerate() {
        if idx > 0 {
            out.push(b';');
        }
        let name = spec
            .iter()
            .position(|&b| b == b'=')
            .map(|eq| (eq, &spec[..eq]));
        match name {
            Some((eq, name)) if name.trim_ascii() == b"b" => out.extend_from_slice(&spec[..=eq]),
            _ => out.extend_from_slice(spec),
        }
    }
    out
}

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Verifies the first `DKIM-Signature` of `message` against `key`.
///
/// Only what the signer produces is supported: `a=rsa-sha256`, no `l=`.
///
/// # Errors
///
/// A `VerificationError` describing the first check that failed.
pub fn verify(message: &[u8], key: &RsaPublicKey) -> Result<(), VerificationError> {
    let message = normalize_line_endings(message);
    let parsed = ParsedMessage::parse(&message)
        .ok_or_else(|| VerificationError::Malformed("no header section".to_string()))?;

    let (position, field) = parsed
        .headers
        .iter()
        .enumerate()
        .find(|(_, header)| header.is("dkim-signature"))
        .ok_or(VerificationError::MissingSignature)?;
    let tags = tags(field)?;
    let tag = |name: &str| {
        tags.get(name)
            .map(String::as_str)
            .ok_or_else(|| VerificationError::Malformed(format!("missing {name}= tag")))
    };

    if tag("v")? != "1" {
        return Err(VerificationError::Malformed("v= must be 1".to_string()));
    }
    let algorithm = tag("a")?;
    if algorithm != "rsa-sha256" {
        return Err(VerificationError::UnsupportedAlgorithm(algorithm.to_string()));
    }
    if tags.contains_key("l") {
        return Err(VerificationError::Malformed("l= is not supported".to_string()));
    }

    let (header_canonicalization, body_canonicalization) = {
        let c = tags.get("c").map_or("simple/simple", String::as_str);
        let (header, body) = c.split_once('/').unwrap_or((c, "simple"));
        (
            header.parse::<Canonicalization>().map_err(VerificationError::Malformed)?,
            body.parse::<Canonicalization>().map_err(VerificationError::Malformed)?,
        )
    };

    let body_hash = STANDARD.encode(Sha256::digest(body_canonicalization.body(parsed.body)));
    if body_hash != strip_whitespace(tag("bh")?) {
        return Err(VerificationError::BodyHashMismatch);
    }

    // Each listed name takes the next unused instance from the bottom up
    let mut used: HashMap<String, usize> = HashMap::new();
    let mut input = Vec::new();
    for name in strip_whitespace(tag("h")?).split(':') {
        let name = name.to_ascii_lowercase();
        let skip = used.entry(name.clone()).or_default();
        let instance = parsed
            .headers
            .iter()
            .enumerate()
            .rev()
            .filter(|(idx, header)| *idx != position && header.is(&name))
            .nth(*skip);
        *skip += 1;

        if let Some((_, header)) = instance {
            input.extend(header_canonicalization.header(header.raw));
        }
    }

    let mut own = header_canonicalization.header(&without_signature(field.raw));
    own.truncate(own.len() - 2);
    input.extend(own);

    let signature = STANDARD
        .decode(strip_whitespace(tag("b")?))
        .map_err(|e| VerificationError::Malformed(format!("b=: {e}")))?;
    let signature = Signature::try_from(signature.as_slice())
        .map_err(|e| VerificationError::Malformed(format!("b=: {e}")))?;

    VerifyingKey::<Sha256>::new(key.clone())
        .verify(&input, &signature)
        .map_err(|_| VerificationError::BadSignature)
}
