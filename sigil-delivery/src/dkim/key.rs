//! Loading the RSA signing key.

use std::path::Path;

use rsa::{RsaPrivateKey, pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey};
use rustls_pemfile::Item;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Unable to read private key {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No RSA private key found in {0}")]
    NotFound(String),

    #[error("Malformed private key: {0}")]
    Malformed(String),
}

/// Parses the first RSA private key in a PEM document. Both PKCS#1
/// (`BEGIN RSA PRIVATE KEY`) and PKCS#8 (`BEGIN PRIVATE KEY`) are accepted.
///
/// # Errors
///
/// `NotFound` if the document holds no private key, `Malformed` if it can't be decoded.
pub fn parse_private_key(pem: &[u8], origin: &str) -> Result<RsaPrivateKey, KeyError> {
    let mut reader = pem;

    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|e| KeyError::Malformed(format!("{origin}: {e}")))?
        {
            Some(Item::Pkcs1Key(key)) => {
                return RsaPrivateKey::from_pkcs1_der(key.secret_pkcs1_der())
                    .map_err(|e| KeyError::Malformed(format!("{origin}: {e}")));
            }
            Some(Item::Pkcs8Key(key)) => {
                return RsaPrivateKey::from_pkcs8_der(key.secret_pkcs8_der())
                    .map_err(|e| KeyError::Malformed(format!("{origin}: {e}")));
            }
            Some(_) => {}
            None => return Err(KeyError::NotFound(origin.to_string())),
        }
    }
}

/// Reads and parses the key at `path`.
///
/// # Errors
///
/// See [`parse_private_key`]; also fails if the file can't be read.
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, KeyError> {
    let origin = path.display().to_string();
    let pem = std::fs::read(path).map_err(|source| KeyError::Read {
        path: origin.clone(),
        source,
    })?;

    let key = parse_private_key(&pem, &origin)?;
    key.validate()
        .map_err(|e| KeyError::Malformed(format!("{origin}: {e}")))?;
    Ok(key)
}
