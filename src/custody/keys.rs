//! Key material wrappers.
//!
//! None of these types implement `Display` or `Serialize` over plaintext;
//! `Debug` output is redacted.

use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

use crate::custody::CustodyError;

/// Minimum master secret length in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Process-wide master secret used to derive the key-encryption key.
pub struct MasterSecret(SecretBox<Vec<u8>>);

impl MasterSecret {
    /// Wrap raw secret bytes, rejecting anything shorter than [`MIN_SECRET_LEN`].
    pub fn new(bytes: Vec<u8>) -> Result<Self, CustodyError> {
        if bytes.len() < MIN_SECRET_LEN {
            return Err(CustodyError::Encryption(format!(
                "master secret must be at least {} bytes, got {}",
                MIN_SECRET_LEN,
                bytes.len()
            )));
        }
        Ok(Self(SecretBox::new(Box::new(bytes))))
    }

    /// Load the secret from the named environment variable.
    pub fn from_env(var: &str) -> Result<Self, CustodyError> {
        let value = std::env::var(var).map_err(|_| {
            CustodyError::Encryption(format!("environment variable {} not set", var))
        })?;
        Self::new(value.into_bytes())
    }

    pub(crate) fn expose(&self) -> &[u8] {
        self.0.expose_secret()
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret([REDACTED])")
    }
}

/// A plaintext secp256k1 private key. Zeroized on drop.
pub struct PrivateKey(Zeroizing<[u8; 32]>);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Copy from a slice; fails unless exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CustodyError> {
        if bytes.len() != 32 {
            return Err(CustodyError::Decryption(format!(
                "invalid private key length: {}",
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0[..] == other.0[..]
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

/// Versioned, base64-encoded ciphertext of a private key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedKey(String);

impl EncryptedKey {
    pub fn new(blob: String) -> Self {
        Self(blob)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EncryptedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptedKey({} chars)", self.0.len())
    }
}
