//! Key vault: custody wallet generation and private key encryption.
//!
//! # Scheme
//! - KEK = HKDF-SHA256(master secret, info = "escrow-custody/key-wrap/v1")
//! - ChaCha20-Poly1305, random 96-bit nonce per encryption
//! - Blob = "v1:" + base64(nonce || ciphertext || tag)
//!
//! # Security
//! - `generate_wallet` hands the plaintext back only so the caller can encrypt it;
//!   `create_custody_wallet` does both and never exposes the key
//! - Nothing in this module logs key bytes

use alloy::primitives::Address;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::blockchain::wallet;
use crate::custody::keys::{EncryptedKey, MasterSecret, PrivateKey, MIN_SECRET_LEN};
use crate::custody::CustodyError;

const KEY_WRAP_INFO: &[u8] = b"escrow-custody/key-wrap/v1";
const BLOB_PREFIX: &str = "v1:";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Fixed value used by the health self-test. Not a real key.
const SELF_TEST_VALUE: [u8; 32] = [0x5a; 32];

/// Derive the key-encryption key from the master secret.
fn derive_kek(secret: &[u8]) -> Result<Zeroizing<[u8; 32]>, String> {
    let hk = Hkdf::<Sha256>::new(None, secret);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(KEY_WRAP_INFO, &mut okm[..])
        .map_err(|e| format!("hkdf expand failed: {:?}", e))?;
    Ok(okm)
}

fn cipher_for(secret: &[u8]) -> Result<ChaCha20Poly1305, String> {
    let kek = derive_kek(secret)?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&kek[..])))
}

/// Encrypt a private key under the master secret.
///
/// Fails with `Encryption` when the secret is shorter than [`MIN_SECRET_LEN`].
pub fn encrypt(private_key: &PrivateKey, master_secret: &[u8]) -> Result<EncryptedKey, CustodyError> {
    if master_secret.len() < MIN_SECRET_LEN {
        return Err(CustodyError::Encryption(format!(
            "master secret must be at least {} bytes",
            MIN_SECRET_LEN
        )));
    }

    let cipher = cipher_for(master_secret).map_err(CustodyError::Encryption)?;
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, private_key.as_bytes().as_slice())
        .map_err(|_| CustodyError::Encryption("cipher rejected plaintext".to_string()))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(nonce.as_slice());
    blob.extend_from_slice(&ciphertext);

    Ok(EncryptedKey::new(format!("{}{}", BLOB_PREFIX, BASE64.encode(blob))))
}

/// Decrypt a private key blob.
///
/// Fails with `Decryption` on a tampered blob, wrong secret or unknown format.
pub fn decrypt(ciphertext: &EncryptedKey, master_secret: &[u8]) -> Result<PrivateKey, CustodyError> {
    if master_secret.len() < MIN_SECRET_LEN {
        return Err(CustodyError::Decryption("master secret too short".to_string()));
    }

    let encoded = ciphertext
        .as_str()
        .strip_prefix(BLOB_PREFIX)
        .ok_or_else(|| CustodyError::Decryption("unsupported ciphertext version".to_string()))?;
    let blob = BASE64
        .decode(encoded)
        .map_err(|_| CustodyError::Decryption("ciphertext is not valid base64".to_string()))?;
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CustodyError::Decryption("ciphertext too short".to_string()));
    }

    let (nonce, sealed) = blob.split_at(NONCE_LEN);
    let cipher = cipher_for(master_secret).map_err(CustodyError::Decryption)?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CustodyError::Decryption("authentication failed".to_string()))?,
    );

    PrivateKey::from_slice(&plaintext)
}

/// Public half of a freshly generated custody wallet plus its sealed key.
#[derive(Debug, Clone)]
pub struct CustodyWallet {
    pub address: Address,
    pub encrypted_key: EncryptedKey,
}

/// Holds the master secret and performs all custody crypto.
///
/// Constructed once at startup and shared by handle.
pub struct KeyVault {
    secret: MasterSecret,
}

impl KeyVault {
    pub fn new(secret: MasterSecret) -> Self {
        Self { secret }
    }

    /// Generate a fresh keypair.
    ///
    /// The caller must encrypt the key immediately and drop the plaintext.
    pub fn generate_wallet(&self) -> Result<(Address, PrivateKey), CustodyError> {
        wallet::generate_keypair()
    }

    /// Generate a keypair and seal it in one step.
    pub fn create_custody_wallet(&self) -> Result<CustodyWallet, CustodyError> {
        let (address, private_key) = self.generate_wallet()?;
        let encrypted_key = self.encrypt(&private_key)?;
        Ok(CustodyWallet {
            address,
            encrypted_key,
        })
    }

    pub fn encrypt(&self, private_key: &PrivateKey) -> Result<EncryptedKey, CustodyError> {
        encrypt(private_key, self.secret.expose())
    }

    pub fn decrypt(&self, ciphertext: &EncryptedKey) -> Result<PrivateKey, CustodyError> {
        decrypt(ciphertext, self.secret.expose())
    }

    /// Encrypt a known value and decrypt it back.
    ///
    /// Detects a broken secret or cipher before it touches real funds.
    pub fn self_test(&self) -> Result<(), CustodyError> {
        let sample = PrivateKey::from_bytes(SELF_TEST_VALUE);
        let sealed = self.encrypt(&sample)?;
        let opened = self.decrypt(&sealed)?;
        if opened != sample {
            return Err(CustodyError::Decryption(
                "self-test round trip mismatch".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";
    const OTHER_SECRET: &[u8] = b"fedcba9876543210fedcba9876543210";

    fn test_vault() -> KeyVault {
        KeyVault::new(MasterSecret::new(SECRET.to_vec()).unwrap())
    }

    #[test]
    fn test_round_trip() {
        let key = PrivateKey::from_bytes([0x11; 32]);
        let sealed = encrypt(&key, SECRET).unwrap();
        assert!(sealed.as_str().starts_with("v1:"));
        assert_eq!(decrypt(&sealed, SECRET).unwrap(), key);
    }

    #[test]
    fn test_nonce_is_random() {
        let key = PrivateKey::from_bytes([0x11; 32]);
        let a = encrypt(&key, SECRET).unwrap();
        let b = encrypt(&key, SECRET).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_secret_fails() {
        let key = PrivateKey::from_bytes([0x22; 32]);
        let sealed = encrypt(&key, SECRET).unwrap();
        let err = decrypt(&sealed, OTHER_SECRET).unwrap_err();
        assert!(matches!(err, CustodyError::Decryption(_)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = PrivateKey::from_bytes([0x33; 32]);
        let sealed = encrypt(&key, SECRET).unwrap();

        let mut blob = BASE64.decode(&sealed.as_str()[3..]).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let tampered = EncryptedKey::new(format!("v1:{}", BASE64.encode(blob)));

        assert!(matches!(
            decrypt(&tampered, SECRET),
            Err(CustodyError::Decryption(_))
        ));
    }

    #[test]
    fn test_short_secret_is_encryption_error() {
        let key = PrivateKey::from_bytes([0x44; 32]);
        let err = encrypt(&key, b"too-short").unwrap_err();
        assert!(matches!(err, CustodyError::Encryption(_)));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let err = decrypt(&EncryptedKey::new("v0:AAAA".into()), SECRET).unwrap_err();
        assert!(matches!(err, CustodyError::Decryption(_)));
    }

    #[test]
    fn test_custody_wallet_decrypts_to_matching_address() {
        use alloy::signers::Signer;

        let vault = test_vault();
        let wallet = vault.create_custody_wallet().unwrap();
        let key = vault.decrypt(&wallet.encrypted_key).unwrap();
        let signer = crate::blockchain::wallet::signer_from_key(&key).unwrap();
        assert_eq!(signer.address(), wallet.address);
    }

    #[test]
    fn test_self_test_passes() {
        assert!(test_vault().self_test().is_ok());
    }
}
