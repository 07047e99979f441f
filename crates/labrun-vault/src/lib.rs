//! Credential vault.
//!
//! Passwords for lab credentials are never stored in plaintext. They are
//! sealed with AES-256-GCM under a key derived from an operator secret, and
//! only opened when a host inventory is materialized for a run.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::Hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const KEY_SALT: &[u8] = b"labrun-credential-vault-v1";
const KEY_ROUNDS: u32 = 100_000;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("encryption secret must not be empty")]
    EmptySecret,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("invalid hex in {field}: {source}")]
    InvalidHex {
        field: &'static str,
        #[source]
        source: hex::FromHexError,
    },
    #[error("invalid iv length: expected 12 bytes, got {0}")]
    InvalidIvLength(usize),
    #[error("failed to encrypt secret")]
    Encrypt,
    #[error("failed to decrypt secret (wrong key or corrupted data)")]
    Decrypt,
    #[error("decrypted secret is not valid UTF-8")]
    NotUtf8,
}

pub type VaultResult<T> = Result<T, VaultError>;

/// An encrypted secret as persisted alongside a credential record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedSecret {
    /// Initialization vector (hex).
    pub iv: String,
    /// Ciphertext including the authentication tag (hex).
    #[serde(alias = "encryptedData")]
    pub ciphertext: String,
}

/// Symmetric encrypt/decrypt for stored passwords.
#[derive(Clone)]
pub struct Vault {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    /// Derive the vault key from an operator secret.
    ///
    /// The derivation is deterministic: the same secret always opens data
    /// sealed by a previous process.
    pub fn from_secret(secret: &str) -> VaultResult<Self> {
        if secret.is_empty() {
            return Err(VaultError::EmptySecret);
        }
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2::<HmacSha256>(secret.as_bytes(), KEY_SALT, KEY_ROUNDS, &mut key)
            .map_err(|_| VaultError::KeyDerivation)?;
        Ok(Self { key })
    }

    fn cipher(&self) -> VaultResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| VaultError::KeyDerivation)
    }

    /// Seal `plaintext` under a fresh random IV.
    pub fn encrypt(&self, plaintext: &str) -> VaultResult<SealedSecret> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;
        Ok(SealedSecret {
            iv: hex::encode(iv),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Open a secret previously produced by [`Vault::encrypt`].
    pub fn decrypt(&self, ciphertext: &str, iv: &str) -> VaultResult<String> {
        let iv = hex::decode(iv).map_err(|source| VaultError::InvalidHex { field: "iv", source })?;
        if iv.len() != IV_LEN {
            return Err(VaultError::InvalidIvLength(iv.len()));
        }
        let ciphertext = hex::decode(ciphertext).map_err(|source| VaultError::InvalidHex {
            field: "ciphertext",
            source,
        })?;
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
            .map_err(|_| VaultError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| VaultError::NotUtf8)
    }

    pub fn open(&self, sealed: &SealedSecret) -> VaultResult<String> {
        self.decrypt(&sealed.ciphertext, &sealed.iv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::from_secret("correct horse battery staple").unwrap()
    }

    #[test]
    fn round_trips_plaintext() {
        let vault = vault();
        for plaintext in ["", "p1", "pässwörd with spaces", "line\nbreak"] {
            let sealed = vault.encrypt(plaintext).unwrap();
            assert_eq!(vault.decrypt(&sealed.ciphertext, &sealed.iv).unwrap(), plaintext);
        }
    }

    #[test]
    fn never_stores_plaintext_and_uses_fresh_ivs() {
        let vault = vault();
        let a = vault.encrypt("hunter2").unwrap();
        let b = vault.encrypt("hunter2").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
        assert!(!a.ciphertext.contains(&hex::encode("hunter2")));
    }

    #[test]
    fn key_derivation_is_deterministic() {
        let sealed = vault().encrypt("stable").unwrap();
        assert_eq!(vault().open(&sealed).unwrap(), "stable");
    }

    #[test]
    fn wrong_secret_fails_to_decrypt() {
        let sealed = vault().encrypt("secret").unwrap();
        let other = Vault::from_secret("another secret").unwrap();
        assert!(matches!(other.open(&sealed), Err(VaultError::Decrypt)));
    }

    #[test]
    fn rejects_malformed_input() {
        let vault = vault();
        assert!(matches!(
            vault.decrypt("00", "zz"),
            Err(VaultError::InvalidHex { field: "iv", .. })
        ));
        assert!(matches!(
            vault.decrypt("00", "0011"),
            Err(VaultError::InvalidIvLength(2))
        ));
        let sealed = vault.encrypt("x").unwrap();
        assert!(matches!(
            vault.decrypt("not-hex", &sealed.iv),
            Err(VaultError::InvalidHex { field: "ciphertext", .. })
        ));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(Vault::from_secret(""), Err(VaultError::EmptySecret)));
    }

    #[test]
    fn accepts_legacy_field_name() {
        let sealed: SealedSecret =
            serde_json::from_str(r#"{"iv":"00","encryptedData":"ff"}"#).unwrap();
        assert_eq!(sealed.ciphertext, "ff");
    }
}
