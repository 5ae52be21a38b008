//! Credential vault for stored account secrets
//!
//! Secrets are sealed with AES-256-GCM under a process-wide key derived once
//! from the configured passphrase. The stored form is
//! `base64(nonce ‖ ciphertext ‖ tag)`. Changing the passphrase makes every
//! previously stored secret undecryptable; operators must re-enter credentials.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use secrecy::SecretString;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::{AppError, AppResult};

/// AES-GCM nonce length in bytes (96 bits)
const NONCE_SIZE: usize = 12;

/// Passphrase used when none is configured. Development only.
const DEFAULT_PASSPHRASE: &str = "inbox-mirror-dev-secret";

/// 256-bit symmetric key
#[derive(Clone)]
pub struct VaultKey([u8; 32]);

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKey(..)")
    }
}

/// Derive the vault key by hashing the passphrase with SHA-256
///
/// A missing or blank passphrase falls back to a fixed default and logs a
/// warning on every call; stored secrets are then only obfuscated.
pub fn derive_key(passphrase: Option<&str>) -> VaultKey {
    let passphrase = match passphrase.map(str::trim) {
        Some(p) if !p.is_empty() => p,
        _ => {
            warn!(
                "INBOX_MIRROR_SECRET is not set; using the built-in development key, \
                 configure a passphrase for production"
            );
            DEFAULT_PASSPHRASE
        }
    };
    VaultKey(Sha256::digest(passphrase.as_bytes()).into())
}

/// Authenticated encryption of account secrets
#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    pub fn new(key: &VaultKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(&key.0.into()),
        }
    }

    /// Derive the key from a passphrase and build the vault
    pub fn from_passphrase(passphrase: Option<&str>) -> Self {
        Self::new(&derive_key(passphrase))
    }

    /// Encrypt a plaintext secret with a fresh random nonce
    ///
    /// Two calls with the same plaintext produce different outputs.
    pub fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| AppError::Internal(format!("secret encryption failed: {e}")))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + sealed.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&sealed);
        Ok(BASE64.encode(combined))
    }

    /// Decrypt a stored secret
    ///
    /// # Errors
    ///
    /// `Decrypt` if the text is not base64, is shorter than one nonce, fails
    /// tag verification (wrong key, truncation, tampering), or is not UTF-8.
    pub fn decrypt(&self, ciphertext: &str) -> AppResult<SecretString> {
        let raw = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| AppError::Decrypt(format!("secret is not valid base64: {e}")))?;
        if raw.len() < NONCE_SIZE {
            return Err(AppError::Decrypt("ciphertext too short".to_owned()));
        }

        let (nonce, sealed) = raw.split_at(NONCE_SIZE);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| AppError::Decrypt("authentication tag mismatch".to_owned()))?;
        let text = String::from_utf8(plain)
            .map_err(|_| AppError::Decrypt("secret is not valid UTF-8".to_owned()))?;
        Ok(SecretString::new(text.into()))
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use secrecy::ExposeSecret;

    use super::{Vault, derive_key};
    use crate::errors::AppError;

    fn vault(pass: &str) -> Vault {
        Vault::new(&derive_key(Some(pass)))
    }

    #[test]
    fn roundtrips_plaintexts() {
        let v = vault("correct horse");
        for plain in ["", "hunter2", "pässwörd ✓", &"x".repeat(4096)] {
            let sealed = v.encrypt(plain).expect("encrypt");
            let opened = v.decrypt(&sealed).expect("decrypt");
            assert_eq!(opened.expose_secret(), plain);
        }
    }

    #[test]
    fn uses_fresh_nonce_per_call() {
        let v = vault("k");
        let a = v.encrypt("same").expect("encrypt");
        let b = v.encrypt("same").expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = vault("one").encrypt("secret").expect("encrypt");
        let err = vault("two").decrypt(&sealed).expect_err("must fail");
        assert!(matches!(err, AppError::Decrypt(_)));
    }

    #[test]
    fn short_input_fails() {
        let err = vault("k")
            .decrypt(&BASE64.encode([1u8, 2, 3]))
            .expect_err("must fail");
        assert!(err.to_string().contains("ciphertext too short"));
    }

    #[test]
    fn truncated_or_flipped_ciphertext_fails() {
        let v = vault("k");
        let raw = BASE64
            .decode(v.encrypt("do not leak").expect("encrypt"))
            .expect("base64");

        let truncated = BASE64.encode(&raw[..raw.len() - 1]);
        assert!(matches!(v.decrypt(&truncated), Err(AppError::Decrypt(_))));

        let mut flipped = raw.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;
        assert!(matches!(
            v.decrypt(&BASE64.encode(&flipped)),
            Err(AppError::Decrypt(_))
        ));
    }

    #[test]
    fn blank_passphrase_uses_default_key() {
        let sealed = Vault::from_passphrase(None).encrypt("p").expect("encrypt");
        let opened = Vault::new(&derive_key(Some("   ")))
            .decrypt(&sealed)
            .expect("same default key");
        assert_eq!(opened.expose_secret(), "p");
    }
}
