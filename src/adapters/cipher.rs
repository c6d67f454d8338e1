//! ChaCha20-Poly1305 Sector Cipher
//!
//! Implements the `Cipher` port. Every sector is sealed under a fresh random
//! nonce; the nonce is prepended to the ciphertext.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::domain::ports::Cipher;
use crate::error::{Error, Result};

const NONCE_LEN: usize = 12;

/// Bytes added to every sector by sealing: nonce plus authentication tag.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + 16;

/// Authenticated sector cipher keyed per file.
#[derive(Clone)]
pub struct ChaChaCipher {
    aead: ChaCha20Poly1305,
}

impl std::fmt::Debug for ChaChaCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaChaCipher").finish_non_exhaustive()
    }
}

impl ChaChaCipher {
    /// Create a cipher from a 32-byte key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            aead: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Create a cipher with a freshly generated key.
    pub fn generate() -> Self {
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        Self {
            aead: ChaCha20Poly1305::new(&key),
        }
    }
}

impl Cipher for ChaChaCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = self
            .aead
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < SEAL_OVERHEAD {
            return Err(Error::Decryption(format!(
                "ciphertext of {} bytes is shorter than the {} byte seal",
                ciphertext.len(),
                SEAL_OVERHEAD
            )));
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        self.aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| Error::Decryption(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_seal_and_open() {
        let cipher = ChaChaCipher::new(&[3u8; 32]);
        let sealed = cipher.encrypt(b"sector payload").unwrap();

        assert_eq!(sealed.len(), b"sector payload".len() + SEAL_OVERHEAD);
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"sector payload");
    }

    #[test]
    fn test_nonce_is_fresh_per_sector() {
        let cipher = ChaChaCipher::generate();
        let a = cipher.encrypt(b"same").unwrap();
        let b = cipher.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let cipher = ChaChaCipher::new(&[9u8; 32]);
        let mut sealed = cipher.encrypt(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;

        assert_matches!(cipher.decrypt(&sealed), Err(Error::Decryption(_)));
        assert_matches!(cipher.decrypt(&[0u8; 4]), Err(Error::Decryption(_)));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = ChaChaCipher::new(&[1u8; 32]).encrypt(b"payload").unwrap();
        assert!(ChaChaCipher::new(&[2u8; 32]).decrypt(&sealed).is_err());
    }
}
