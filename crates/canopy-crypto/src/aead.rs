//! ChaCha20-Poly1305, used both for sealed payloads and for detached frame tags

use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, Tag,
};

use canopy_core::{CanopyError, CanopyResult};

pub const KEY_SIZE: usize = 32;

pub const NONCE_SIZE: usize = 12;

pub const TAG_SIZE: usize = 16;

/// One role key, ready to seal or tag
pub struct AeadCipher {
    cipher: ChaCha20Poly1305,
}

impl AeadCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        AeadCipher {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// `plaintext` sealed under `aad`; the tag is appended
    pub fn encrypt(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> CanopyResult<Vec<u8>> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CanopyError::InvalidWireFormat("Plaintext too large to seal".into()))
    }

    /// Inverse of `encrypt`. Any tampering, wrong key or wrong `aad` is
    /// `Authentication`.
    pub fn decrypt(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> CanopyResult<Vec<u8>> {
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| CanopyError::Authentication)
    }

    /// Authentication tag over `aad` alone (no confidential part)
    pub fn tag(&self, nonce: &[u8; NONCE_SIZE], aad: &[u8]) -> CanopyResult<[u8; TAG_SIZE]> {
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut [])
            .map_err(|_| CanopyError::InvalidWireFormat("Frame too large to authenticate".into()))?;
        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    /// Verify a tag produced by [`AeadCipher::tag`]
    pub fn verify_tag(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        tag: &[u8; TAG_SIZE],
    ) -> CanopyResult<()> {
        self.cipher
            .decrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut [], Tag::from_slice(tag))
            .map_err(|_| CanopyError::Authentication)
    }
}

/// Fresh random nonce; keys are long-lived so nonces are never derived
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    rand::random()
}
