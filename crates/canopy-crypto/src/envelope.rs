//! Crypto envelope around publications and frames
//!
//! Two independent layers:
//! - Payload sealing under a content key named by id. Only nodes holding
//!   that key can read or verify the payload.
//! - Frame authentication under the network key. Every frame between
//!   linked nodes carries a tag over its header and body; a bad tag fails
//!   closed and the frame is dropped before any state is touched.
//!
//! Each envelope numbers the frames it seals. The counter starts at the
//! wall-clock time in microseconds, so a restarted sender keeps numbering
//! above anything it sent before.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use canopy_core::{CanopyResult, KeyId, NodeId};
use canopy_wire::{
    FixedHeader, Frame, FrameBuilder, FrameFlags, Message, PublicationBody, Seal,
};

use crate::{random_nonce, AeadCipher, KeyStore, NONCE_SIZE};

/// Payload sealed under a content key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedPayload {
    pub key_id: KeyId,
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with appended tag
    pub ciphertext: Vec<u8>,
}

/// A frame whose tag verified, with its decoded message
#[derive(Clone, Debug)]
pub struct OpenedFrame {
    pub header: FixedHeader,
    pub message: Message,
}

/// Seals and opens payloads and frames using a shared key store
#[derive(Clone, Debug)]
pub struct CryptoEnvelope {
    keystore: KeyStore,
    frame_seq: Arc<AtomicU64>,
}

impl CryptoEnvelope {
    pub fn new(keystore: KeyStore) -> Self {
        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        CryptoEnvelope {
            keystore,
            frame_seq: Arc::new(AtomicU64::new(start.max(1))),
        }
    }

    fn next_seq(&self) -> u64 {
        self.frame_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    /// Encrypt `plaintext` under the content key `key_id`, binding `aad`
    pub fn encrypt_payload(
        &self,
        key_id: KeyId,
        aad: &[u8],
        plaintext: &[u8],
    ) -> CanopyResult<SealedPayload> {
        let entry = self.keystore.content_key(&key_id)?;
        let cipher = AeadCipher::new(entry.cipher_key());
        let nonce = random_nonce();
        let ciphertext = cipher.encrypt(&nonce, aad, plaintext)?;
        Ok(SealedPayload {
            key_id,
            nonce,
            ciphertext,
        })
    }

    /// Decrypt a sealed payload.
    ///
    /// Fails with `KeyNotFound` if the key id is unknown locally and with
    /// `Authentication` if the ciphertext or `aad` do not verify.
    pub fn decrypt_payload(&self, sealed: &SealedPayload, aad: &[u8]) -> CanopyResult<Vec<u8>> {
        let entry = self.keystore.content_key(&sealed.key_id)?;
        let cipher = AeadCipher::new(entry.cipher_key());
        cipher.decrypt(&sealed.nonce, aad, &sealed.ciphertext)
    }

    /// Seal a publication's plaintext payload in place under `key_id`.
    /// The publication's identity, flags, topics and key id are bound.
    pub fn seal_publication(&self, body: &mut PublicationBody, key_id: KeyId) -> CanopyResult<()> {
        body.seal = Some(Seal {
            key_id,
            nonce: [0u8; NONCE_SIZE],
        });
        let aad = body.associated_data();
        let sealed = match self.encrypt_payload(key_id, &aad, &body.payload) {
            Ok(sealed) => sealed,
            Err(e) => {
                body.seal = None;
                return Err(e);
            }
        };
        body.seal = Some(Seal {
            key_id,
            nonce: sealed.nonce,
        });
        body.payload = sealed.ciphertext;
        Ok(())
    }

    /// Plaintext of a publication, decrypting if it is sealed
    pub fn open_publication(&self, body: &PublicationBody) -> CanopyResult<Vec<u8>> {
        match body.seal {
            None => Ok(body.payload.clone()),
            Some(seal) => {
                let sealed = SealedPayload {
                    key_id: seal.key_id,
                    nonce: seal.nonce,
                    ciphertext: body.payload.clone(),
                };
                self.decrypt_payload(&sealed, &body.associated_data())
            }
        }
    }

    /// Frame and authenticate a message under the network key
    pub fn seal_frame(
        &self,
        node_id: NodeId,
        message: &Message,
        flags: FrameFlags,
    ) -> CanopyResult<Vec<u8>> {
        self.seal_frame_with_nonce(node_id, message, flags, random_nonce())
    }

    /// As [`CryptoEnvelope::seal_frame`] with a caller-chosen nonce, for
    /// bodies that must commit to the nonce (handshakes)
    pub fn seal_frame_with_nonce(
        &self,
        node_id: NodeId,
        message: &Message,
        flags: FrameFlags,
        nonce: [u8; NONCE_SIZE],
    ) -> CanopyResult<Vec<u8>> {
        let entry = self.keystore.network_key()?;
        let cipher = AeadCipher::new(entry.cipher_key());

        let mut frame: Frame = FrameBuilder::new(node_id, message)
            .flags(flags)
            .nonce(nonce)
            .seq(self.next_seq())
            .build();
        frame.auth_tag = cipher.tag(&nonce, &frame.associated_data())?;
        frame.serialize()
    }

    /// Parse and verify a received frame, then decode its message.
    ///
    /// The tag is checked before the body is decoded, so nothing from an
    /// unauthenticated frame is ever interpreted.
    pub fn open_frame(&self, bytes: &[u8]) -> CanopyResult<OpenedFrame> {
        let entry = self.keystore.network_key()?;
        let cipher = AeadCipher::new(entry.cipher_key());

        let frame = Frame::parse(bytes)?;
        cipher.verify_tag(&frame.header.nonce, &frame.associated_data(), &frame.auth_tag)?;
        let message = frame.message()?;
        Ok(OpenedFrame {
            header: frame.header,
            message,
        })
    }
}
