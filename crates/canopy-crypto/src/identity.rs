//! Node identities
//!
//! A node proves who it is during the link handshake by signing a
//! transcript bound to the frame nonce. Its `NodeId` is not chosen, it is
//! the first 8 bytes of SHA-256 over the Ed25519 verifying key, so a peer
//! can check the header's claimed id against the key it was sent.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use canopy_core::{CanopyError, CanopyResult, NodeId};
use canopy_wire::{handshake_transcript, Handshake, MessageType, SIGNATURE_SIZE, VERIFYING_KEY_SIZE};

/// Size of the secret seed an identity is restored from
pub const IDENTITY_SEED_SIZE: usize = 32;

/// A node's signing identity
#[derive(Clone)]
pub struct Identity {
    signer: SigningKey,
    node_id: NodeId,
}

impl Identity {
    pub fn generate() -> Self {
        Self::from_signer(SigningKey::generate(&mut OsRng))
    }

    /// Restore an identity persisted by the host
    pub fn from_seed(seed: &[u8; IDENTITY_SEED_SIZE]) -> Self {
        Self::from_signer(SigningKey::from_bytes(seed))
    }

    fn from_signer(signer: SigningKey) -> Self {
        let node_id = node_id_for(&signer.verifying_key());
        Identity { signer, node_id }
    }

    /// Secret seed; treat like key material
    pub fn seed(&self) -> [u8; IDENTITY_SEED_SIZE] {
        self.signer.to_bytes()
    }

    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            key: self.signer.verifying_key(),
            node_id: self.node_id,
        }
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signer.sign(message).to_bytes()
    }

    /// Handshake body proving this identity for one frame. `nonce` must be
    /// the nonce of the frame that will carry it.
    pub fn handshake(&self, message_type: MessageType, port: u16, nonce: &[u8]) -> Handshake {
        let transcript = handshake_transcript(message_type, self.node_id, port, nonce);
        Handshake {
            port,
            verifying_key: self.signer.verifying_key().to_bytes(),
            signature: self.sign(&transcript),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

fn node_id_for(key: &VerifyingKey) -> NodeId {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    NodeId::from_bytes(prefix)
}

/// A peer's verifying half, as learned from its handshake
#[derive(Clone)]
pub struct PublicIdentity {
    key: VerifyingKey,
    node_id: NodeId,
}

impl PublicIdentity {
    pub fn from_key_bytes(bytes: &[u8; VERIFYING_KEY_SIZE]) -> CanopyResult<Self> {
        let key = VerifyingKey::from_bytes(bytes).map_err(|_| CanopyError::Authentication)?;
        Ok(PublicIdentity {
            node_id: node_id_for(&key),
            key,
        })
    }

    /// Check a handshake proof against the node id claimed in the frame
    /// header and the frame nonce it was signed for.
    pub fn verify_handshake(
        handshake: &Handshake,
        claimed: NodeId,
        message_type: MessageType,
        nonce: &[u8],
    ) -> CanopyResult<Self> {
        let peer = Self::from_key_bytes(&handshake.verifying_key)?;
        if peer.node_id != claimed {
            return Err(CanopyError::Authentication);
        }
        let transcript = handshake_transcript(message_type, claimed, handshake.port, nonce);
        if !peer.verify(&transcript, &handshake.signature) {
            return Err(CanopyError::Authentication);
        }
        Ok(peer)
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> bool {
        self.key
            .verify(message, &Signature::from_bytes(signature))
            .is_ok()
    }

    pub fn key_bytes(&self) -> [u8; VERIFYING_KEY_SIZE] {
        self.key.to_bytes()
    }
}

impl std::fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicIdentity({})", self.node_id)
    }
}
