//! Canopy Crypto - Keys, sealing and authentication
//!
//! Provides cryptographic primitives for the Canopy overlay:
//! - Key store (content keys by id, one network key)
//! - AEAD encryption (ChaCha20-Poly1305)
//! - HKDF key derivation with role labels
//! - Node identity (Ed25519) and handshake proofs
//! - Crypto envelope for publication payloads and frame authentication
//! - Replay windows over per-sender frame sequences

pub mod aead;
pub mod envelope;
pub mod identity;
pub mod kdf;
pub mod keystore;
pub mod replay;

pub use aead::*;
pub use envelope::*;
pub use identity::*;
pub use kdf::*;
pub use keystore::*;
pub use replay::*;
