//! Role-separated key derivation
//!
//! Raw key material is never used directly as a cipher key; each role
//! expands it with its own HKDF-SHA256 label.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::KEY_SIZE;

/// Label for publication payload keys
pub const CONTENT_KEY_LABEL: &[u8] = b"CANOPY_CONTENT_KEY_v1";

/// Label for frame authentication keys
pub const LINK_AUTH_LABEL: &[u8] = b"CANOPY_LINK_AUTH_v1";

/// Expand `material` into a cipher key for the given role label
pub fn derive_key(material: &[u8; KEY_SIZE], label: &[u8]) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(None, material);
    let mut key = [0u8; KEY_SIZE];
    hkdf.expand(label, &mut key)
        .expect("HKDF expand failed");
    key
}
