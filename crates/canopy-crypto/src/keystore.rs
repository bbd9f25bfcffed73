//! Key store shared between a host program and its nodes
//!
//! Content keys are looked up by id when a payload is sealed or opened.
//! Exactly one network key is active at a time; provisioning a new one
//! replaces the old.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use canopy_core::{CanopyError, CanopyResult, KeyId};

use crate::{derive_key, CONTENT_KEY_LABEL, KEY_SIZE, LINK_AUTH_LABEL};

/// What a key is used for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyRole {
    /// Seals publication payloads
    Content,
    /// Authenticates every frame between linked nodes
    Network,
}

/// Key store entry
#[derive(Clone)]
pub struct KeyEntry {
    pub key_id: KeyId,
    pub role: KeyRole,
    material: [u8; KEY_SIZE],
    cipher_key: [u8; KEY_SIZE],
}

impl KeyEntry {
    fn new(key_id: KeyId, role: KeyRole, material: &[u8]) -> CanopyResult<Self> {
        let material: [u8; KEY_SIZE] =
            material.try_into().map_err(|_| CanopyError::InvalidKey {
                expected: KEY_SIZE,
                actual: material.len(),
            })?;
        let label = match role {
            KeyRole::Content => CONTENT_KEY_LABEL,
            KeyRole::Network => LINK_AUTH_LABEL,
        };
        Ok(KeyEntry {
            key_id,
            role,
            material,
            cipher_key: derive_key(&material, label),
        })
    }

    /// Raw key material as provisioned
    pub fn material(&self) -> &[u8; KEY_SIZE] {
        &self.material
    }

    /// Role-specific cipher key derived from the material
    pub(crate) fn cipher_key(&self) -> &[u8; KEY_SIZE] {
        &self.cipher_key
    }
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("key_id", &self.key_id)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct KeyStoreInner {
    content: HashMap<KeyId, KeyEntry>,
    network: Option<KeyEntry>,
}

/// Thread-safe key store. Cheap to clone; clones share the same keys.
#[derive(Clone, Default)]
pub struct KeyStore {
    inner: Arc<RwLock<KeyStoreInner>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a content key
    pub fn add_content_key(&self, key_id: KeyId, material: &[u8]) -> CanopyResult<()> {
        let entry = KeyEntry::new(key_id, KeyRole::Content, material)?;
        self.inner.write().content.insert(key_id, entry);
        Ok(())
    }

    /// Remove a content key; returns whether it was present
    pub fn remove_content_key(&self, key_id: &KeyId) -> bool {
        self.inner.write().content.remove(key_id).is_some()
    }

    /// Set the single active network key
    pub fn set_network_key(&self, key_id: KeyId, material: &[u8]) -> CanopyResult<()> {
        let entry = KeyEntry::new(key_id, KeyRole::Network, material)?;
        self.inner.write().network = Some(entry);
        Ok(())
    }

    /// Look up a content key by id
    pub fn content_key(&self, key_id: &KeyId) -> CanopyResult<KeyEntry> {
        self.inner
            .read()
            .content
            .get(key_id)
            .cloned()
            .ok_or(CanopyError::KeyNotFound(*key_id))
    }

    /// The active network key
    pub fn network_key(&self) -> CanopyResult<KeyEntry> {
        self.inner
            .read()
            .network
            .clone()
            .ok_or(CanopyError::NetworkKeyMissing)
    }

    pub fn has_content_key(&self, key_id: &KeyId) -> bool {
        self.inner.read().content.contains_key(key_id)
    }

    /// Ids of all registered content keys
    pub fn content_key_ids(&self) -> Vec<KeyId> {
        let mut ids: Vec<KeyId> = self.inner.read().content.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("KeyStore")
            .field("content_keys", &inner.content.len())
            .field("network_key", &inner.network.as_ref().map(|e| e.key_id))
            .finish()
    }
}
