//! Master key (KEK) handling and DEK wrapping.
//!
//! DEKs are wrapped with AES-256-GCM under the current master key. Every
//! wrapped payload records the id of the master key that produced it so a
//! rotated master key can still unwrap older DEKs as long as it stays in the
//! [`Keyring`].

use super::KeyError;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use arc_swap::ArcSwap;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

/// Master key length in bytes.
pub const MASTER_KEY_LEN: usize = 32;
/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Key encryption key. Lives only in process memory, never in a key store.
pub struct MasterKey {
    id: String,
    material: Zeroizing<[u8; MASTER_KEY_LEN]>,
}

impl MasterKey {
    /// Exactly [`MASTER_KEY_LEN`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != MASTER_KEY_LEN {
            return Err(KeyError::InvalidMasterKey(format!(
                "expected {} bytes, got {}",
                MASTER_KEY_LEN,
                bytes.len()
            )));
        }
        let mut material = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        material.copy_from_slice(bytes);
        Ok(Self {
            id: fingerprint(&material[..]),
            material,
        })
    }

    /// Standard base64 of the raw key.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| KeyError::InvalidMasterKey(format!("invalid base64: {}", e)))?,
        );
        Self::from_bytes(&decoded)
    }

    /// Derive a master key from an operator passphrase with Argon2id.
    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Self, KeyError> {
        let mut derived = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        argon2::Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt, &mut derived[..])
            .map_err(|e| KeyError::InvalidMasterKey(format!("key derivation failed: {}", e)))?;
        Self::from_bytes(&derived[..])
    }

    /// Random key from the OS RNG.
    pub fn generate() -> Self {
        let mut material = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        OsRng.fill_bytes(&mut material[..]);
        Self {
            id: fingerprint(&material[..]),
            material,
        }
    }

    /// Stable identifier: truncated SHA-256 of the key material.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn cipher(&self) -> Result<Aes256Gcm, KeyError> {
        Aes256Gcm::new_from_slice(&self.material[..])
            .map_err(|e| KeyError::Wrap(format!("invalid master key length: {}", e)))
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("id", &self.id)
            .field("material", &"<redacted>")
            .finish()
    }
}

fn fingerprint(material: &[u8]) -> String {
    let digest = Sha256::digest(material);
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// A DEK encrypted under a master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Id of the master key that wrapped the DEK.
    pub master_key_id: String,
    /// Random 96-bit nonce.
    pub nonce: Vec<u8>,
    /// Encrypted DEK with its GCM tag.
    pub ciphertext: Vec<u8>,
}

impl WrappedKey {
    /// Text form used by column-oriented stores: `<kek id>:<nonce>:<ciphertext>`.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}",
            self.master_key_id,
            STANDARD.encode(&self.nonce),
            STANDARD.encode(&self.ciphertext)
        )
    }

    /// Parse the output of [`WrappedKey::encode`].
    pub fn decode(encoded: &str) -> Result<Self, KeyError> {
        let mut parts = encoded.splitn(3, ':');
        let (Some(kek), Some(nonce), Some(ciphertext)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(KeyError::Wrap("malformed wrapped key payload".to_string()));
        };
        let nonce = STANDARD
            .decode(nonce)
            .map_err(|e| KeyError::Wrap(format!("invalid nonce encoding: {}", e)))?;
        let ciphertext = STANDARD
            .decode(ciphertext)
            .map_err(|e| KeyError::Wrap(format!("invalid ciphertext encoding: {}", e)))?;
        Ok(Self {
            master_key_id: kek.to_string(),
            nonce,
            ciphertext,
        })
    }
}

/// Current master key plus every master key that may still be needed to
/// unwrap older DEKs.
pub struct Keyring {
    current: ArcSwap<MasterKey>,
    known: DashMap<String, Arc<MasterKey>>,
}

impl Keyring {
    /// Keyring whose only key is `master`.
    pub fn new(master: MasterKey) -> Self {
        let master = Arc::new(master);
        let known = DashMap::new();
        known.insert(master.id().to_string(), Arc::clone(&master));
        Self {
            current: ArcSwap::new(master),
            known,
        }
    }

    /// Master key used for new wraps.
    pub fn current(&self) -> Arc<MasterKey> {
        self.current.load_full()
    }

    /// Id of the current master key.
    pub fn current_id(&self) -> String {
        self.current.load().id().to_string()
    }

    /// Make `next` the wrapping key for new DEKs. Returns the previous id.
    pub fn rotate(&self, next: MasterKey) -> String {
        let next = Arc::new(next);
        // Register before swapping so unwraps never miss a key.
        self.known.insert(next.id().to_string(), Arc::clone(&next));
        let previous = self.current.swap(next);
        previous.id().to_string()
    }

    /// Make an additional master key available for unwrapping only.
    pub fn add_retired(&self, master: MasterKey) {
        self.known
            .entry(master.id().to_string())
            .or_insert_with(|| Arc::new(master));
    }

    /// Whether a master key with this id is loaded.
    pub fn contains(&self, master_key_id: &str) -> bool {
        self.known.contains_key(master_key_id)
    }

    /// Wrap `dek` under the current master key, binding `aad`.
    pub fn wrap(&self, dek: &[u8], aad: &[u8]) -> Result<WrappedKey, KeyError> {
        let master = self.current();
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = master
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: dek, aad })
            .map_err(|_| KeyError::Wrap("failed to wrap data encryption key".to_string()))?;

        Ok(WrappedKey {
            master_key_id: master.id().to_string(),
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Unwrap with whichever loaded master key produced `wrapped`.
    pub fn unwrap(&self, wrapped: &WrappedKey, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeyError> {
        let master = self
            .known
            .get(&wrapped.master_key_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| KeyError::UnknownMasterKey(wrapped.master_key_id.clone()))?;

        if wrapped.nonce.len() != NONCE_LEN {
            return Err(KeyError::Wrap(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LEN,
                wrapped.nonce.len()
            )));
        }

        master
            .cipher()?
            .decrypt(
                Nonce::from_slice(&wrapped.nonce),
                Payload {
                    msg: &wrapped.ciphertext,
                    aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| KeyError::Wrap("wrapped key failed authentication".to_string()))
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("current", &self.current_id())
            .field("known", &self.known.len())
            .finish()
    }
}
