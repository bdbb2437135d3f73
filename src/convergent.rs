// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Convergent addressing and encryption.
//!
//! Everything is derived from the item's content hash, never from its identity,
//! so byte-identical items collapse onto one stored object:
//!
//! ```text
//! locator = hex(HMAC-SHA256(locator_salt, hash))
//! key     = HKDF-SHA256(ikm = secret, salt = locator_salt, info = "cdn/key/"   || hash)   32 bytes
//! nonce   = HKDF-SHA256(ikm = secret, salt = locator_salt, info = "cdn/nonce/" || hash)   12 bytes
//! ```
//!
//! Reusing a nonce is only possible for the same key, which only happens for the
//! same plaintext: that is the convergent property, not a leak of new information.
//!
//! Stored object layout:
//!
//! ```text
//! ┌──────┬──────────────┬─────────┬──────────────┬────────────────────────┐
//! │ CDN1 │ key id (8 B) │ aad len │ aad (item id)│ AES-256-GCM ciphertext │
//! └──────┴──────────────┴─────────┴──────────────┴────────────────────────┘
//! ```
//!
//! The writing item's id is bound as associated data and carried in the header,
//! so any item sharing the locator can still open the object.
//!
//! The first configured key encrypts and addresses; every configured key is
//! tried (by key id) on read, which allows rotation.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use dashmap::DashMap;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::storage::traits::StorageError;

const MAGIC: &[u8; 4] = b"CDN1";
const KEY_ID_LEN: usize = 8;
const HEADER_FIXED_LEN: usize = MAGIC.len() + KEY_ID_LEN + 2;
const MAX_CACHED_KEYS: usize = 4096;

/// One keying entry of a storage unit's `encryption` list.
#[derive(Clone, Deserialize, Serialize)]
pub struct EncryptionConfig {
    #[serde(default = "default_cipher")]
    pub cipher: String,
    pub locator_salt: String,
    pub secret_value: String,
}

fn default_cipher() -> String {
    "aes-gcm".to_string()
}

impl fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("cipher", &self.cipher)
            .field("locator_salt", &"[REDACTED]")
            .field("secret_value", &"[REDACTED]")
            .finish()
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedKey {
    key: [u8; 32],
    nonce: [u8; 12],
}

struct Keying {
    id: [u8; KEY_ID_LEN],
    salt: Zeroizing<Vec<u8>>,
    secret: Zeroizing<Vec<u8>>,
}

impl Keying {
    fn from_config(config: &EncryptionConfig) -> Result<Self, StorageError> {
        if config.cipher != "aes-gcm" {
            return Err(StorageError::Crypto(format!("unsupported cipher '{}'", config.cipher)));
        }
        if config.secret_value.is_empty() || config.locator_salt.is_empty() {
            return Err(StorageError::Crypto("locator_salt and secret_value are required".into()));
        }
        let digest = Sha256::digest(config.secret_value.as_bytes());
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&digest[..KEY_ID_LEN]);
        Ok(Self {
            id,
            salt: Zeroizing::new(config.locator_salt.as_bytes().to_vec()),
            secret: Zeroizing::new(config.secret_value.as_bytes().to_vec()),
        })
    }

    fn derive(&self, hash: &str) -> Result<DerivedKey, StorageError> {
        let hk = Hkdf::<Sha256>::new(Some(self.salt.as_slice()), self.secret.as_slice());
        let mut derived = DerivedKey { key: [0u8; 32], nonce: [0u8; 12] };
        hk.expand(format!("cdn/key/{}", hash).as_bytes(), &mut derived.key)
            .map_err(|e| StorageError::Crypto(e.to_string()))?;
        hk.expand(format!("cdn/nonce/{}", hash).as_bytes(), &mut derived.nonce)
            .map_err(|e| StorageError::Crypto(e.to_string()))?;
        Ok(derived)
    }
}

/// Content-derived locator and cipher for one storage unit.
pub struct Convergent {
    keys: Vec<Keying>,
    /// (key id, hash) → derived key material.
    cache: DashMap<([u8; KEY_ID_LEN], String), std::sync::Arc<DerivedKey>>,
}

impl Convergent {
    pub fn new(configs: &[EncryptionConfig]) -> Result<Self, StorageError> {
        if configs.is_empty() {
            return Err(StorageError::Crypto("at least one encryption key is required".into()));
        }
        let keys = configs.iter().map(Keying::from_config).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { keys, cache: DashMap::new() })
    }

    #[must_use]
    pub fn locator(&self, hash: &str) -> String {
        // Non-empty salts are enforced at construction, and HMAC accepts any key length.
        let mut mac = match <Hmac<Sha256> as Mac>::new_from_slice(self.keys[0].salt.as_slice()) {
            Ok(mac) => mac,
            Err(_) => return hash.to_string(),
        };
        mac.update(hash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn derived(&self, keying: &Keying, hash: &str) -> Result<std::sync::Arc<DerivedKey>, StorageError> {
        let cache_key = (keying.id, hash.to_string());
        if let Some(found) = self.cache.get(&cache_key) {
            return Ok(found.clone());
        }
        if self.cache.len() >= MAX_CACHED_KEYS {
            self.cache.clear();
        }
        let derived = std::sync::Arc::new(keying.derive(hash)?);
        self.cache.insert(cache_key, derived.clone());
        Ok(derived)
    }

    /// Encrypt `plaintext` for content `hash`, binding `item_id` as associated data.
    pub fn seal(&self, hash: &str, item_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
        let keying = &self.keys[0];
        let derived = self.derived(keying, hash)?;
        let cipher = Aes256Gcm::new_from_slice(&derived.key).map_err(|e| StorageError::Crypto(e.to_string()))?;
        let aad = item_id.as_bytes();
        let aad_len = u16::try_from(aad.len()).map_err(|_| StorageError::Crypto("item id too long".into()))?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&derived.nonce), Payload { msg: plaintext, aad })
            .map_err(|e| StorageError::Crypto(e.to_string()))?;

        let mut out = Vec::with_capacity(HEADER_FIXED_LEN + aad.len() + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&keying.id);
        out.extend_from_slice(&aad_len.to_be_bytes());
        out.extend_from_slice(aad);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt an object written by [`Convergent::seal`] for content `hash`.
    pub fn open(&self, hash: &str, object: &[u8]) -> Result<Vec<u8>, StorageError> {
        if object.len() < HEADER_FIXED_LEN || object[..MAGIC.len()] != MAGIC[..] {
            return Err(StorageError::Crypto("not a convergent object".into()));
        }
        let key_id = &object[MAGIC.len()..MAGIC.len() + KEY_ID_LEN];
        let aad_len = u16::from_be_bytes([object[HEADER_FIXED_LEN - 2], object[HEADER_FIXED_LEN - 1]]) as usize;
        if object.len() < HEADER_FIXED_LEN + aad_len {
            return Err(StorageError::Crypto("truncated convergent header".into()));
        }
        let aad = &object[HEADER_FIXED_LEN..HEADER_FIXED_LEN + aad_len];
        let ciphertext = &object[HEADER_FIXED_LEN + aad_len..];

        let keying = self
            .keys
            .iter()
            .find(|k| k.id.as_slice() == key_id)
            .ok_or_else(|| StorageError::Crypto("object was sealed with an unknown key".into()))?;
        let derived = self.derived(keying, hash)?;
        let cipher = Aes256Gcm::new_from_slice(&derived.key).map_err(|e| StorageError::Crypto(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(&derived.nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| StorageError::Crypto("authentication failed".into()))
    }

    #[must_use]
    pub fn cached_keys(&self) -> usize {
        self.cache.len()
    }
}

/// Addressing mode of a storage unit: identity or convergent.
pub enum Addressing {
    Identity,
    Convergent(Convergent),
}

impl Addressing {
    pub fn from_configs(configs: &[EncryptionConfig]) -> Result<Self, StorageError> {
        if configs.is_empty() {
            Ok(Self::Identity)
        } else {
            Ok(Self::Convergent(Convergent::new(configs)?))
        }
    }

    #[must_use]
    pub fn locator(&self, hash: &str) -> String {
        match self {
            Self::Identity => hash.to_string(),
            Self::Convergent(c) => c.locator(hash),
        }
    }

    pub fn seal(&self, hash: &str, item_id: &str, content: &[u8]) -> Result<Vec<u8>, StorageError> {
        match self {
            Self::Identity => Ok(content.to_vec()),
            Self::Convergent(c) => c.seal(hash, item_id, content),
        }
    }

    pub fn open(&self, hash: &str, object: &[u8]) -> Result<Vec<u8>, StorageError> {
        match self {
            Self::Identity => Ok(object.to_vec()),
            Self::Convergent(c) => c.open(hash, object),
        }
    }

    #[must_use]
    pub fn is_encrypting(&self) -> bool {
        matches!(self, Self::Convergent(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ContentDigest;

    fn config(salt: &str, secret: &str) -> EncryptionConfig {
        EncryptionConfig { cipher: "aes-gcm".into(), locator_salt: salt.into(), secret_value: secret.into() }
    }

    #[test]
    fn test_locator_depends_on_content_only() {
        let c = Convergent::new(&[config("salt", "secret")]).unwrap();
        let h1 = ContentDigest::compute(b"same bytes").hash;
        let h2 = ContentDigest::compute(b"same bytes").hash;
        let h3 = ContentDigest::compute(b"same bytez").hash;
        assert_eq!(c.locator(&h1), c.locator(&h2));
        assert_ne!(c.locator(&h1), c.locator(&h3));
        assert_ne!(c.locator(&h1), h1, "locator must not leak the raw hash");
    }

    #[test]
    fn test_locator_depends_on_salt() {
        let a = Convergent::new(&[config("salt-a", "secret")]).unwrap();
        let b = Convergent::new(&[config("salt-b", "secret")]).unwrap();
        assert_ne!(a.locator("abc"), b.locator("abc"));
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let c = Convergent::new(&[config("salt", "secret")]).unwrap();
        let content = b"[INFO] hello\n";
        let hash = ContentDigest::compute(content).hash;
        let sealed = c.seal(&hash, "item-a", content).unwrap();
        assert_ne!(&sealed[HEADER_FIXED_LEN..], content);
        assert_eq!(c.open(&hash, &sealed).unwrap(), content);
    }

    #[test]
    fn test_identical_content_identical_object() {
        let c = Convergent::new(&[config("salt", "secret")]).unwrap();
        let hash = ContentDigest::compute(b"x").hash;
        assert_eq!(c.seal(&hash, "item-a", b"x").unwrap(), c.seal(&hash, "item-a", b"x").unwrap());
    }

    #[test]
    fn test_shared_object_opens_for_any_reader() {
        // Item B dedups onto the object written by item A; B only knows the hash.
        let c = Convergent::new(&[config("salt", "secret")]).unwrap();
        let hash = ContentDigest::compute(b"shared").hash;
        let sealed = c.seal(&hash, "item-a", b"shared").unwrap();
        assert_eq!(c.open(&hash, &sealed).unwrap(), b"shared");
    }

    #[test]
    fn test_tampered_aad_is_rejected() {
        let c = Convergent::new(&[config("salt", "secret")]).unwrap();
        let hash = ContentDigest::compute(b"data").hash;
        let mut sealed = c.seal(&hash, "item-a", b"data").unwrap();
        // Flip one byte of the embedded item id.
        sealed[HEADER_FIXED_LEN] ^= 0x01;
        assert!(matches!(c.open(&hash, &sealed), Err(StorageError::Crypto(_))));
    }

    #[test]
    fn test_wrong_hash_cannot_open() {
        let c = Convergent::new(&[config("salt", "secret")]).unwrap();
        let hash = ContentDigest::compute(b"data").hash;
        let sealed = c.seal(&hash, "item-a", b"data").unwrap();
        assert!(c.open("deadbeef", &sealed).is_err());
    }

    #[test]
    fn test_rotation_reads_old_objects() {
        let old = Convergent::new(&[config("salt", "old-secret")]).unwrap();
        let hash = ContentDigest::compute(b"legacy").hash;
        let sealed = old.seal(&hash, "item", b"legacy").unwrap();

        let rotated = Convergent::new(&[config("salt", "new-secret"), config("salt", "old-secret")]).unwrap();
        assert_eq!(rotated.open(&hash, &sealed).unwrap(), b"legacy");

        let unrelated = Convergent::new(&[config("salt", "other")]).unwrap();
        assert!(unrelated.open(&hash, &sealed).is_err());
    }

    #[test]
    fn test_key_cache_is_reused() {
        let c = Convergent::new(&[config("salt", "secret")]).unwrap();
        let hash = ContentDigest::compute(b"c").hash;
        c.seal(&hash, "i", b"c").unwrap();
        c.seal(&hash, "j", b"c").unwrap();
        assert_eq!(c.cached_keys(), 1);
    }

    #[test]
    fn test_identity_addressing() {
        let a = Addressing::from_configs(&[]).unwrap();
        assert!(!a.is_encrypting());
        assert_eq!(a.locator("abc"), "abc");
        assert_eq!(a.seal("abc", "i", b"raw").unwrap(), b"raw");
    }

    #[test]
    fn test_rejects_unknown_cipher() {
        let mut cfg = config("s", "k");
        cfg.cipher = "rot13".into();
        assert!(Convergent::new(&[cfg]).is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let dbg = format!("{:?}", config("pepper", "hunter2"));
        assert!(!dbg.contains("hunter2"));
        assert!(!dbg.contains("pepper"));
    }
}
