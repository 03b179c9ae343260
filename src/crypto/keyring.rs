//! Encryption Keyring
//!
//! AES-GCM over opaque byte payloads with an ordered list of keys. The newest
//! key encrypts; every retained key is tried, newest first, on decrypt.

use std::fmt;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info};

use crate::error::{CacheError, Result};

/// Length of the random nonce prefixed to every ciphertext.
pub const NONCE_LENGTH: usize = NONCE_LEN;

// == Keyring ==
/// Ordered set of encryption keys supporting rotation.
///
/// Stored payload layout: `nonce (12 bytes) || ciphertext || tag`.
pub struct Keyring {
    /// Oldest first; the last key is current
    keys: Vec<LessSafeKey>,
    rng: SystemRandom,
}

impl Keyring {
    // == Constructor ==
    /// Builds a keyring from raw key material, oldest first.
    ///
    /// Each key must be 16 bytes (AES-128-GCM) or 32 bytes (AES-256-GCM).
    /// At least one key is required.
    pub fn new<K: AsRef<[u8]>>(keys: &[K]) -> Result<Self> {
        if keys.is_empty() {
            return Err(CacheError::Configuration(
                "keyring requires at least one key".to_string(),
            ));
        }
        let keys = keys
            .iter()
            .map(|k| build_key(k.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            keys,
            rng: SystemRandom::new(),
        })
    }

    /// Builds a keyring holding a single freshly generated 256-bit key.
    pub fn generate() -> Result<Self> {
        let key = Self::generate_key()?;
        Self::new(&[key])
    }

    /// Generates random 256-bit key material.
    pub fn generate_key() -> Result<[u8; 32]> {
        let mut key = [0u8; 32];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| CacheError::Encryption("system RNG unavailable".to_string()))?;
        Ok(key)
    }

    // == Encrypt ==
    /// Encrypts with the current key under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CacheError::Encryption("system RNG unavailable".to_string()))?;

        let mut in_out = plaintext.to_vec();
        self.current()
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CacheError::Encryption("payload too large to seal".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LENGTH + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    // == Decrypt ==
    /// Decrypts a payload, trying keys from newest to oldest.
    ///
    /// Fails with [`CacheError::AuthFailure`] when the input is shorter than
    /// a nonce or when no key authenticates it.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LENGTH {
            return Err(CacheError::AuthFailure);
        }
        let (nonce_bytes, body) = ciphertext.split_at(NONCE_LENGTH);

        for (age, key) in self.keys.iter().rev().enumerate() {
            let nonce =
                Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CacheError::AuthFailure)?;
            let mut buf = body.to_vec();
            if let Ok(plaintext) = key.open_in_place(nonce, Aad::empty(), &mut buf) {
                if age > 0 {
                    debug!(age, "decrypted with a retired key");
                }
                return Ok(plaintext.to_vec());
            }
        }
        Err(CacheError::AuthFailure)
    }

    // == Rotate ==
    /// Appends a key and makes it current. Existing ciphertexts stay readable.
    pub fn rotate(&mut self, key: &[u8]) -> Result<()> {
        self.keys.push(build_key(key)?);
        info!(keys = self.keys.len(), "encryption key rotated");
        Ok(())
    }

    // == Prune ==
    /// Drops all but the newest `keep` keys. The current key is never dropped.
    ///
    /// Returns the number of keys removed. Data encrypted only under a dropped
    /// key becomes unreadable.
    pub fn prune(&mut self, keep: usize) -> usize {
        let keep = keep.max(1);
        if self.keys.len() <= keep {
            return 0;
        }
        let removed = self.keys.len() - keep;
        self.keys.drain(..removed);
        info!(removed, remaining = self.keys.len(), "retired encryption keys");
        removed
    }

    /// Returns the number of retained keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false: a keyring holds at least one key.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn current(&self) -> &LessSafeKey {
        // Non-empty by construction; prune keeps at least one
        &self.keys[self.keys.len() - 1]
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("keys", &self.keys.len())
            .finish()
    }
}

fn build_key(material: &[u8]) -> Result<LessSafeKey> {
    let algorithm = match material.len() {
        16 => &AES_128_GCM,
        32 => &AES_256_GCM,
        n => {
            return Err(CacheError::Configuration(format!(
                "encryption key must be 16 or 32 bytes, got {}",
                n
            )))
        }
    };
    let unbound = UnboundKey::new(algorithm, material)
        .map_err(|_| CacheError::Configuration("invalid encryption key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}
