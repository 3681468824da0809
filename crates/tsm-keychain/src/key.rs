//! Plaintext key material: generation, parsing, zeroization

use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use tsm_core::{TsmError, TsmResult};

use crate::{Block, KEY_LEN};

/// A 64-bit plaintext key. Zeroized on drop.
#[derive(Clone)]
pub struct Key {
    bytes: Block,
}

impl Key {
    pub fn from_bytes(bytes: Block) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &Block {
        &self.bytes
    }

    /// Draw a fresh key from `rng`.
    pub fn generate<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Parse a hex-encoded key (e.g. the root secret from config).
    pub fn from_hex(secret: &SecretString) -> TsmResult<Self> {
        let mut bytes = [0u8; KEY_LEN];
        hex::decode_to_slice(secret.expose_secret().trim(), &mut bytes).map_err(|e| {
            TsmError::Config(format!("key must be {} hex chars: {e}", KEY_LEN * 2))
        })?;
        Ok(Self { bytes })
    }
}

impl From<Block> for Key {
    fn from(bytes: Block) -> Self {
        Self::from_bytes(bytes)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Key {}

impl Drop for Key {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key").field("bytes", &"[REDACTED]").finish()
    }
}
