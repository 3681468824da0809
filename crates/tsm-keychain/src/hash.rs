//! Chain hash primitive: SHA-256 behind a small streaming trait

use sha2::{Digest as _, Sha256};

use crate::DIGEST_LEN;

/// Output of the chain hash
pub type Digest = [u8; DIGEST_LEN];

/// Children digest of a childless node, and the bound digest of a fresh leaf.
pub const ZERO_DIGEST: Digest = [0u8; DIGEST_LEN];

/// Streaming hash used for node hashes, children digests and ciphertext digests.
pub trait ChainHasher: Default {
    fn update(&mut self, data: &[u8]);

    fn finalize(self) -> Digest;

    /// One-shot hash of `data`.
    fn digest(data: &[u8]) -> Digest {
        let mut hasher = Self::default();
        hasher.update(data);
        hasher.finalize()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sha256Hasher(Sha256);

impl ChainHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize(self) -> Digest {
        self.0.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        let digest = Sha256Hasher::digest(b"abc");
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let mut hasher = Sha256Hasher::default();
        hasher.update(b"0123");
        hasher.update(b"4567");
        assert_eq!(hasher.finalize(), Sha256Hasher::digest(b"01234567"));
    }
}
