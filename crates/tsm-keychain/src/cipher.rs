//! Block transform used for key wrapping and file encryption
//!
//! `XorCipher` (repeated-key XOR) is a stand-in for the module's hardware
//! cipher. It provides no confidentiality worth the name; deployments plug a
//! real block cipher in through `BlockCipher`.

use crate::key::Key;
use crate::Block;

/// Invertible transform over `KEY_LEN`-byte blocks.
pub trait BlockCipher {
    fn encrypt_block(&self, block: &Block, key: &Key) -> Block;

    fn decrypt_block(&self, block: &Block, key: &Key) -> Block;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct XorCipher;

impl BlockCipher for XorCipher {
    fn encrypt_block(&self, block: &Block, key: &Key) -> Block {
        let mut out = *block;
        for (byte, k) in out.iter_mut().zip(key.as_bytes().iter().cycle()) {
            *byte ^= k;
        }
        out
    }

    fn decrypt_block(&self, block: &Block, key: &Key) -> Block {
        self.encrypt_block(block, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_known_block() {
        let key = Key::from_bytes([0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]);
        let out = XorCipher.encrypt_block(&[0, 0, 0, 0, 0, 0, 0, 1], &key);
        assert_eq!(out, [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xee]);
    }

    #[test]
    fn test_xor_is_involution() {
        let key = Key::from_bytes([9, 8, 7, 6, 5, 4, 3, 2]);
        let block = *b"tsm-blk!";
        let enc = XorCipher.encrypt_block(&block, &key);
        assert_ne!(enc, block);
        assert_eq!(XorCipher.decrypt_block(&enc, &key), block);
    }
}
