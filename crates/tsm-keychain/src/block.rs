//! Block framing for file encryption
//!
//! Ciphertext is a raw sequence of `KEY_LEN`-byte blocks with no header.
//! Plaintext is always PKCS#7 padded, so the last block carries 1..=KEY_LEN
//! pad bytes; an input that is already block-aligned gains a full pad block.

use std::io::{self, Read};

use crate::{Block, KEY_LEN};

/// Pad a final short read (`0 <= len < KEY_LEN`) to a full block.
pub fn pad_block(tail: &[u8]) -> Block {
    debug_assert!(tail.len() < KEY_LEN);
    let pad = (KEY_LEN - tail.len()) as u8;
    let mut block = [pad; KEY_LEN];
    block[..tail.len()].copy_from_slice(tail);
    block
}

/// Pad length the block would carry if it were the last one.
pub fn pad_len(block: &Block) -> Option<usize> {
    let pad = block[KEY_LEN - 1] as usize;
    if !(1..=KEY_LEN).contains(&pad) {
        return None;
    }
    block[KEY_LEN - pad..]
        .iter()
        .all(|&b| b as usize == pad)
        .then_some(pad)
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
///
/// Returns the number of bytes read; less than `KEY_LEN` means the stream ended.
pub fn read_block<R: Read>(reader: &mut R, buf: &mut Block) -> io::Result<usize> {
    let mut filled = 0;
    while filled < KEY_LEN {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// One-block lookahead for decryption.
///
/// Only the final block may be padded, and the final block is only known once
/// the stream ends, so each block is held back until the next one arrives.
#[derive(Debug, Default)]
pub struct BlockDecoder {
    pending: Option<(Block, Option<usize>)>,
}

impl BlockDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the next plaintext block and release the previous one in full.
    pub fn push(&mut self, block: Block) -> Option<Block> {
        let pad = pad_len(&block);
        self.pending.replace((block, pad)).map(|(prev, _)| prev)
    }

    /// Release the held block with its padding stripped, if it has valid padding.
    pub fn finish(self) -> Vec<u8> {
        match self.pending {
            Some((block, Some(pad))) => block[..KEY_LEN - pad].to_vec(),
            Some((block, None)) => block.to_vec(),
            None => Vec::new(),
        }
    }
}
