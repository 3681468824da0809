//! Trusted security module protocol: provision, revoke, encrypt, decrypt
//!
//! Encryption writes raw transformed blocks and binds a digest of the
//! ciphertext to the leaf key, so one `verify_key` walk covers both the key
//! path and the data. Decryption checks, in order: key present, ciphertext
//! digest, key path, then unpads with a one-block lookahead.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use rand::RngCore;
use tracing::{debug, info, warn};

use tsm_core::{KeyKind, TsmError, TsmResult};

use crate::block::{pad_block, read_block, BlockDecoder};
use crate::chain::KeyChain;
use crate::cipher::BlockCipher;
use crate::hash::{ChainHasher, Digest};
use crate::key::Key;
use crate::KEY_LEN;

/// Buffering for the file passes
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    /// Reader/writer capacity in cipher blocks (default: 512)
    pub buffer_blocks: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self { buffer_blocks: 512 }
    }
}

impl StreamOptions {
    fn capacity(&self) -> usize {
        self.buffer_blocks.max(1) * KEY_LEN
    }
}

/// Generate a fresh key from `rng` and add it under `parent_id`.
pub fn provision_key<C, H, R>(
    chain: &mut KeyChain<C, H>,
    parent_id: &str,
    id: &str,
    kind: KeyKind,
    rng: &mut R,
) -> TsmResult<()>
where
    C: BlockCipher,
    H: ChainHasher,
    R: RngCore + ?Sized,
{
    let key = Key::generate(rng);
    chain.add_key(parent_id, id, &key, kind)
}

/// Revoke `id` and everything derived under it.
pub fn revoke_key<C: BlockCipher, H: ChainHasher>(
    chain: &mut KeyChain<C, H>,
    id: &str,
) -> TsmResult<()> {
    chain.remove_key(id)?;
    info!(key_id = id, "revoked key");
    Ok(())
}

/// Encrypt `input` into `output` under leaf `key_id` and bind the ciphertext digest.
pub fn encrypt_file<C: BlockCipher, H: ChainHasher>(
    chain: &mut KeyChain<C, H>,
    key_id: &str,
    input: &Path,
    output: &Path,
    options: &StreamOptions,
) -> TsmResult<()> {
    // Absent ids are not leaves either.
    if chain.kind(key_id) != Some(KeyKind::Leaf) {
        return Err(TsmError::WrongKeyType(key_id.to_string()));
    }
    let key = chain
        .plaintext_key(key_id)
        .ok_or_else(|| TsmError::WrongKeyType(key_id.to_string()))?;
    if !chain.verify_key(key_id) {
        warn!(key_id, "refusing to encrypt under a key that fails verification");
        return Err(TsmError::KeyIntegrityViolation(key_id.to_string()));
    }

    let mut reader = BufReader::with_capacity(options.capacity(), File::open(input)?);
    let mut writer = BufWriter::with_capacity(options.capacity(), File::create(output)?);
    let mut hasher = H::default();
    let mut buf = [0u8; KEY_LEN];
    let mut blocks = 0u64;

    loop {
        let n = read_block(&mut reader, &mut buf)?;
        let last = n < KEY_LEN;
        let plain = if last { pad_block(&buf[..n]) } else { buf };

        let sealed = chain.cipher().encrypt_block(&plain, &key);
        absorb_block_hex(&mut hasher, &sealed);
        writer.write_all(&sealed)?;
        blocks += 1;

        if last {
            break;
        }
    }
    writer.flush()?;

    chain.update_key(key_id, hasher.finalize())?;
    debug!(key_id, blocks, input = %input.display(), "encrypted file");
    Ok(())
}

/// Decrypt `input` into `output` with leaf `key_id`.
///
/// Output is only created once both integrity checks pass; a malformed
/// ciphertext discovered during the second pass may leave partial output.
pub fn decrypt_file<C: BlockCipher, H: ChainHasher>(
    chain: &KeyChain<C, H>,
    key_id: &str,
    input: &Path,
    output: &Path,
    options: &StreamOptions,
) -> TsmResult<()> {
    let bound = match chain.kind(key_id) {
        None => return Err(TsmError::UnknownKey(key_id.to_string())),
        Some(KeyKind::Internal) => return Err(TsmError::WrongKeyType(key_id.to_string())),
        Some(KeyKind::Leaf) => chain
            .bound_digest(key_id)
            .ok_or_else(|| TsmError::UnknownKey(key_id.to_string()))?,
    };

    let digest = ciphertext_digest::<H>(input, options)?;
    if digest != bound {
        warn!(key_id, input = %input.display(), "ciphertext digest mismatch");
        return Err(TsmError::DataIntegrityViolation(key_id.to_string()));
    }
    if !chain.verify_key(key_id) {
        return Err(TsmError::KeyIntegrityViolation(key_id.to_string()));
    }
    let key = chain
        .plaintext_key(key_id)
        .ok_or_else(|| TsmError::UnknownKey(key_id.to_string()))?;

    let mut reader = BufReader::with_capacity(options.capacity(), File::open(input)?);
    let mut writer = BufWriter::with_capacity(options.capacity(), File::create(output)?);
    let mut decoder = BlockDecoder::new();
    let mut buf = [0u8; KEY_LEN];

    loop {
        let n = read_block(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        if n < KEY_LEN {
            writer.flush()?;
            return Err(TsmError::MalformedCiphertext(format!(
                "{}: trailing block of {n} bytes (expected {KEY_LEN})",
                input.display()
            )));
        }
        let plain = chain.cipher().decrypt_block(&buf, &key);
        if let Some(prev) = decoder.push(plain) {
            writer.write_all(&prev)?;
        }
    }
    writer.write_all(&decoder.finish())?;
    writer.flush()?;

    debug!(key_id, output = %output.display(), "decrypted file");
    Ok(())
}

/// Digest of a ciphertext file: hash of the concatenated lowercase hex of its blocks.
pub fn ciphertext_digest<H: ChainHasher>(path: &Path, options: &StreamOptions) -> TsmResult<Digest> {
    let mut reader = BufReader::with_capacity(options.capacity(), File::open(path)?);
    digest_blocks::<H, _>(&mut reader)
}

fn digest_blocks<H: ChainHasher, R: Read>(reader: &mut R) -> TsmResult<Digest> {
    let mut hasher = H::default();
    let mut buf = [0u8; KEY_LEN];
    loop {
        let n = read_block(reader, &mut buf)?;
        if n == 0 {
            break;
        }
        absorb_block_hex(&mut hasher, &buf[..n]);
    }
    Ok(hasher.finalize())
}

fn absorb_block_hex<H: ChainHasher>(hasher: &mut H, block: &[u8]) {
    hasher.update(hex::encode(block).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Sha256Hasher;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    fn chain_with_leaves() -> KeyChain {
        let mut chain = KeyChain::new(Key::from_bytes([0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef]));
        let mut rng = StdRng::seed_from_u64(42);
        provision_key(&mut chain, "0", "00", KeyKind::Internal, &mut rng).unwrap();
        provision_key(&mut chain, "0", "01", KeyKind::Leaf, &mut rng).unwrap();
        provision_key(&mut chain, "00", "000", KeyKind::Leaf, &mut rng).unwrap();
        chain
    }

    #[test]
    fn test_digest_is_over_hex_text() {
        let data = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02, 0x03, 0xff, 0xfe, 0xfd, 0xfc, 0xfb, 0xfa, 0xf9, 0xf8];
        let digest = digest_blocks::<Sha256Hasher, _>(&mut &data[..]).unwrap();
        assert_eq!(
            digest,
            Sha256Hasher::digest(b"deadbeef00010203fffefdfcfbfaf9f8")
        );
    }

    #[test]
    fn test_provision_is_deterministic_with_seeded_rng() {
        let a = chain_with_leaves();
        let b = chain_with_leaves();
        assert_eq!(a.plaintext_key("000"), b.plaintext_key("000"));
        assert_ne!(a.plaintext_key("000"), a.plaintext_key("01"));
    }

    #[test]
    fn test_encrypt_output_shape() {
        let tmp = TempDir::new().unwrap();
        let mut chain = chain_with_leaves();
        let input = tmp.path().join("plain");
        let output = tmp.path().join("sealed");

        for (len, blocks) in [(0usize, 1usize), (7, 1), (8, 2), (9, 2), (16, 3)] {
            std::fs::write(&input, vec![0x5A; len]).unwrap();
            encrypt_file(&mut chain, "01", &input, &output, &StreamOptions::default()).unwrap();
            assert_eq!(std::fs::read(&output).unwrap().len(), blocks * KEY_LEN, "input of {len} bytes");
        }
    }

    #[test]
    fn test_encrypt_binds_ciphertext_digest() {
        let tmp = TempDir::new().unwrap();
        let mut chain = chain_with_leaves();
        let input = tmp.path().join("plain");
        let output = tmp.path().join("sealed");
        std::fs::write(&input, b"bind me to the tree").unwrap();

        encrypt_file(&mut chain, "000", &input, &output, &StreamOptions::default()).unwrap();

        let expected = ciphertext_digest::<Sha256Hasher>(&output, &StreamOptions::default()).unwrap();
        assert_eq!(chain.bound_digest("000"), Some(expected));
        assert!(chain.verify_all());
    }

    #[test]
    fn test_encrypt_rejects_internal_and_absent() {
        let tmp = TempDir::new().unwrap();
        let mut chain = chain_with_leaves();
        let input = tmp.path().join("plain");
        std::fs::write(&input, b"x").unwrap();
        let out = tmp.path().join("out");
        let opts = StreamOptions::default();

        assert!(matches!(encrypt_file(&mut chain, "00", &input, &out, &opts), Err(TsmError::WrongKeyType(_))));
        assert!(matches!(encrypt_file(&mut chain, "0", &input, &out, &opts), Err(TsmError::WrongKeyType(_))));
        assert!(matches!(
            encrypt_file(&mut chain, "09", &input, &out, &opts),
            Err(TsmError::WrongKeyType(ref id)) if id == "09"
        ));
        assert!(!out.exists());
    }

    #[test]
    fn test_tampered_ancestor_is_key_violation() {
        let tmp = TempDir::new().unwrap();
        let mut chain = chain_with_leaves();
        let opts = StreamOptions::default();
        let input = tmp.path().join("plain");
        let sealed = tmp.path().join("sealed");
        let opened = tmp.path().join("opened");
        std::fs::write(&input, b"sealed under 000").unwrap();
        encrypt_file(&mut chain, "000", &input, &sealed, &opts).unwrap();

        let ancestor = chain.find("00").unwrap();
        chain.node_mut(ancestor).wrapped[0] ^= 0x01;

        // Ciphertext is untouched, so the data check passes and the key check fails.
        let digest = ciphertext_digest::<Sha256Hasher>(&sealed, &opts).unwrap();
        assert_eq!(chain.bound_digest("000"), Some(digest));
        assert!(matches!(
            decrypt_file(&chain, "000", &sealed, &opened, &opts),
            Err(TsmError::KeyIntegrityViolation(ref id)) if id == "000"
        ));
        assert!(!opened.exists());

        assert!(matches!(
            encrypt_file(&mut chain, "000", &input, &sealed, &opts),
            Err(TsmError::KeyIntegrityViolation(ref id)) if id == "000"
        ));
        assert_eq!(chain.bound_digest("000"), Some(digest), "no digest bound on failure");

        // The sibling branch is unaffected.
        encrypt_file(&mut chain, "01", &input, &sealed, &opts).unwrap();
        decrypt_file(&chain, "01", &sealed, &opened, &opts).unwrap();
        assert_eq!(std::fs::read(&opened).unwrap(), b"sealed under 000");
    }

    #[test]
    fn test_digest_covers_every_block_byte() {
        let data = [0u8; 2 * KEY_LEN];
        let mut flipped = data;
        flipped[KEY_LEN + 7] = 0x01;
        assert_ne!(
            digest_blocks::<Sha256Hasher, _>(&mut &data[..]).unwrap(),
            digest_blocks::<Sha256Hasher, _>(&mut &flipped[..]).unwrap()
        );
        assert_eq!(
            digest_blocks::<Sha256Hasher, _>(&mut &data[..]).unwrap(),
            Sha256Hasher::digest("0".repeat(4 * KEY_LEN).as_bytes())
        );
    }

    #[test]
    fn test_encrypt_missing_input_is_io() {
        let tmp = TempDir::new().unwrap();
        let mut chain = chain_with_leaves();
        let before = chain.node_hash("0");
        let result = encrypt_file(
            &mut chain,
            "01",
            &tmp.path().join("absent"),
            &tmp.path().join("out"),
            &StreamOptions::default(),
        );
        assert!(matches!(result, Err(TsmError::Io(_))));
        assert_eq!(chain.node_hash("0"), before, "no digest bound on failure");
    }

    #[test]
    fn test_small_buffer_matches_default() {
        let tmp = TempDir::new().unwrap();
        let mut chain = chain_with_leaves();
        let input = tmp.path().join("plain");
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 31) as u8).collect();
        std::fs::write(&input, &data).unwrap();

        let tiny = StreamOptions { buffer_blocks: 0 };
        encrypt_file(&mut chain, "01", &input, &tmp.path().join("a"), &tiny).unwrap();
        encrypt_file(&mut chain, "01", &input, &tmp.path().join("b"), &StreamOptions::default()).unwrap();
        assert_eq!(
            std::fs::read(tmp.path().join("a")).unwrap(),
            std::fs::read(tmp.path().join("b")).unwrap()
        );

        decrypt_file(&chain, "01", &tmp.path().join("b"), &tmp.path().join("c"), &tiny).unwrap();
        assert_eq!(std::fs::read(tmp.path().join("c")).unwrap(), data);
    }
}
