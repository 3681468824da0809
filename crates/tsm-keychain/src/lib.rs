//! tsm-keychain: key-derivation tree and file protection for the trusted security module
//!
//! Every key is wrapped by its parent key, so recovering a key means unwrapping
//! along its whole ancestor chain. A Merkle hash tree over the same nodes lets
//! one key be authenticated by walking only its path to the root.
//!
//! Key hierarchy:
//! ```text
//! "0"   root secret (hardware UMK, stored raw)
//!  ├── "00"  internal key (wrapped by "0")
//!  │    └── "000"  leaf key (wrapped by "00") ── bound digest of its ciphertext
//!  └── "01"  leaf key (wrapped by "0")
//! ```
//!
//! Node hash = H(id || parent id || wrapped key || digest slot || kind || depth),
//! where the digest slot holds the children digest for internal keys and the
//! bound ciphertext digest for leaves.

pub mod block;
pub mod chain;
pub mod cipher;
pub mod hash;
pub mod key;
pub mod snapshot;
pub mod tsm;

pub use chain::KeyChain;
pub use cipher::{BlockCipher, XorCipher};
pub use hash::{ChainHasher, Digest, Sha256Hasher, ZERO_DIGEST};
pub use key::Key;
pub use snapshot::{ChainSnapshot, NodeRecord};
pub use tsm::{decrypt_file, encrypt_file, provision_key, revoke_key, StreamOptions};
pub use tsm_core::{KeyKind, TsmError, TsmResult};

/// Key length in bytes; also the cipher block length (64-bit)
pub const KEY_LEN: usize = 8;

/// Output size of the chain hash (256-bit)
pub const DIGEST_LEN: usize = 32;

/// One cipher block
pub type Block = [u8; KEY_LEN];
