//! Chain snapshot format
//!
//! A snapshot records every node in pre-order with its stored hashes. The root
//! secret is never written out; it is supplied again on import, and a wrong
//! secret shows up as a root hash mismatch.

use serde::{Deserialize, Serialize};

use tsm_core::types::{is_child_id, parent_id, ROOT_ID};
use tsm_core::{KeyKind, TsmError, TsmResult};

use crate::chain::{KeyChain, KeyNode, NodeIdx, Slot, ROOT};
use crate::cipher::{BlockCipher, XorCipher};
use crate::hash::{ChainHasher, Digest, ZERO_DIGEST};
use crate::key::Key;
use crate::{Block, DIGEST_LEN, KEY_LEN};

pub const SNAPSHOT_VERSION: u32 = 1;

/// One key node (hex-encoded fields)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub kind: KeyKind,
    /// Absent for the root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_key: Option<String>,
    /// Children digest (internal) or bound digest (leaf)
    pub digest: String,
    pub node_hash: String,
}

/// Serializable image of a key chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub version: u32,
    /// Pre-order, children in list order
    pub nodes: Vec<NodeRecord>,
}

impl ChainSnapshot {
    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> TsmResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| TsmError::Snapshot(format!("serialization: {e}")))
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(data: &[u8]) -> TsmResult<Self> {
        serde_json::from_slice(data)
            .map_err(|e| TsmError::Snapshot(format!("deserialization: {e}")))
    }
}

impl KeyChain {
    /// Rebuild a chain from `snapshot` with the default cipher and hash.
    pub fn import(root_secret: Key, snapshot: &ChainSnapshot) -> TsmResult<Self> {
        Self::import_with_cipher(root_secret, XorCipher, snapshot)
    }
}

impl<C: BlockCipher, H: ChainHasher> KeyChain<C, H> {
    pub fn export(&self) -> ChainSnapshot {
        let nodes = self
            .preorder()
            .into_iter()
            .map(|idx| {
                let node = self.node(idx);
                NodeRecord {
                    id: node.id.clone(),
                    kind: node.kind(),
                    wrapped_key: node.parent.map(|_| hex::encode(node.wrapped)),
                    digest: hex::encode(node.slot.digest()),
                    node_hash: hex::encode(node.node_hash),
                }
            })
            .collect();

        ChainSnapshot {
            version: SNAPSHOT_VERSION,
            nodes,
        }
    }

    /// Rebuild a chain from `snapshot`.
    ///
    /// Structure problems are `Snapshot` errors; any stored hash that does not
    /// match its recomputation (including a wrong root secret) is a
    /// `KeyIntegrityViolation`.
    pub fn import_with_cipher(root_secret: Key, cipher: C, snapshot: &ChainSnapshot) -> TsmResult<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(TsmError::Snapshot(format!(
                "unsupported snapshot version {} (expected {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }
        let (root, rest) = snapshot
            .nodes
            .split_first()
            .ok_or_else(|| TsmError::Snapshot("snapshot has no nodes".into()))?;
        if root.id != ROOT_ID || root.kind != KeyKind::Internal || root.wrapped_key.is_some() {
            return Err(TsmError::Snapshot("first node must be the internal root \"0\" without key".into()));
        }

        let mut chain = Self::with_cipher(root_secret, cipher);
        {
            let root_node = chain.node_mut(ROOT);
            root_node.slot = Slot::Internal {
                child_digest: decode_digest(&root.digest)?,
            };
            root_node.node_hash = decode_digest(&root.node_hash)?;
        }

        for record in rest {
            let pid = parent_id(&record.id)
                .filter(|p| is_child_id(p, &record.id))
                .ok_or_else(|| TsmError::Snapshot(format!("invalid key id '{}'", record.id)))?;
            let parent = chain
                .find(pid)
                .ok_or_else(|| TsmError::Snapshot(format!("{} listed before its parent", record.id)))?;
            if chain.find(&record.id).is_some() {
                return Err(TsmError::Snapshot(format!("duplicate key id {}", record.id)));
            }
            if chain.node(parent).kind() == KeyKind::Leaf {
                return Err(TsmError::Snapshot(format!("leaf {pid} has children")));
            }
            let wrapped = record
                .wrapped_key
                .as_deref()
                .ok_or_else(|| TsmError::Snapshot(format!("{} has no wrapped key", record.id)))
                .and_then(decode_block)?;
            let digest = decode_digest(&record.digest)?;

            let node = KeyNode {
                id: record.id.clone(),
                depth: pid.len(),
                wrapped,
                slot: match record.kind {
                    KeyKind::Internal => Slot::Internal { child_digest: digest },
                    KeyKind::Leaf => Slot::Leaf { bound_digest: digest },
                },
                node_hash: decode_digest(&record.node_hash)?,
                descendants: 0,
                parent: Some(parent),
                children: Vec::new(),
            };
            let idx = chain.alloc(node);
            chain.node_mut(parent).children.push(idx);
            bump_ancestors(&mut chain, idx);
        }
        chain.set_total_keys(rest.len());

        if !chain.verify_all() {
            return Err(TsmError::KeyIntegrityViolation(ROOT_ID.to_string()));
        }
        tracing::debug!(keys = rest.len(), "imported key chain snapshot");
        Ok(chain)
    }
}

fn bump_ancestors<C: BlockCipher, H: ChainHasher>(chain: &mut KeyChain<C, H>, idx: NodeIdx) {
    let mut ancestor = chain.node(idx).parent;
    while let Some(a) = ancestor {
        let node = chain.node_mut(a);
        node.descendants += 1;
        ancestor = node.parent;
    }
}

fn decode_block(s: &str) -> TsmResult<Block> {
    let mut out = [0u8; KEY_LEN];
    hex::decode_to_slice(s, &mut out)
        .map_err(|e| TsmError::Snapshot(format!("bad wrapped key '{s}': {e}")))?;
    Ok(out)
}

fn decode_digest(s: &str) -> TsmResult<Digest> {
    let mut out: Digest = ZERO_DIGEST;
    hex::decode_to_slice(s, &mut out)
        .map_err(|e| TsmError::Snapshot(format!("bad digest (want {DIGEST_LEN} bytes): {e}")))?;
    Ok(out)
}
