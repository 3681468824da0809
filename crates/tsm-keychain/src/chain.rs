//! Key-derivation tree with an embedded Merkle hash tree
//!
//! Nodes live in an arena addressed by `NodeIdx`; each node keeps its parent
//! index for upward walks and an ordered child list (most recent first).
//! Removing a node releases its whole subtree back to the arena free list.

use std::marker::PhantomData;

use tracing::{debug, warn};
use zeroize::Zeroize;

use tsm_core::types::{is_child_id, is_valid_id, parent_id, ROOT_ID};
use tsm_core::{KeyKind, TsmError, TsmResult};

use crate::cipher::{BlockCipher, XorCipher};
use crate::hash::{ChainHasher, Digest, Sha256Hasher, ZERO_DIGEST};
use crate::key::Key;
use crate::Block;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeIdx(pub(crate) usize);

pub(crate) const ROOT: NodeIdx = NodeIdx(0);

/// The digest slot of a node. Internal keys commit to their children; leaves
/// commit to an externally bound digest (the ciphertext digest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Internal { child_digest: Digest },
    Leaf { bound_digest: Digest },
}

impl Slot {
    pub(crate) fn empty(kind: KeyKind) -> Self {
        match kind {
            KeyKind::Internal => Slot::Internal {
                child_digest: ZERO_DIGEST,
            },
            KeyKind::Leaf => Slot::Leaf {
                bound_digest: ZERO_DIGEST,
            },
        }
    }

    pub(crate) fn kind(&self) -> KeyKind {
        match self {
            Slot::Internal { .. } => KeyKind::Internal,
            Slot::Leaf { .. } => KeyKind::Leaf,
        }
    }

    pub(crate) fn digest(&self) -> &Digest {
        match self {
            Slot::Internal { child_digest } => child_digest,
            Slot::Leaf { bound_digest } => bound_digest,
        }
    }
}

pub(crate) struct KeyNode {
    pub(crate) id: String,
    pub(crate) depth: usize,
    /// Own key wrapped under the parent's plaintext key; the raw secret at the root.
    pub(crate) wrapped: Block,
    pub(crate) slot: Slot,
    pub(crate) node_hash: Digest,
    /// Number of all descendants, not only direct children.
    pub(crate) descendants: usize,
    pub(crate) parent: Option<NodeIdx>,
    pub(crate) children: Vec<NodeIdx>,
}

impl KeyNode {
    pub(crate) fn kind(&self) -> KeyKind {
        self.slot.kind()
    }
}

impl Drop for KeyNode {
    fn drop(&mut self) {
        self.wrapped.zeroize();
    }
}

/// Hierarchy of wrapped keys rooted at the hardware root secret.
pub struct KeyChain<C: BlockCipher = XorCipher, H: ChainHasher = Sha256Hasher> {
    cipher: C,
    nodes: Vec<Option<KeyNode>>,
    free: Vec<usize>,
    total_keys: usize,
    _hasher: PhantomData<H>,
}

impl KeyChain {
    /// New chain holding only the root, using the default cipher and hash.
    pub fn new(root_secret: Key) -> Self {
        Self::with_cipher(root_secret, XorCipher)
    }
}

impl<C: BlockCipher, H: ChainHasher> KeyChain<C, H> {
    pub fn with_cipher(root_secret: Key, cipher: C) -> Self {
        let mut root = KeyNode {
            id: ROOT_ID.to_string(),
            depth: 0,
            wrapped: *root_secret.as_bytes(),
            slot: Slot::empty(KeyKind::Internal),
            node_hash: ZERO_DIGEST,
            descendants: 0,
            parent: None,
            children: Vec::new(),
        };
        root.node_hash = Self::hash_node(&root);

        Self {
            cipher,
            nodes: vec![Some(root)],
            free: Vec::new(),
            total_keys: 0,
            _hasher: PhantomData,
        }
    }

    pub fn cipher(&self) -> &C {
        &self.cipher
    }

    /// Number of keys, excluding the root.
    pub fn count(&self) -> usize {
        self.total_keys
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Plaintext key of `id`, unwrapped along the full ancestor chain.
    pub fn plaintext_key(&self, id: &str) -> Option<Key> {
        self.find(id).map(|idx| self.derive(idx))
    }

    pub fn wrapped_key(&self, id: &str) -> Option<Block> {
        self.find(id).map(|idx| self.node(idx).wrapped)
    }

    pub fn kind(&self, id: &str) -> Option<KeyKind> {
        self.find(id).map(|idx| self.node(idx).kind())
    }

    /// Digest bound to a leaf by `update_key`; `None` for absent or internal keys.
    pub fn bound_digest(&self, id: &str) -> Option<Digest> {
        match self.find(id).map(|idx| self.node(idx).slot) {
            Some(Slot::Leaf { bound_digest }) => Some(bound_digest),
            _ => None,
        }
    }

    pub fn node_hash(&self, id: &str) -> Option<Digest> {
        self.find(id).map(|idx| self.node(idx).node_hash)
    }

    pub fn descendant_count(&self, id: &str) -> Option<usize> {
        self.find(id).map(|idx| self.node(idx).descendants)
    }

    /// Every id in pre-order, children in list order.
    pub fn ids(&self) -> Vec<String> {
        self.preorder()
            .into_iter()
            .map(|idx| self.node(idx).id.clone())
            .collect()
    }

    /// Add `id` under `parent_id`, wrapping `key` with the parent's plaintext key.
    ///
    /// All checks run before the tree is touched, so a failed call leaves the
    /// chain unchanged.
    pub fn add_key(&mut self, parent_id: &str, id: &str, key: &Key, kind: KeyKind) -> TsmResult<()> {
        if !is_child_id(parent_id, id) {
            return Err(TsmError::InvalidId {
                parent: parent_id.to_string(),
                id: id.to_string(),
            });
        }
        let parent = self
            .find(parent_id)
            .ok_or_else(|| TsmError::ParentNotFound(parent_id.to_string()))?;
        if self.find(id).is_some() {
            return Err(TsmError::DuplicateId(id.to_string()));
        }
        if self.node(parent).kind() == KeyKind::Leaf {
            return Err(TsmError::ParentIsLeaf(parent_id.to_string()));
        }

        let parent_key = self.derive(parent);
        let mut node = KeyNode {
            id: id.to_string(),
            depth: parent_id.len(),
            wrapped: self.cipher.encrypt_block(key.as_bytes(), &parent_key),
            slot: Slot::empty(kind),
            node_hash: ZERO_DIGEST,
            descendants: 0,
            parent: Some(parent),
            children: Vec::new(),
        };
        node.node_hash = Self::hash_node(&node);

        let idx = self.alloc(node);
        self.node_mut(parent).children.insert(0, idx);

        let mut ancestor = Some(parent);
        while let Some(a) = ancestor {
            let node = self.node_mut(a);
            node.descendants += 1;
            ancestor = node.parent;
        }
        self.total_keys += 1;
        self.propagate_from(parent);

        debug!(key_id = id, parent = parent_id, %kind, "added key");
        Ok(())
    }

    /// Remove `id` and every key derived under it.
    pub fn remove_key(&mut self, id: &str) -> TsmResult<()> {
        if id == ROOT_ID {
            return Err(TsmError::CannotRemoveRoot);
        }
        let idx = self
            .find(id)
            .ok_or_else(|| TsmError::NotFound(id.to_string()))?;
        let node = self.node(idx);
        let removed = node.descendants + 1;
        let parent = match node.parent {
            Some(p) => p,
            None => return Err(TsmError::CannotRemoveRoot),
        };

        self.node_mut(parent).children.retain(|&c| c != idx);
        self.release_subtree(idx);

        let mut ancestor = Some(parent);
        while let Some(a) = ancestor {
            let node = self.node_mut(a);
            node.descendants -= removed;
            ancestor = node.parent;
        }
        self.total_keys -= removed;
        self.propagate_from(parent);

        debug!(key_id = id, removed, "removed key subtree");
        Ok(())
    }

    /// Bind `digest` to leaf `id` and re-hash its path to the root.
    pub fn update_key(&mut self, id: &str, digest: Digest) -> TsmResult<()> {
        let idx = self
            .find(id)
            .ok_or_else(|| TsmError::NotFound(id.to_string()))?;
        let node = self.node_mut(idx);
        match &mut node.slot {
            Slot::Leaf { bound_digest } => *bound_digest = digest,
            Slot::Internal { .. } => return Err(TsmError::WrongKeyType(id.to_string())),
        }
        let hash = Self::hash_node(node);
        node.node_hash = hash;

        if let Some(parent) = node.parent {
            self.propagate_from(parent);
        }
        debug!(key_id = id, digest = %hex::encode(digest), "bound digest to key");
        Ok(())
    }

    /// Check every node on the path from `id` to the root. Absent ids fail.
    pub fn verify_key(&self, id: &str) -> bool {
        let Some(mut idx) = self.find(id) else {
            return false;
        };
        loop {
            if !self.node_is_consistent(idx) {
                warn!(key_id = id, at = %self.node(idx).id, "key path verification failed");
                return false;
            }
            match self.node(idx).parent {
                Some(parent) => idx = parent,
                None => return true,
            }
        }
    }

    /// Check every node in the tree.
    pub fn verify_all(&self) -> bool {
        for idx in self.preorder() {
            if !self.node_is_consistent(idx) {
                warn!(at = %self.node(idx).id, "chain verification failed");
                return false;
            }
        }
        true
    }

    fn node_is_consistent(&self, idx: NodeIdx) -> bool {
        let node = self.node(idx);
        if let Slot::Internal { child_digest } = node.slot {
            if child_digest != self.children_digest(idx) {
                return false;
            }
        }
        node.node_hash == Self::hash_node(node)
    }

    pub(crate) fn find(&self, id: &str) -> Option<NodeIdx> {
        if !is_valid_id(id) || !id.starts_with(ROOT_ID) {
            return None;
        }
        let bytes = id.as_bytes();
        let mut cur = ROOT;
        for depth in 1..bytes.len() {
            cur = *self
                .node(cur)
                .children
                .iter()
                .find(|&&c| self.node(c).id.as_bytes()[depth] == bytes[depth])?;
        }
        Some(cur)
    }

    fn derive(&self, idx: NodeIdx) -> Key {
        let node = self.node(idx);
        match node.parent {
            None => Key::from_bytes(node.wrapped),
            Some(parent) => {
                let parent_key = self.derive(parent);
                Key::from_bytes(self.cipher.decrypt_block(&node.wrapped, &parent_key))
            }
        }
    }

    /// Hash of the children's node hashes in list order; zero when childless.
    pub(crate) fn children_digest(&self, idx: NodeIdx) -> Digest {
        let children = &self.node(idx).children;
        if children.is_empty() {
            return ZERO_DIGEST;
        }
        let mut hasher = H::default();
        for &child in children {
            hasher.update(&self.node(child).node_hash);
        }
        hasher.finalize()
    }

    pub(crate) fn hash_node(node: &KeyNode) -> Digest {
        let parent = parent_id(&node.id).unwrap_or("");
        let mut hasher = H::default();
        hasher.update(&(node.id.len() as u32).to_be_bytes());
        hasher.update(node.id.as_bytes());
        hasher.update(&(parent.len() as u32).to_be_bytes());
        hasher.update(parent.as_bytes());
        hasher.update(&node.wrapped);
        hasher.update(node.slot.digest());
        hasher.update(&[node.kind().tag()]);
        hasher.update(&(node.depth as u32).to_be_bytes());
        hasher.finalize()
    }

    /// Recompute digests and hashes from `start` up to the root.
    fn propagate_from(&mut self, start: NodeIdx) {
        let mut cur = Some(start);
        while let Some(idx) = cur {
            let children = self.children_digest(idx);
            let node = self.node_mut(idx);
            if let Slot::Internal { child_digest } = &mut node.slot {
                *child_digest = children;
            }
            let hash = Self::hash_node(node);
            node.node_hash = hash;
            cur = node.parent;
        }
    }

    pub(crate) fn preorder(&self) -> Vec<NodeIdx> {
        let mut order = Vec::with_capacity(self.total_keys + 1);
        let mut stack = vec![ROOT];
        while let Some(idx) = stack.pop() {
            order.push(idx);
            stack.extend(self.node(idx).children.iter().rev().copied());
        }
        order
    }

    pub(crate) fn node(&self, idx: NodeIdx) -> &KeyNode {
        self.nodes[idx.0].as_ref().expect("live node index")
    }

    pub(crate) fn node_mut(&mut self, idx: NodeIdx) -> &mut KeyNode {
        self.nodes[idx.0].as_mut().expect("live node index")
    }

    pub(crate) fn alloc(&mut self, node: KeyNode) -> NodeIdx {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                NodeIdx(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeIdx(self.nodes.len() - 1)
            }
        }
    }

    fn release_subtree(&mut self, idx: NodeIdx) {
        let mut stack = vec![idx];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.nodes[cur.0].take() {
                stack.extend(node.children.iter().copied());
                self.free.push(cur.0);
            }
        }
    }

    /// Rebuild hook for snapshots: replace the bookkeeping wholesale.
    pub(crate) fn set_total_keys(&mut self, total: usize) {
        self.total_keys = total;
    }
}

impl<C: BlockCipher, H: ChainHasher> std::fmt::Debug for KeyChain<C, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyChain")
            .field("keys", &self.total_keys)
            .field("ids", &self.ids())
            .finish()
    }
}
