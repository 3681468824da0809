use serde::{Deserialize, Serialize};

/// Id of the root key; every other id extends it one digit per level.
pub const ROOT_ID: &str = "0";

/// Role of a key in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    /// Wraps further keys
    Internal,
    /// Encrypts file data directly
    Leaf,
}

impl KeyKind {
    /// Stable byte tag used when hashing a node.
    pub fn tag(self) -> u8 {
        match self {
            KeyKind::Internal => 0,
            KeyKind::Leaf => 1,
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyKind::Internal => f.write_str("internal"),
            KeyKind::Leaf => f.write_str("leaf"),
        }
    }
}

impl std::str::FromStr for KeyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(KeyKind::Internal),
            "leaf" => Ok(KeyKind::Leaf),
            other => Err(format!("unknown key kind '{other}' (expected leaf or internal)")),
        }
    }
}

/// A key id is a non-empty string of ASCII decimal digits.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}

/// `id` names a direct child of `parent`: exactly one more digit, same prefix.
pub fn is_child_id(parent: &str, id: &str) -> bool {
    is_valid_id(parent)
        && is_valid_id(id)
        && id.len() == parent.len() + 1
        && id.starts_with(parent)
}

/// Parent id of a non-root id
pub fn parent_id(id: &str) -> Option<&str> {
    if id.len() < 2 {
        None
    } else {
        Some(&id[..id.len() - 1])
    }
}
