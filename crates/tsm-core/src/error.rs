use thiserror::Error;

pub type TsmResult<T> = Result<T, TsmError>;

#[derive(Debug, Error)]
pub enum TsmError {
    #[error("invalid key id '{id}' for parent '{parent}'")]
    InvalidId { parent: String, id: String },

    #[error("parent key not found: {0}")]
    ParentNotFound(String),

    #[error("key id already in chain: {0}")]
    DuplicateId(String),

    /// Leaf keys encrypt data and cannot wrap further keys.
    #[error("parent key {0} is a leaf and cannot hold children")]
    ParentIsLeaf(String),

    #[error("key not found: {0}")]
    NotFound(String),

    /// Raised by decryption when the key id no longer resolves (e.g. revoked).
    #[error("unknown or revoked key: {0}")]
    UnknownKey(String),

    #[error("the root key cannot be removed")]
    CannotRemoveRoot,

    #[error("key {0} has the wrong type for this operation")]
    WrongKeyType(String),

    #[error("key integrity violation on path of {0}")]
    KeyIntegrityViolation(String),

    #[error("ciphertext digest does not match the digest bound to key {0}")]
    DataIntegrityViolation(String),

    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TsmError {
    /// True for the errors that indicate tampering rather than misuse.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            TsmError::KeyIntegrityViolation(_) | TsmError::DataIntegrityViolation(_)
        )
    }
}
