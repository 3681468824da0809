//! tsm-core: shared types, configuration, and errors for the trusted security module

pub mod config;
pub mod error;
pub mod types;

pub use error::{TsmError, TsmResult};
pub use types::KeyKind;
