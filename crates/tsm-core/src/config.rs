use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{TsmError, TsmResult};

/// Environment variable that overrides `[chain] root_secret_hex`
pub const ROOT_SECRET_ENV: &str = "TSM_ROOT_SECRET";

/// Top-level configuration (loaded from tsm.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TsmConfig {
    pub logging: LoggingConfig,
    pub chain: ChainConfig,
    pub cipher: CipherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// JSON snapshot of the key chain (default: tsm-chain.json)
    pub snapshot: PathBuf,
    /// Root secret as 16 hex chars. Stand-in for the hardware UMK register;
    /// `TSM_ROOT_SECRET` takes precedence.
    #[serde(skip_serializing)]
    pub root_secret_hex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    /// Buffered reader/writer capacity, in cipher blocks (default: 512)
    pub io_buffer_blocks: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            snapshot: PathBuf::from("tsm-chain.json"),
            root_secret_hex: None,
        }
    }
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            io_buffer_blocks: 512,
        }
    }
}

impl ChainConfig {
    /// Resolve the root secret: environment first, then the config file.
    pub fn root_secret(&self) -> TsmResult<SecretString> {
        if let Ok(value) = std::env::var(ROOT_SECRET_ENV) {
            return Ok(SecretString::from(value));
        }
        self.root_secret_hex
            .clone()
            .map(SecretString::from)
            .ok_or_else(|| {
                TsmError::Config(format!(
                    "no root secret: set {ROOT_SECRET_ENV} or [chain] root_secret_hex"
                ))
            })
    }
}

impl TsmConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    ///
    /// Callers decide how to report the missing file, since logging may not
    /// be set up yet when configuration is read.
    pub fn load(path: &Path) -> TsmResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| TsmError::Config(format!("parsing {}: {e}", path.display())))
    }
}
