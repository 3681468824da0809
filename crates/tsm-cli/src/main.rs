//! tsm: trusted security module key chain CLI
//!
//! Commands:
//!   init                          - create an empty chain snapshot
//!   add <parent> <id> [--kind]    - provision a random key under <parent>
//!   revoke <id>                   - remove a key and everything under it
//!   list                          - show the key tree
//!   verify [<id>]                 - check one key path, or the whole tree
//!   encrypt <in> <out> --key <id> - seal a file under a leaf key
//!   decrypt <in> <out> --key <id> - open a file sealed under a leaf key
//!   demo <dir>                    - scripted walkthrough on an in-memory chain
//!   config show                   - display current configuration

mod demo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use tsm_core::config::TsmConfig;
use tsm_keychain::{
    decrypt_file, encrypt_file, provision_key, revoke_key, ChainSnapshot, Key, KeyChain, KeyKind,
    StreamOptions,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "tsm",
    version,
    about = "Trusted security module key chain",
    long_about = "tsm: provision and revoke hierarchical keys, and encrypt files under integrity-bound leaf keys"
)]
struct Cli {
    /// Path to tsm.toml configuration file
    #[arg(long, short = 'c', env = "TSM_CONFIG", default_value = "tsm.toml")]
    config: PathBuf,

    /// Chain snapshot path (overrides [chain] snapshot)
    #[arg(long, env = "TSM_CHAIN", global = true)]
    chain: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error; overrides [logging] level)
    #[arg(long, env = "TSM_LOG", global = true)]
    log: Option<String>,

    /// Log format (overrides [logging] format)
    #[arg(long, env = "TSM_LOG_FORMAT", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a chain snapshot holding only the root key
    Init {
        /// Overwrite an existing snapshot
        #[arg(long)]
        force: bool,
    },

    /// Provision a fresh random key under <parent>
    Add {
        /// Parent key id (e.g. 0)
        parent: String,
        /// New key id: the parent id plus one digit (e.g. 01)
        id: String,
        /// Key kind: leaf keys encrypt files, internal keys wrap other keys
        #[arg(long, short = 'k', default_value = "leaf")]
        kind: KeyKind,
    },

    /// Revoke a key and every key derived under it
    Revoke {
        id: String,
    },

    /// List every key in the chain
    List,

    /// Verify a key's path to the root (or the whole tree when no id is given)
    Verify {
        id: Option<String>,
    },

    /// Encrypt a file under a leaf key, binding the ciphertext to the key
    Encrypt {
        input: PathBuf,
        output: PathBuf,
        /// Leaf key id
        #[arg(long)]
        key: String,
    },

    /// Decrypt a file sealed under a leaf key
    ///
    /// Fails without writing output when the ciphertext or the key path has
    /// been tampered with.
    Decrypt {
        input: PathBuf,
        output: PathBuf,
        /// Leaf key id
        #[arg(long)]
        key: String,
    },

    /// Run the scripted walkthrough in <dir> (uses file.txt, writes file.enc and file.dec)
    Demo {
        dir: PathBuf,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = TsmConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    init_logging(&cli, &config);
    if !cli.config.exists() {
        warn!("config file not found: {}  (using defaults)", cli.config.display());
    }

    let snapshot = cli.chain.clone().unwrap_or_else(|| config.chain.snapshot.clone());
    let opts = StreamOptions {
        buffer_blocks: config.cipher.io_buffer_blocks,
    };

    match cli.command {
        Commands::Init { force } => cmd_init(&config, &snapshot, force),
        Commands::Add { parent, id, kind } => cmd_add(&config, &snapshot, &parent, &id, kind),
        Commands::Revoke { id } => cmd_revoke(&config, &snapshot, &id),
        Commands::List => cmd_list(&config, &snapshot),
        Commands::Verify { id } => cmd_verify(&config, &snapshot, id.as_deref()),
        Commands::Encrypt { input, output, key } => {
            cmd_encrypt(&config, &snapshot, &input, &output, &key, &opts)
        }
        Commands::Decrypt { input, output, key } => {
            cmd_decrypt(&config, &snapshot, &input, &output, &key, &opts)
        }
        Commands::Demo { dir } => cmd_demo(&config, &dir, &opts),
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
    }
}

fn init_logging(cli: &Cli, config: &TsmConfig) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let level = cli.log.as_deref().unwrap_or(&config.logging.level);
    let format = cli
        .log_format
        .clone()
        .or_else(|| LogFormat::from_str(&config.logging.format, true).ok())
        .unwrap_or(LogFormat::Text);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so command output stays pipeable.
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

// ── Chain persistence ─────────────────────────────────────────────────────────

fn root_key(config: &TsmConfig) -> Result<Key> {
    let secret = config.chain.root_secret()?;
    Ok(Key::from_hex(&secret)?)
}

fn load_chain(config: &TsmConfig, path: &Path) -> Result<KeyChain> {
    let bytes = std::fs::read(path).with_context(|| {
        format!("reading chain snapshot {} (run `tsm init` first)", path.display())
    })?;
    let snapshot = ChainSnapshot::from_bytes(&bytes)?;
    let chain = KeyChain::import(root_key(config)?, &snapshot)
        .with_context(|| format!("loading chain snapshot {}", path.display()))?;
    Ok(chain)
}

/// Write to a sibling temp file and rename over the old snapshot.
fn save_chain(chain: &KeyChain, path: &Path) -> Result<()> {
    let bytes = chain.export().to_bytes()?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn cmd_init(config: &TsmConfig, snapshot: &Path, force: bool) -> Result<()> {
    if snapshot.exists() && !force {
        anyhow::bail!(
            "chain snapshot {} already exists (use --force to overwrite)",
            snapshot.display()
        );
    }
    let chain = KeyChain::new(root_key(config)?);
    save_chain(&chain, snapshot)?;
    info!(snapshot = %snapshot.display(), "initialized key chain");
    println!("initialized {}", snapshot.display());
    Ok(())
}

fn cmd_add(config: &TsmConfig, snapshot: &Path, parent: &str, id: &str, kind: KeyKind) -> Result<()> {
    let mut chain = load_chain(config, snapshot)?;
    provision_key(&mut chain, parent, id, kind, &mut rand::thread_rng())
        .with_context(|| format!("adding key {id} under {parent}"))?;
    save_chain(&chain, snapshot)?;
    println!("added {kind} key {id}");
    Ok(())
}

fn cmd_revoke(config: &TsmConfig, snapshot: &Path, id: &str) -> Result<()> {
    let mut chain = load_chain(config, snapshot)?;
    let removed = chain.descendant_count(id).map_or(0, |n| n + 1);
    revoke_key(&mut chain, id).with_context(|| format!("revoking key {id}"))?;
    save_chain(&chain, snapshot)?;
    println!("revoked {id} ({removed} key(s) removed)");
    Ok(())
}

fn cmd_list(config: &TsmConfig, snapshot: &Path) -> Result<()> {
    let chain = load_chain(config, snapshot)?;
    for id in chain.ids() {
        let kind = chain.kind(&id).map(|k| k.to_string()).unwrap_or_default();
        let descendants = chain.descendant_count(&id).unwrap_or(0);
        let indent = (id.len() - 1) * 2;
        println!("{:indent$}{id:<8} {kind:<8} descendants={descendants}", "");
    }
    println!("{} key(s) below the root", chain.count());
    Ok(())
}

fn cmd_verify(config: &TsmConfig, snapshot: &Path, id: Option<&str>) -> Result<()> {
    // Import already checks every stored hash; a loaded chain is consistent.
    let chain = load_chain(config, snapshot)?;
    match id {
        Some(id) if !chain.contains(id) => anyhow::bail!("key {id} not found"),
        Some(id) if !chain.verify_key(id) => anyhow::bail!("key {id} failed verification"),
        Some(id) => println!("{id}: ok"),
        None if !chain.verify_all() => anyhow::bail!("key chain failed verification"),
        None => println!("all {} key(s): ok", chain.count()),
    }
    Ok(())
}

fn cmd_encrypt(
    config: &TsmConfig,
    snapshot: &Path,
    input: &Path,
    output: &Path,
    key: &str,
    opts: &StreamOptions,
) -> Result<()> {
    let mut chain = load_chain(config, snapshot)?;
    encrypt_file(&mut chain, key, input, output, opts)
        .with_context(|| format!("encrypting {} under {key}", input.display()))?;
    save_chain(&chain, snapshot)?;
    println!("encrypted {} into {}", input.display(), output.display());
    Ok(())
}

fn cmd_decrypt(
    config: &TsmConfig,
    snapshot: &Path,
    input: &Path,
    output: &Path,
    key: &str,
    opts: &StreamOptions,
) -> Result<()> {
    let chain = load_chain(config, snapshot)?;
    decrypt_file(&chain, key, input, output, opts)
        .with_context(|| format!("decrypting {} with {key}", input.display()))?;
    println!("decrypted {} into {}", input.display(), output.display());
    Ok(())
}

fn cmd_demo(config: &TsmConfig, dir: &Path, opts: &StreamOptions) -> Result<()> {
    let root = match config.chain.root_secret() {
        Ok(secret) => Key::from_hex(&secret)?,
        Err(_) => Key::from_bytes(demo::DEMO_ROOT_SECRET),
    };
    let outcome = demo::run(dir, root, opts)?;
    if !outcome.passed() {
        anyhow::bail!("demo did not behave as expected: {outcome:?}");
    }
    Ok(())
}

fn cmd_config_show(config: &TsmConfig, path: &Path) -> Result<()> {
    println!("# config: {}", path.display());
    println!("{}", toml::to_string_pretty(config).context("serializing config")?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    fn config_with_secret(dir: &Path) -> TsmConfig {
        let mut config = TsmConfig::default();
        config.chain.snapshot = dir.join("chain.json");
        config.chain.root_secret_hex = Some("0123456789abcdef".into());
        config
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_add_with_kind() {
        let cli = Cli::try_parse_from(["tsm", "add", "0", "00", "--kind", "internal"]).unwrap();
        match cli.command {
            Commands::Add { parent, id, kind } => {
                assert_eq!(parent, "0");
                assert_eq!(id, "00");
                assert_eq!(kind, KeyKind::Internal);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["tsm", "add", "0", "00", "--kind", "branch"]).is_err());
    }

    #[test]
    fn test_snapshot_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let config = config_with_secret(tmp.path());
        let snapshot = config.chain.snapshot.clone();

        cmd_init(&config, &snapshot, false).unwrap();
        assert!(cmd_init(&config, &snapshot, false).is_err());

        cmd_add(&config, &snapshot, "0", "00", KeyKind::Internal).unwrap();
        cmd_add(&config, &snapshot, "00", "001", KeyKind::Leaf).unwrap();

        let plain = tmp.path().join("plain.txt");
        let sealed = tmp.path().join("plain.enc");
        let opened = tmp.path().join("plain.dec");
        std::fs::write(&plain, b"stored across invocations").unwrap();
        let opts = StreamOptions::default();

        cmd_encrypt(&config, &snapshot, &plain, &sealed, "001", &opts).unwrap();
        cmd_decrypt(&config, &snapshot, &sealed, &opened, "001", &opts).unwrap();
        assert_eq!(std::fs::read(&opened).unwrap(), b"stored across invocations");
        cmd_verify(&config, &snapshot, Some("001")).unwrap();
        cmd_verify(&config, &snapshot, None).unwrap();

        cmd_revoke(&config, &snapshot, "00").unwrap();
        assert!(cmd_decrypt(&config, &snapshot, &sealed, &opened, "001", &opts).is_err());
        assert!(cmd_verify(&config, &snapshot, Some("001")).is_err());
        assert_eq!(load_chain(&config, &snapshot).unwrap().count(), 0);
    }

    #[test]
    fn test_wrong_root_secret_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = config_with_secret(tmp.path());
        let snapshot = config.chain.snapshot.clone();
        cmd_init(&config, &snapshot, false).unwrap();
        cmd_add(&config, &snapshot, "0", "01", KeyKind::Leaf).unwrap();

        let mut other = config.clone();
        other.chain.root_secret_hex = Some("ffffffffffffffff".into());
        assert!(load_chain(&other, &snapshot).is_err());
    }
}
