//! Walkthrough of the module on a throwaway in-memory chain.
//!
//! Provisions "00" (internal), "01" and "000" (leaves), seals file.txt under
//! "01", shows that "000" cannot open it and "01" can, then revokes "01".

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use tsm_keychain::{decrypt_file, encrypt_file, provision_key, revoke_key, Key, KeyChain, KeyKind, StreamOptions};

/// Root secret used when no `TSM_ROOT_SECRET` is configured.
pub const DEMO_ROOT_SECRET: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];

const SAMPLE_TEXT: &str = "The quick brown fox jumps over the lazy dog.\n\
Key material never leaves the module unwrapped.\n";

#[derive(Debug, Default)]
pub struct DemoOutcome {
    pub wrong_key_rejected: bool,
    pub roundtrip_matches: bool,
    pub revoked_key_rejected: bool,
}

impl DemoOutcome {
    pub fn passed(&self) -> bool {
        self.wrong_key_rejected && self.roundtrip_matches && self.revoked_key_rejected
    }
}

pub fn run(dir: &Path, root: Key, opts: &StreamOptions) -> Result<DemoOutcome> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let plain = dir.join("file.txt");
    let sealed = dir.join("file.enc");
    let opened = dir.join("file.dec");
    if !plain.exists() {
        std::fs::write(&plain, SAMPLE_TEXT)
            .with_context(|| format!("writing {}", plain.display()))?;
    }

    let mut chain = KeyChain::new(root);
    let mut rng = rand::thread_rng();
    for (parent, id, kind) in [
        ("0", "00", KeyKind::Internal),
        ("0", "01", KeyKind::Leaf),
        ("00", "000", KeyKind::Leaf),
    ] {
        provision_key(&mut chain, parent, id, kind, &mut rng)?;
        println!("---added key {id} ({kind})");
    }

    let original = std::fs::read(&plain)?;
    println!("---original text:");
    println!("{}", String::from_utf8_lossy(&original));

    encrypt_file(&mut chain, "01", &plain, &sealed, opts)?;
    println!("---encrypted {} into {}", plain.display(), sealed.display());
    println!("---encrypted bytes:");
    println!("{}", hex::encode(std::fs::read(&sealed)?));

    let mut outcome = DemoOutcome::default();

    match decrypt_file(&chain, "000", &sealed, &opened, opts) {
        Ok(()) => println!("---decrypted with 000 (unexpected)"),
        Err(e) => {
            println!("---decryption with 000 failed: {e}");
            outcome.wrong_key_rejected = true;
        }
    }

    decrypt_file(&chain, "01", &sealed, &opened, opts)?;
    let decrypted = std::fs::read(&opened)?;
    println!("---decrypted text with 01:");
    println!("{}", String::from_utf8_lossy(&decrypted));
    outcome.roundtrip_matches = decrypted == original;

    revoke_key(&mut chain, "01")?;
    println!("---revoked key 01");

    match decrypt_file(&chain, "01", &sealed, &opened, opts) {
        Ok(()) => println!("---decrypted with revoked 01 (unexpected)"),
        Err(e) => {
            println!("---decryption with 01 failed: {e}");
            outcome.revoked_key_rejected = true;
        }
    }

    info!(passed = outcome.passed(), "demo finished");
    println!("-----done----");
    Ok(outcome)
}
