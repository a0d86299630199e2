//! Sender credentials.

use std::{fs, io, path::Path};

use alloy_primitives::B256;
use alloy_signer_local::PrivateKeySigner;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use thiserror::Error;

/// Failure to load a wallet file.
#[derive(Debug, Error)]
pub enum WalletError {
    /// The file could not be read.
    #[error("failed to read wallet file: {0}")]
    Io(#[from] io::Error),
    /// The file is not a wallet document.
    #[error("failed to parse wallet file: {0}")]
    Parse(#[from] serde_json::Error),
    /// An entry holds an invalid private key.
    #[error("invalid private key in wallet entry {index}")]
    InvalidKey {
        /// Position of the entry in the file.
        index: usize,
    },
    /// The file lists no wallets.
    #[error("wallet file is empty")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct WalletEntry {
    #[serde(alias = "privateKey")]
    private_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WalletsFile {
    List(Vec<WalletEntry>),
    Wrapped { wallets: Vec<WalletEntry> },
}

/// Loads signers from a JSON wallet file.
///
/// Accepts a bare array of `{"private_key": "0x.."}` entries or an object
/// holding that array under `wallets`. Other entry fields are ignored.
pub fn load_wallets(path: &Path) -> Result<Vec<PrivateKeySigner>, WalletError> {
    parse_wallets(&fs::read_to_string(path)?)
}

fn parse_wallets(json: &str) -> Result<Vec<PrivateKeySigner>, WalletError> {
    let entries = match serde_json::from_str(json)? {
        WalletsFile::List(entries) | WalletsFile::Wrapped { wallets: entries } => entries,
    };
    if entries.is_empty() {
        return Err(WalletError::Empty);
    }

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            entry.private_key.trim().parse().map_err(|_| WalletError::InvalidKey { index })
        })
        .collect()
}

/// Generates `count` signers, reproducibly when `seed` is set.
pub fn generate_wallets(count: usize, seed: Option<u64>) -> Vec<PrivateKeySigner> {
    let mut rng = match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_os_rng(),
    };
    // Out-of-range scalars are rare; draw again until the key is valid.
    std::iter::repeat_with(|| B256::from(rng.random::<[u8; 32]>()))
        .filter_map(|key| PrivateKeySigner::from_bytes(&key).ok())
        .take(count)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    #[test]
    fn parses_bare_list() {
        let json = format!(r#"[{{"private_key": "{KEY}"}}]"#);
        let signers = parse_wallets(&json).unwrap();
        assert_eq!(signers.len(), 1);
        assert_eq!(signers[0].address().to_checksum(None), ADDRESS);
    }

    #[test]
    fn parses_wrapped_list_with_extra_fields() {
        let json = format!(
            r#"{{"wallets": [{{"address": "{ADDRESS}", "privateKey": "{KEY}", "balance": "1"}}]}}"#
        );
        let signers = parse_wallets(&json).unwrap();
        assert_eq!(signers[0].address().to_checksum(None), ADDRESS);
    }

    #[test]
    fn reports_invalid_entry() {
        let json = format!(r#"[{{"private_key": "{KEY}"}}, {{"private_key": "0x1234"}}]"#);
        assert!(matches!(parse_wallets(&json), Err(WalletError::InvalidKey { index: 1 })));
    }

    #[test]
    fn rejects_empty_file() {
        assert!(matches!(parse_wallets("[]"), Err(WalletError::Empty)));
        assert!(matches!(parse_wallets(r#"{"wallets": []}"#), Err(WalletError::Empty)));
        assert!(matches!(parse_wallets("{}"), Err(WalletError::Parse(_))));
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"private_key": "{KEY}"}}]"#).unwrap();

        let signers = load_wallets(file.path()).unwrap();
        assert_eq!(signers.len(), 1);
    }

    #[test]
    fn seeded_generation_is_reproducible() {
        let first: Vec<_> = generate_wallets(3, Some(7)).iter().map(|s| s.address()).collect();
        let second: Vec<_> = generate_wallets(3, Some(7)).iter().map(|s| s.address()).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert_ne!(first[0], first[1]);
    }
}
