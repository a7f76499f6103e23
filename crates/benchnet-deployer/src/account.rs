//! Funded genesis accounts and the keyrings holding their private keys.

use std::fs;
use std::path::{Path, PathBuf};

use crate::keygen::{KeyError, KeyPair};

/// An account credited with tokens in the genesis state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenesisAccount {
    pub name: String,
    pub public_key: Vec<u8>,
    pub initial_tokens: u64,
}

/// Errors raised while minting or persisting an account.
#[derive(thiserror::Error, Debug)]
pub enum AccountError {
    #[error("failed to write keyring file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Where the private key of an account lives.
#[derive(Debug, Clone)]
pub enum Keyring {
    /// Held only in the orchestrator's memory.
    Ephemeral { name: String, key: KeyPair },
    /// Written to a directory so it can be shipped to an external process.
    Persisted {
        name: String,
        key: KeyPair,
        dir: PathBuf,
    },
}

impl Keyring {
    pub fn ephemeral(name: impl Into<String>, key: KeyPair) -> Self {
        Self::Ephemeral {
            name: name.into(),
            key,
        }
    }

    /// Persist `key` under `dir` as `<name>.pkcs8.hex` and `<name>.pub.hex`.
    pub fn persist(name: impl Into<String>, key: KeyPair, dir: &Path) -> Result<Self, AccountError> {
        let name = name.into();
        fs::create_dir_all(dir).map_err(|source| AccountError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let private_path = private_key_path(dir, &name);
        fs::write(&private_path, key.to_pkcs8_hex()?).map_err(|source| AccountError::Io {
            path: private_path.clone(),
            source,
        })?;

        let public_path = dir.join(format!("{name}.pub.hex"));
        fs::write(&public_path, hex::encode(key.public_key_bytes())).map_err(|source| {
            AccountError::Io {
                path: public_path.clone(),
                source,
            }
        })?;

        Ok(Self::Persisted {
            name,
            key,
            dir: dir.to_path_buf(),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Ephemeral { name, .. } | Self::Persisted { name, .. } => name,
        }
    }

    pub fn key(&self) -> &KeyPair {
        match self {
            Self::Ephemeral { key, .. } | Self::Persisted { key, .. } => key,
        }
    }

    /// The keyring directory, if the key was persisted.
    pub fn dir(&self) -> Option<&Path> {
        match self {
            Self::Ephemeral { .. } => None,
            Self::Persisted { dir, .. } => Some(dir),
        }
    }

    /// Path of the persisted private key, if any.
    pub fn private_key_path(&self) -> Option<PathBuf> {
        self.dir().map(|dir| private_key_path(dir, self.name()))
    }
}

fn private_key_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.pkcs8.hex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::{KeyGenerator, KeyRole};

    #[test]
    fn test_persisted_keyring_writes_both_halves() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key = KeyGenerator::new(3).generate(KeyRole::FundedAccount);

        let keyring =
            Keyring::persist("txsim0", key.clone(), &dir.path().join("keys")).expect("persist");

        let private_path = keyring.private_key_path().expect("persisted key has a path");
        let private_hex = fs::read_to_string(&private_path).expect("private key written");
        assert_eq!(private_hex, key.to_pkcs8_hex().expect("encodes"));

        let public_hex =
            fs::read_to_string(dir.path().join("keys/txsim0.pub.hex")).expect("public key written");
        assert_eq!(public_hex, hex::encode(key.public_key_bytes()));
    }

    #[test]
    fn test_ephemeral_keyring_has_no_dir() {
        let key = KeyGenerator::new(3).generate(KeyRole::FundedAccount);
        let keyring = Keyring::ephemeral("faucet", key);
        assert_eq!(keyring.name(), "faucet");
        assert!(keyring.dir().is_none());
        assert!(keyring.private_key_path().is_none());
    }
}
