//! Deterministic key material for test networks.
//!
//! Every key in a network is derived from a single `u64` seed. Each [`KeyRole`] draws from its
//! own pseudo-random stream, so the Nth key of a role only depends on the seed and on how many
//! keys of that role were generated before it, never on how calls for different roles interleave.

use std::collections::HashMap;
use std::fmt;

use ed25519_dalek::SigningKey;
use p256::SecretKey;
use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use pkcs8::EncodePrivateKey as _;
use rand::rngs::StdRng;
use rand::{RngCore as _, SeedableRng as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// The purpose a key is minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRole {
    /// Consensus signing key of a node (`priv_validator_key.json`).
    Consensus,
    /// P2P identity key of a node (`node_key.json`).
    Network,
    /// Operator account of a node.
    Account,
    /// Funded genesis accounts handed to drivers and load clients.
    FundedAccount,
}

impl KeyRole {
    /// Stable tag mixed into the seed of this role's stream.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Consensus => "consensus",
            Self::Network => "network",
            Self::Account => "account",
            Self::FundedAccount => "funded-account",
        }
    }

    /// The signature scheme used for keys of this role.
    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::Consensus | Self::Network => KeyAlgorithm::Ed25519,
            Self::Account | Self::FundedAccount => KeyAlgorithm::EcdsaP256,
        }
    }
}

/// Signature scheme labels for generated keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    Ed25519,
    EcdsaP256,
}

/// Errors raised while encoding key material.
#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    /// PKCS#8 encoding of a private key failed.
    #[error("failed to encode private key as PKCS#8: {0}")]
    Pkcs8(#[from] pkcs8::Error),
    /// The key's algorithm has no PKCS#8 encoding in this crate.
    #[error("PKCS#8 encoding is not supported for {0:?} keys")]
    UnsupportedEncoding(KeyAlgorithm),
}

/// A generated private key together with its public half.
#[derive(Clone)]
pub enum KeyPair {
    Ed25519(SigningKey),
    EcdsaP256(SecretKey),
}

impl KeyPair {
    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            Self::Ed25519(_) => KeyAlgorithm::Ed25519,
            Self::EcdsaP256(_) => KeyAlgorithm::EcdsaP256,
        }
    }

    /// Raw public key bytes (32 bytes for ed25519, SEC1 compressed point for P-256).
    pub fn public_key_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ed25519(key) => key.verifying_key().to_bytes().to_vec(),
            Self::EcdsaP256(key) => key.public_key().to_encoded_point(true).as_bytes().to_vec(),
        }
    }

    /// Raw private scalar / seed bytes.
    pub fn secret_key_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ed25519(key) => key.to_bytes().to_vec(),
            Self::EcdsaP256(key) => key.to_bytes().to_vec(),
        }
    }

    /// Hex-encoded PKCS#8 DER of the private key, the format load clients read their keys in.
    pub fn to_pkcs8_hex(&self) -> Result<String, KeyError> {
        match self {
            Self::EcdsaP256(key) => {
                let der = key.to_pkcs8_der()?;
                Ok(hex::encode(der.as_bytes()))
            }
            Self::Ed25519(_) => Err(KeyError::UnsupportedEncoding(KeyAlgorithm::Ed25519)),
        }
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm() == other.algorithm() && self.secret_key_bytes() == other.secret_key_bytes()
    }
}

impl Eq for KeyPair {}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm())
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// The three independent keys that make up a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub signing: KeyPair,
    pub network: KeyPair,
    pub account: KeyPair,
}

impl NodeIdentity {
    /// The CometBFT node ID derived from the network key.
    pub fn node_id(&self) -> String {
        node_id(&self.network.public_key_bytes())
    }

    /// The consensus address derived from the signing key.
    pub fn validator_address(&self) -> String {
        validator_address(&self.signing.public_key_bytes())
    }
}

/// Node ID is the first 20 bytes of SHA256(pubkey), hex-encoded.
pub fn node_id(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);
    hex::encode(&hash[..20])
}

/// Address is the first 20 bytes of SHA256(pubkey), hex-encoded uppercase.
pub fn validator_address(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);
    hex::encode_upper(&hash[..20])
}

/// Seeded generator of key material, one stream per [`KeyRole`].
pub struct KeyGenerator {
    seed: u64,
    streams: HashMap<KeyRole, StdRng>,
}

impl KeyGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            streams: HashMap::new(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Generate the next key for `role`.
    pub fn generate(&mut self, role: KeyRole) -> KeyPair {
        let seed = self.seed;
        let rng = self
            .streams
            .entry(role)
            .or_insert_with(|| role_stream(seed, role));

        match role.algorithm() {
            KeyAlgorithm::Ed25519 => {
                let mut secret = [0u8; 32];
                rng.fill_bytes(&mut secret);
                KeyPair::Ed25519(SigningKey::from_bytes(&secret))
            }
            KeyAlgorithm::EcdsaP256 => KeyPair::EcdsaP256(SecretKey::random(rng)),
        }
    }

    /// Mint the signing, network and account keys of one node.
    pub fn identity(&mut self) -> NodeIdentity {
        NodeIdentity {
            signing: self.generate(KeyRole::Consensus),
            network: self.generate(KeyRole::Network),
            account: self.generate(KeyRole::Account),
        }
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGenerator")
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

fn role_stream(seed: u64, role: KeyRole) -> StdRng {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(role.tag().as_bytes());
    let mut stream_seed = [0u8; 32];
    stream_seed.copy_from_slice(&hasher.finalize());
    StdRng::from_seed(stream_seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_identities() {
        let mut a = KeyGenerator::new(42);
        let mut b = KeyGenerator::new(42);

        for _ in 0..3 {
            assert_eq!(a.identity(), b.identity());
        }
    }

    #[test]
    fn test_different_seeds_diverge() {
        let mut a = KeyGenerator::new(42);
        let mut b = KeyGenerator::new(43);
        assert_ne!(a.identity(), b.identity());
    }

    #[test]
    fn test_roles_are_independent_of_interleaving() {
        let mut interleaved = KeyGenerator::new(7);
        let _ = interleaved.generate(KeyRole::Account);
        let _ = interleaved.generate(KeyRole::FundedAccount);
        let first = interleaved.generate(KeyRole::Consensus);
        let second = interleaved.generate(KeyRole::Consensus);

        let mut sequential = KeyGenerator::new(7);
        assert_eq!(sequential.generate(KeyRole::Consensus), first);
        assert_eq!(sequential.generate(KeyRole::Consensus), second);
    }

    #[test]
    fn test_identity_keys_are_distinct() {
        let identity = KeyGenerator::new(1).identity();
        assert_ne!(identity.signing, identity.network);
        assert_eq!(identity.signing.algorithm(), KeyAlgorithm::Ed25519);
        assert_eq!(identity.network.algorithm(), KeyAlgorithm::Ed25519);
        assert_eq!(identity.account.algorithm(), KeyAlgorithm::EcdsaP256);
    }

    #[test]
    fn test_derived_identifiers() {
        let identity = KeyGenerator::new(1).identity();
        let id = identity.node_id();
        assert_eq!(id.len(), 40);
        assert_eq!(id, id.to_lowercase());

        let address = identity.validator_address();
        assert_eq!(address.len(), 40);
        assert_eq!(address, address.to_uppercase());
    }

    #[test]
    fn test_pkcs8_encoding() {
        let mut keygen = KeyGenerator::new(9);
        let account = keygen.generate(KeyRole::FundedAccount);
        let encoded = account.to_pkcs8_hex().expect("P-256 keys encode");
        assert!(hex::decode(encoded).is_ok());

        let network = keygen.generate(KeyRole::Network);
        assert!(matches!(
            network.to_pkcs8_hex(),
            Err(KeyError::UnsupportedEncoding(KeyAlgorithm::Ed25519))
        ));
    }
}
