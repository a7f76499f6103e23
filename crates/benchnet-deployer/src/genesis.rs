//! Genesis document construction.
//!
//! The genesis of a test network is a pure function of its genesis participants, its funded
//! accounts and an ordered list of [`Modifier`]s. All randomness has already been consumed by the
//! [`KeyGenerator`](crate::keygen::KeyGenerator) by the time a document is built, so building twice
//! from the same inputs yields byte-identical output.

use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::account::GenesisAccount;

/// Stake units per unit of consensus voting power.
pub const POWER_REDUCTION: u64 = 1_000_000;

/// Tokens credited to the operator account of every genesis node.
pub const OPERATOR_ACCOUNT_TOKENS: u64 = 1_000_000_000_000;

/// Default `gov_max_square_size` of the blob module.
pub const DEFAULT_GOV_MAX_SQUARE_SIZE: u64 = 64;

/// Default `consensus_params.block.max_bytes`.
pub const DEFAULT_MAX_BLOCK_BYTES: u64 = 22_020_096;

/// The view of a node that the genesis needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenesisParticipant {
    pub name: String,
    pub start_height: u64,
    pub self_delegation: u64,
    /// ed25519 consensus public key.
    pub consensus_key: Vec<u8>,
    /// Operator account public key.
    pub account_key: Vec<u8>,
}

impl GenesisParticipant {
    pub fn is_validator(&self) -> bool {
        self.self_delegation > 0
    }
}

/// A transform applied to the in-progress genesis document.
pub type Modifier =
    Arc<dyn Fn(GenesisDocument) -> Result<GenesisDocument, ModifierError> + Send + Sync>;

/// Wrap a closure into a [`Modifier`].
pub fn modifier<F>(f: F) -> Modifier
where
    F: Fn(GenesisDocument) -> Result<GenesisDocument, ModifierError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Failure reported by a genesis modifier.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ModifierError(pub String);

impl ModifierError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum GenesisError {
    #[error("genesis requires at least one genesis node")]
    NoGenesisNodes,
    #[error("node {name} starts at height {start_height} and cannot be part of genesis")]
    NotGenesisHeight { name: String, start_height: u64 },
    #[error("duplicate genesis participant name {0}")]
    DuplicateName(String),
    #[error("no validators: every genesis node has zero self-delegation")]
    NoValidators,
    #[error("genesis modifier #{index} failed: {source}")]
    Modifier {
        index: usize,
        #[source]
        source: ModifierError,
    },
    #[error("failed to serialize genesis: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A genesis document under construction or ready to be distributed.
#[derive(Debug, Clone, PartialEq)]
pub struct GenesisDocument(Value);

impl GenesisDocument {
    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Look up a nested field.
    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(&self.0, |value, key| value.get(key))
    }

    /// Set a nested field, creating intermediate objects as needed.
    pub fn set(&mut self, path: &[&str], value: Value) -> Result<(), ModifierError> {
        let Some((last, parents)) = path.split_last() else {
            return Err(ModifierError::new("empty genesis path"));
        };

        let mut current = &mut self.0;
        for key in parents {
            let object = current
                .as_object_mut()
                .ok_or_else(|| ModifierError::new(format!("genesis field {key:?} has a non-object parent")))?;
            current = object.entry(key.to_string()).or_insert_with(|| json!({}));
        }

        let object = current
            .as_object_mut()
            .ok_or_else(|| ModifierError::new(format!("genesis field {last:?} has a non-object parent")))?;
        object.insert(last.to_string(), value);
        Ok(())
    }

    /// Names of the validators in the consensus validator set.
    pub fn validator_names(&self) -> Vec<String> {
        self.get(&["validators"])
            .and_then(Value::as_array)
            .map(|validators| {
                validators
                    .iter()
                    .filter_map(|v| v["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The serialized document every node receives.
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        Ok(Bytes::from(serde_json::to_vec_pretty(&self.0)?))
    }
}

/// Builds genesis documents for one chain.
#[derive(Debug, Clone)]
pub struct GenesisBuilder {
    chain_id: String,
    genesis_time: DateTime<Utc>,
}

impl GenesisBuilder {
    pub fn new(chain_id: impl Into<String>, genesis_time: DateTime<Utc>) -> Self {
        Self {
            chain_id: chain_id.into(),
            genesis_time,
        }
    }

    /// Build the genesis from `participants` (all at height zero), funded `accounts` and
    /// `modifiers` applied in order.
    pub fn build(
        &self,
        participants: &[GenesisParticipant],
        accounts: &[GenesisAccount],
        modifiers: &[Modifier],
    ) -> Result<GenesisDocument, GenesisError> {
        if participants.is_empty() {
            return Err(GenesisError::NoGenesisNodes);
        }

        let mut names = HashSet::new();
        for participant in participants {
            if participant.start_height != 0 {
                return Err(GenesisError::NotGenesisHeight {
                    name: participant.name.clone(),
                    start_height: participant.start_height,
                });
            }
            if !names.insert(participant.name.as_str()) {
                return Err(GenesisError::DuplicateName(participant.name.clone()));
            }
        }

        let validators: Vec<_> = participants.iter().filter(|p| p.is_validator()).collect();
        if validators.is_empty() {
            return Err(GenesisError::NoValidators);
        }

        let validator_entries: Vec<Value> = validators
            .iter()
            .map(|validator| {
                json!({
                    "address": crate::keygen::validator_address(&validator.consensus_key),
                    "pub_key": {
                        "type": "tendermint/PubKeyEd25519",
                        "value": BASE64.encode(&validator.consensus_key)
                    },
                    "power": voting_power(validator.self_delegation).to_string(),
                    "name": validator.name
                })
            })
            .collect();

        let delegations: Vec<Value> = validators
            .iter()
            .map(|validator| {
                json!({
                    "validator": validator.name,
                    "delegator": hex::encode(&validator.account_key),
                    "amount": validator.self_delegation.to_string()
                })
            })
            .collect();

        let mut account_entries: Vec<Value> = participants
            .iter()
            .map(|participant| {
                json!({
                    "name": participant.name,
                    "pub_key": hex::encode(&participant.account_key),
                    "balance": OPERATOR_ACCOUNT_TOKENS.to_string()
                })
            })
            .collect();
        account_entries.extend(accounts.iter().map(|account| {
            json!({
                "name": account.name,
                "pub_key": hex::encode(&account.public_key),
                "balance": account.initial_tokens.to_string()
            })
        }));

        let mut document = GenesisDocument(json!({
            "genesis_time": self.genesis_time.format("%Y-%m-%dT%H:%M:%S%.9fZ").to_string(),
            "chain_id": self.chain_id,
            "initial_height": "1",
            "consensus_params": {
                "block": {
                    "max_bytes": DEFAULT_MAX_BLOCK_BYTES.to_string(),
                    "max_gas": "-1",
                    "time_iota_ms": "1000"
                },
                "evidence": {
                    "max_age_num_blocks": "100000",
                    "max_age_duration": "172800000000000",
                    "max_bytes": "1048576"
                },
                "validator": {
                    "pub_key_types": ["ed25519"]
                },
                "version": {}
            },
            "validators": validator_entries,
            "app_hash": "",
            "app_state": {
                "accounts": account_entries,
                "staking": {
                    "delegations": delegations
                },
                "gov": {
                    "voting_period": "604800s",
                    "max_deposit_period": "172800s",
                    "min_deposit": "10000000"
                },
                "blob": {
                    "gov_max_square_size": DEFAULT_GOV_MAX_SQUARE_SIZE.to_string()
                }
            }
        }));

        for (index, modifier) in modifiers.iter().enumerate() {
            document = modifier(document).map_err(|source| GenesisError::Modifier { index, source })?;
        }

        Ok(document)
    }
}

fn voting_power(self_delegation: u64) -> u64 {
    (self_delegation / POWER_REDUCTION).max(1)
}

/// Set the blob module's governance max square size.
pub fn set_blob_params(gov_max_square_size: u64) -> Modifier {
    modifier(move |mut document| {
        document.set(
            &["app_state", "blob", "gov_max_square_size"],
            json!(gov_max_square_size.to_string()),
        )?;
        Ok(document)
    })
}

/// Set the maximum block size in bytes.
pub fn set_max_block_bytes(max_bytes: u64) -> Modifier {
    modifier(move |mut document| {
        document.set(
            &["consensus_params", "block", "max_bytes"],
            json!(max_bytes.to_string()),
        )?;
        Ok(document)
    })
}

/// Make governance proposals pass immediately so the network is operational from block one.
pub fn immediate_proposals() -> Modifier {
    modifier(|mut document| {
        document.set(&["app_state", "gov", "voting_period"], json!("1s"))?;
        document.set(&["app_state", "gov", "max_deposit_period"], json!("1s"))?;
        document.set(&["app_state", "gov", "min_deposit"], json!("0"))?;
        Ok(document)
    })
}
