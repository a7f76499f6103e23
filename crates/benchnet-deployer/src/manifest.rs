//! Benchmark descriptions loaded from JSON.

use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{BandwidthError, Mempool, Resources, RuntimeOptions, parse_bandwidth};
use crate::genesis::{DEFAULT_GOV_MAX_SQUARE_SIZE, Modifier, set_blob_params, set_max_block_bytes};
use crate::txclient::TxClientOptions;

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifest {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid per_peer_bandwidth")]
    Bandwidth(#[from] BandwidthError),
    #[error("invalid range {value:?} for {field}, expected \"min-max\" or a single number")]
    Range { field: &'static str, value: String },
}

/// Where a manifest setting ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// Instance sizing and versions, applied when nodes and load clients are created.
    NodeResource,
    /// Baked into the genesis document.
    GenesisContent,
    /// Written into every node's `config.toml` during setup.
    RuntimeConfig,
}

/// A benchmark run. Every field has a default, so `{}` is a valid manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Manifest {
    /// Default: `"benchnet"`.
    pub chain_id: String,
    /// Seed of the network's key material. Default: 42.
    pub seed: u64,
    /// Number of genesis validators. Default: 2.
    pub validators: usize,
    /// Default: `"latest"`.
    pub node_version: String,
    /// Default: 10 000 000.
    pub self_delegation: u64,
    /// Height at which nodes switch app version. Default: none.
    pub upgrade_height: Option<u64>,
    /// Default: [`Resources::default`].
    pub validator_resources: Resources,

    /// Number of load clients, spread round-robin over the validators. Default: 1.
    pub tx_clients: usize,
    /// Default: `"latest"`.
    pub tx_client_version: String,
    /// Default: [`Resources::default`].
    pub tx_client_resources: Resources,
    /// Seed of the load clients' workload. Default: 42.
    pub tx_client_seed: u64,
    /// Concurrent blob sequences per load client. Default: 1.
    pub blob_sequences: u32,
    /// Blob size range in bytes. Default: `"200000-400000"`.
    pub blob_sizes: String,
    /// Blobs per transaction. Default: `"1"`.
    pub blobs_per_tx: String,

    /// Default: `"5MiB"`.
    pub per_peer_bandwidth: String,
    /// Default: `"1s"`.
    #[serde(with = "human_duration")]
    pub timeout_commit: Duration,
    /// Derived from `timeout_commit` when unset.
    #[serde(with = "human_duration::option")]
    pub timeout_propose: Option<Duration>,
    /// Default: `v0`.
    pub mempool: Mempool,
    /// Default: true.
    pub broadcast_txs: bool,
    /// Default: false.
    pub prometheus: bool,
    /// Default: false.
    pub tracing: bool,

    /// Default: [`DEFAULT_GOV_MAX_SQUARE_SIZE`].
    pub gov_max_square_size: u64,
    /// Overrides the genesis block size limit. Default: none.
    pub max_block_bytes: Option<u64>,

    /// How long load runs before results are collected. Default: `"1m"`.
    #[serde(with = "human_duration")]
    pub test_duration: Duration,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            chain_id: "benchnet".to_string(),
            seed: 42,
            validators: 2,
            node_version: "latest".to_string(),
            self_delegation: 10_000_000,
            upgrade_height: None,
            validator_resources: Resources::default(),
            tx_clients: 1,
            tx_client_version: "latest".to_string(),
            tx_client_resources: Resources::default(),
            tx_client_seed: 42,
            blob_sequences: 1,
            blob_sizes: "200000-400000".to_string(),
            blobs_per_tx: "1".to_string(),
            per_peer_bandwidth: "5MiB".to_string(),
            timeout_commit: Duration::from_secs(1),
            timeout_propose: None,
            mempool: Mempool::default(),
            broadcast_txs: true,
            prometheus: false,
            tracing: false,
            gov_max_square_size: DEFAULT_GOV_MAX_SQUARE_SIZE,
            max_block_bytes: None,
            test_duration: Duration::from_secs(60),
        }
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let contents = fs::read(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&contents).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The layer a manifest field belongs to, or `None` for fields that only steer the run.
    pub fn layer(field: &str) -> Option<Layer> {
        match field {
            "validators" | "node_version" | "upgrade_height" | "validator_resources"
            | "tx_clients" | "tx_client_version" | "tx_client_resources" | "tx_client_seed"
            | "blob_sequences" | "blob_sizes" | "blobs_per_tx" => Some(Layer::NodeResource),
            "chain_id" | "seed" | "self_delegation" | "gov_max_square_size"
            | "max_block_bytes" => Some(Layer::GenesisContent),
            "per_peer_bandwidth" | "timeout_commit" | "timeout_propose" | "mempool"
            | "broadcast_txs" | "prometheus" | "tracing" => Some(Layer::RuntimeConfig),
            _ => None,
        }
    }

    pub fn runtime_options(&self) -> Result<RuntimeOptions, ManifestError> {
        let mut options = RuntimeOptions::default()
            .with_per_peer_bandwidth(parse_bandwidth(&self.per_peer_bandwidth)?)
            .with_timeout_commit(self.timeout_commit)
            .with_mempool(self.mempool)
            .with_broadcast_txs(self.broadcast_txs)
            .with_prometheus(self.prometheus)
            .with_tracing(self.tracing);
        if let Some(timeout) = self.timeout_propose {
            options = options.with_timeout_propose(timeout);
        }
        Ok(options)
    }

    pub fn genesis_modifiers(&self) -> Vec<Modifier> {
        let mut modifiers = vec![set_blob_params(self.gov_max_square_size)];
        if let Some(max_bytes) = self.max_block_bytes {
            modifiers.push(set_max_block_bytes(max_bytes));
        }
        modifiers
    }

    pub fn tx_client_options(&self) -> Result<TxClientOptions, ManifestError> {
        Ok(TxClientOptions {
            seed: self.tx_client_seed,
            sequences: self.blob_sequences,
            blob_sizes: parse_range("blob_sizes", &self.blob_sizes)?,
            blobs_per_tx: parse_range("blobs_per_tx", &self.blobs_per_tx)?,
            resources: self.tx_client_resources.clone(),
            ..TxClientOptions::default()
        })
    }
}

/// Durations written as `"1s"`, `"500ms"` or `"5m"`.
mod human_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(D::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match duration {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|s| humantime::parse_duration(&s).map_err(D::Error::custom))
                .transpose()
        }
    }
}

/// Parse `"min-max"` or a single number into an inclusive range.
fn parse_range(field: &'static str, value: &str) -> Result<RangeInclusive<u64>, ManifestError> {
    let invalid = || ManifestError::Range {
        field,
        value: value.to_string(),
    };
    let (min, max) = match value.split_once('-') {
        Some((min, max)) => (min.trim(), max.trim()),
        None => (value.trim(), value.trim()),
    };
    let min: u64 = min.parse().map_err(|_| invalid())?;
    let max: u64 = max.parse().map_err(|_| invalid())?;
    if min > max {
        return Err(invalid());
    }
    Ok(min..=max)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_empty_manifest_uses_defaults() {
        let manifest: Manifest = serde_json::from_str("{}").unwrap();
        assert_eq!(manifest, Manifest::default());
    }

    #[test]
    fn test_load_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "validators": 4,
                "timeout_commit": "3s",
                "timeout_propose": "10s",
                "mempool": "v1",
                "per_peer_bandwidth": "10Mib",
                "blob_sizes": "10000-10000",
                "test_duration": "5m"
            }}"#
        )
        .unwrap();

        let manifest = Manifest::load(file.path()).unwrap();
        assert_eq!(manifest.validators, 4);
        assert_eq!(manifest.test_duration, Duration::from_secs(300));

        let options = manifest.runtime_options().unwrap();
        assert_eq!(options.timeout_commit, Duration::from_secs(3));
        assert_eq!(options.timeout_propose, Some(Duration::from_secs(10)));
        assert_eq!(options.mempool, Mempool::V1);
        assert_eq!(options.bandwidth(), 10 << 20);

        let tx = manifest.tx_client_options().unwrap();
        assert_eq!(tx.blob_sizes, 10_000..=10_000);
        assert_eq!(tx.blobs_per_tx, 1..=1);
    }

    #[test]
    fn test_rejects_unknown_fields_and_bad_values() {
        assert!(serde_json::from_str::<Manifest>(r#"{"validator": 3}"#).is_err());
        assert!(serde_json::from_str::<Manifest>(r#"{"timeout_commit": "soon"}"#).is_err());

        let manifest = Manifest {
            blob_sizes: "400-200".to_string(),
            ..Manifest::default()
        };
        assert!(matches!(
            manifest.tx_client_options(),
            Err(ManifestError::Range { field: "blob_sizes", .. })
        ));

        let manifest = Manifest {
            per_peer_bandwidth: "fast".to_string(),
            ..Manifest::default()
        };
        assert!(matches!(
            manifest.runtime_options(),
            Err(ManifestError::Bandwidth(_))
        ));
    }

    #[test]
    fn test_layers() {
        assert_eq!(Manifest::layer("validator_resources"), Some(Layer::NodeResource));
        assert_eq!(Manifest::layer("gov_max_square_size"), Some(Layer::GenesisContent));
        assert_eq!(Manifest::layer("mempool"), Some(Layer::RuntimeConfig));
        assert_eq!(Manifest::layer("test_duration"), None);
    }

    #[test]
    fn test_network_and_workload_seeds_are_independent() {
        assert_eq!(Manifest::layer("seed"), Some(Layer::GenesisContent));
        assert_eq!(Manifest::layer("tx_client_seed"), Some(Layer::NodeResource));

        let manifest: Manifest = serde_json::from_str(r#"{"seed": 7}"#).unwrap();
        assert_eq!(manifest.seed, 7);
        assert_eq!(manifest.tx_client_options().unwrap().seed, 42);

        let manifest: Manifest = serde_json::from_str(r#"{"tx_client_seed": 9}"#).unwrap();
        assert_eq!(manifest.seed, 42);
        assert_eq!(manifest.tx_client_options().unwrap().seed, 9);
    }

    #[test]
    fn test_genesis_modifiers() {
        assert_eq!(Manifest::default().genesis_modifiers().len(), 1);
        let manifest = Manifest {
            max_block_bytes: Some(8 << 20),
            ..Manifest::default()
        };
        assert_eq!(manifest.genesis_modifiers().len(), 2);
    }
}
