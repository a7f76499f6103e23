//! Node resource footprints and the runtime options applied at setup.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default CometBFT `send_rate`/`recv_rate` in bytes per second.
pub const DEFAULT_PER_PEER_BANDWIDTH: u64 = 5_120_000;

/// Resource requests and limits of one deployed instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub memory_request: String,
    pub memory_limit: String,
    pub cpu: String,
    pub volume: String,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            memory_request: "200Mi".to_string(),
            memory_limit: "200Mi".to_string(),
            cpu: "300m".to_string(),
            volume: "1Gi".to_string(),
        }
    }
}

impl Resources {
    /// Footprint for validators in throughput benchmarks.
    pub fn max_validator() -> Self {
        Self {
            memory_request: "10Gi".to_string(),
            memory_limit: "12Gi".to_string(),
            cpu: "6".to_string(),
            volume: "1Gi".to_string(),
        }
    }

    /// Footprint for load clients in throughput benchmarks.
    pub fn max_tx_client() -> Self {
        Self {
            memory_request: "1Gi".to_string(),
            memory_limit: "1Gi".to_string(),
            cpu: "2".to_string(),
            volume: "1Gi".to_string(),
        }
    }
}

/// Mempool implementation run by the nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mempool {
    /// FIFO mempool.
    #[default]
    V0,
    /// Priority mempool.
    V1,
    /// Content addressable mempool.
    V2,
}

impl fmt::Display for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V0 => f.write_str("v0"),
            Self::V1 => f.write_str("v1"),
            Self::V2 => f.write_str("v2"),
        }
    }
}

/// Runtime configuration applied uniformly to every node's `config.toml` during setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Per-peer send and receive rate in bytes per second.
    pub per_peer_bandwidth: Option<u64>,
    /// Overrides the propose timeout derived from `timeout_commit`.
    pub timeout_propose: Option<Duration>,
    /// Block interval.
    pub timeout_commit: Duration,
    /// Expose Prometheus metrics.
    pub prometheus: bool,
    /// Record local consensus traces.
    pub tracing: bool,
    pub mempool: Mempool,
    /// Gossip transactions between mempools.
    pub broadcast_txs: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            per_peer_bandwidth: None,
            timeout_propose: None,
            timeout_commit: Duration::from_secs(1),
            prometheus: false,
            tracing: false,
            mempool: Mempool::default(),
            broadcast_txs: true,
        }
    }
}

impl RuntimeOptions {
    pub fn with_per_peer_bandwidth(mut self, bytes_per_second: u64) -> Self {
        self.per_peer_bandwidth = Some(bytes_per_second);
        self
    }

    pub fn with_timeout_propose(mut self, timeout: Duration) -> Self {
        self.timeout_propose = Some(timeout);
        self
    }

    pub fn with_timeout_commit(mut self, timeout: Duration) -> Self {
        self.timeout_commit = timeout;
        self
    }

    pub fn with_prometheus(mut self, enabled: bool) -> Self {
        self.prometheus = enabled;
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.tracing = enabled;
        self
    }

    pub fn with_mempool(mut self, mempool: Mempool) -> Self {
        self.mempool = mempool;
        self
    }

    pub fn with_broadcast_txs(mut self, enabled: bool) -> Self {
        self.broadcast_txs = enabled;
        self
    }

    pub fn bandwidth(&self) -> u64 {
        self.per_peer_bandwidth.unwrap_or(DEFAULT_PER_PEER_BANDWIDTH)
    }

    /// Consensus timeouts derived from `timeout_commit`, with the propose override applied.
    pub fn consensus_timeouts(&self) -> ConsensusTimeouts {
        let mut timeouts = ConsensusTimeouts::from_timeout_commit(self.timeout_commit);
        if let Some(propose) = self.timeout_propose {
            timeouts.timeout_propose = fmt_ms(propose.as_millis() as u64);
        }
        timeouts
    }
}

/// Tuning of the node runtime's internals, handed to each node at construction.
///
/// These knobs are passed to the node process through its environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTuning {
    pub use_wal: bool,
    pub push_metrics: bool,
    pub data_channel_priority: u32,
    pub data_channel_capacity: u32,
}

impl Default for NodeTuning {
    fn default() -> Self {
        Self {
            use_wal: true,
            push_metrics: false,
            data_channel_priority: 10,
            data_channel_capacity: 100,
        }
    }
}

impl NodeTuning {
    pub fn env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("CONSENSUS_USE_WAL".to_string(), self.use_wal.to_string()),
            ("NODE_PUSH_METRICS".to_string(), self.push_metrics.to_string()),
            (
                "CONSENSUS_DATA_CHANNEL_PRIORITY".to_string(),
                self.data_channel_priority.to_string(),
            ),
            (
                "CONSENSUS_DATA_CHANNEL_CAPACITY".to_string(),
                self.data_channel_capacity.to_string(),
            ),
        ])
    }
}

/// Derived CometBFT consensus timeouts, scaled from `timeout_commit`.
///
/// CometBFT's default timeouts assume ~1s block times. The formulas here reproduce the CometBFT
/// defaults at 1s and scale smoothly for longer block times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusTimeouts {
    /// Formula: max(3s, block_time * 60%).
    pub timeout_propose: String,
    /// Formula: max(500ms, block_time * 10%).
    pub timeout_propose_delta: String,
    /// Formula: max(1s, block_time * 10%).
    pub timeout_prevote: String,
    /// Formula: max(500ms, block_time * 4%).
    pub timeout_prevote_delta: String,
    pub timeout_precommit: String,
    pub timeout_precommit_delta: String,
    pub timeout_commit: String,
    /// Formula: clamp(block_time * 10, 30s, 180s).
    pub timeout_broadcast_tx_commit: String,
}

impl ConsensusTimeouts {
    pub fn from_timeout_commit(timeout_commit: Duration) -> Self {
        let block_ms = timeout_commit.as_millis() as u64;
        let block_secs = block_ms / 1000;

        Self {
            timeout_propose: fmt_ms((block_ms * 3 / 5).max(3000)),
            timeout_propose_delta: fmt_ms((block_ms / 10).max(500)),
            timeout_prevote: fmt_ms((block_ms / 10).max(1000)),
            timeout_prevote_delta: fmt_ms((block_ms / 25).max(500)),
            timeout_precommit: fmt_ms((block_ms / 10).max(1000)),
            timeout_precommit_delta: fmt_ms((block_ms / 25).max(500)),
            timeout_commit: fmt_ms(block_ms),
            timeout_broadcast_tx_commit: format!("{}s", (block_secs * 10).clamp(30, 180)),
        }
    }
}

/// Format a millisecond duration as "Xs" if whole seconds, otherwise "Xms".
fn fmt_ms(ms: u64) -> String {
    if ms >= 1000 && ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum BandwidthError {
    #[error("unknown unit in bandwidth {0:?}")]
    UnknownUnit(String),
    #[error("invalid bandwidth value {0:?}")]
    InvalidNumber(String),
}

const BANDWIDTH_UNITS: &[(&str, u64)] = &[
    ("Kib", 1 << 10),
    ("KiB", 1 << 10),
    ("Mib", 1 << 20),
    ("MiB", 1 << 20),
    ("Gib", 1 << 30),
    ("GiB", 1 << 30),
    ("Tib", 1 << 40),
    ("TiB", 1 << 40),
    ("Kb", 1_000),
    ("KB", 1_000),
    ("Mb", 1_000_000),
    ("MB", 1_000_000),
    ("Gb", 1_000_000_000),
    ("GB", 1_000_000_000),
    ("Tb", 1_000_000_000_000),
    ("TB", 1_000_000_000_000),
];

/// Parse bandwidth strings such as "5Mib", "100KB" or "1.5Gb" into bytes per second.
///
/// Binary units (`Kib`, `KiB`, ...) are powers of 1024, decimal units (`Kb`, `KB`, ...) powers
/// of 1000.
pub fn parse_bandwidth(s: &str) -> Result<u64, BandwidthError> {
    let s = s.trim();
    let (number, multiplier) = BANDWIDTH_UNITS
        .iter()
        .find_map(|(unit, multiplier)| s.strip_suffix(unit).map(|n| (n, *multiplier)))
        .ok_or_else(|| BandwidthError::UnknownUnit(s.to_string()))?;

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| BandwidthError::InvalidNumber(s.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(BandwidthError::InvalidNumber(s.to_string()));
    }

    Ok((value * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_at_one_second_blocks() {
        let timeouts = ConsensusTimeouts::from_timeout_commit(Duration::from_secs(1));
        assert_eq!(timeouts.timeout_propose, "3s");
        assert_eq!(timeouts.timeout_propose_delta, "500ms");
        assert_eq!(timeouts.timeout_prevote, "1s");
        assert_eq!(timeouts.timeout_prevote_delta, "500ms");
        assert_eq!(timeouts.timeout_commit, "1s");
        assert_eq!(timeouts.timeout_broadcast_tx_commit, "30s");
    }

    #[test]
    fn test_timeouts_scale_with_slow_blocks() {
        let timeouts = ConsensusTimeouts::from_timeout_commit(Duration::from_secs(50));
        assert_eq!(timeouts.timeout_propose, "30s");
        assert_eq!(timeouts.timeout_propose_delta, "5s");
        assert_eq!(timeouts.timeout_prevote, "5s");
        assert_eq!(timeouts.timeout_prevote_delta, "2s");
        assert_eq!(timeouts.timeout_broadcast_tx_commit, "180s");
    }

    #[test]
    fn test_sub_second_commit() {
        let timeouts = ConsensusTimeouts::from_timeout_commit(Duration::from_millis(500));
        assert_eq!(timeouts.timeout_commit, "500ms");
        assert_eq!(timeouts.timeout_propose, "3s");
    }

    #[test]
    fn test_propose_override() {
        let options = RuntimeOptions::default()
            .with_timeout_commit(Duration::from_secs(5))
            .with_timeout_propose(Duration::from_millis(4500));
        let timeouts = options.consensus_timeouts();
        assert_eq!(timeouts.timeout_propose, "4500ms");
        assert_eq!(timeouts.timeout_commit, "5s");
    }

    #[test]
    fn test_parse_bandwidth() {
        assert_eq!(parse_bandwidth("5Mib"), Ok(5 * 1024 * 1024));
        assert_eq!(parse_bandwidth("5MiB"), Ok(5 * 1024 * 1024));
        assert_eq!(parse_bandwidth("100KB"), Ok(100_000));
        assert_eq!(parse_bandwidth(" 1.5Gb "), Ok(1_500_000_000));
        assert_eq!(parse_bandwidth("2Kib"), Ok(2048));
    }

    #[test]
    fn test_parse_bandwidth_rejects_garbage() {
        assert!(matches!(
            parse_bandwidth("100"),
            Err(BandwidthError::UnknownUnit(_))
        ));
        assert!(matches!(
            parse_bandwidth("fastMb"),
            Err(BandwidthError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_bandwidth("-1Mb"),
            Err(BandwidthError::InvalidNumber(_))
        ));
    }

    #[test]
    fn test_tuning_env() {
        let env = NodeTuning::default().env();
        assert_eq!(env["CONSENSUS_USE_WAL"], "true");
        assert_eq!(env["CONSENSUS_DATA_CHANNEL_CAPACITY"], "100");
    }
}
