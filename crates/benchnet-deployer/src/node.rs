//! Nodes of a test network.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde_json::json;
use tracing::{debug, info};

use crate::backend::{DeploymentBackend, InstanceSpec, InstanceState, Protocol};
use crate::config::{NodeTuning, Resources, RuntimeOptions};
use crate::error::Error;
use crate::genesis::GenesisParticipant;
use crate::keygen::{KeyPair, NodeIdentity};

pub const CONFIG_TOML: &str = "config/config.toml";
pub const APP_TOML: &str = "config/app.toml";
pub const GENESIS_JSON: &str = "config/genesis.json";
pub const NODE_KEY_JSON: &str = "config/node_key.json";
pub const PRIV_VALIDATOR_KEY_JSON: &str = "config/priv_validator_key.json";
pub const ACCOUNT_KEY: &str = "config/account_key.pkcs8.hex";
pub const PRIV_VALIDATOR_STATE_JSON: &str = "data/priv_validator_state.json";

/// Trace tables recorded when tracing is enabled.
pub const TRACE_TABLES: [&str; 4] = [
    "consensus_round_state",
    "consensus_block_parts",
    "consensus_block",
    "mempool_tx",
];

/// Directory, relative to the node's home, the local tracer writes one `<table>.jsonl` into.
pub const TRACE_DIR: &str = "data/traces";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Instance allocated, nothing written yet.
    Created,
    /// Genesis and peers written.
    Initialized,
    Started,
    Stopped,
    Destroyed,
}

/// Everything needed to create a node, apart from its keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub image: String,
    pub version: String,
    /// Zero for nodes present in the genesis.
    pub start_height: u64,
    /// Non-zero for validators.
    pub self_delegation: u64,
    pub upgrade_height: Option<u64>,
    pub resources: Resources,
    pub tuning: NodeTuning,
}

/// One participant of the network, owning exactly one deployed instance.
pub struct Node<H> {
    spec: NodeSpec,
    identity: NodeIdentity,
    handle: H,
    state: NodeState,
}

impl<H: fmt::Debug> fmt::Debug for Node<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.spec.name)
            .field("version", &self.spec.version)
            .field("start_height", &self.spec.start_height)
            .field("self_delegation", &self.spec.self_delegation)
            .field("node_id", &self.identity.node_id())
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish()
    }
}

impl<H> Node<H>
where
    H: Clone + fmt::Debug + Send + Sync,
{
    /// Allocate the node's instance on `backend`.
    pub async fn create<B>(backend: &B, spec: NodeSpec, identity: NodeIdentity) -> Result<Self, Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        let mut args = vec!["start".to_string(), "--home".to_string(), ".".to_string()];
        if let Some(height) = spec.upgrade_height {
            args.extend(["--upgrade-height".to_string(), height.to_string()]);
        }
        let instance = InstanceSpec::new(&spec.name, &spec.image, &spec.version, spec.resources.clone())
            .with_args(args)
            .with_env(spec.tuning.env());

        let handle = backend.create(instance).await?;
        debug!(node = %spec.name, node_id = %identity.node_id(), "created node");
        Ok(Self {
            spec,
            identity,
            handle,
            state: NodeState::Created,
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn version(&self) -> &str {
        &self.spec.version
    }

    pub fn start_height(&self) -> u64 {
        self.spec.start_height
    }

    pub fn self_delegation(&self) -> u64 {
        self.spec.self_delegation
    }

    pub fn upgrade_height(&self) -> Option<u64> {
        self.spec.upgrade_height
    }

    pub fn resources(&self) -> &Resources {
        &self.spec.resources
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Present in the genesis.
    pub fn is_genesis(&self) -> bool {
        self.spec.start_height == 0
    }

    pub fn is_validator(&self) -> bool {
        self.spec.self_delegation > 0
    }

    pub fn genesis_participant(&self) -> GenesisParticipant {
        GenesisParticipant {
            name: self.spec.name.clone(),
            start_height: self.spec.start_height,
            self_delegation: self.spec.self_delegation,
            consensus_key: self.identity.signing.public_key_bytes(),
            account_key: self.identity.account.public_key_bytes(),
        }
    }

    /// `node_id@host:port` as seen by other nodes of the network.
    pub fn address_p2p<B>(&self, backend: &B) -> Result<String, Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        let address = backend.internal_address(&self.handle, Protocol::P2p)?;
        Ok(format!("{}@{address}", self.identity.node_id()))
    }

    pub fn address_rpc<B>(&self, backend: &B) -> Result<String, Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        Ok(backend.internal_address(&self.handle, Protocol::Rpc)?)
    }

    pub fn address_grpc<B>(&self, backend: &B) -> Result<String, Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        Ok(backend.internal_address(&self.handle, Protocol::Grpc)?)
    }

    /// RPC address reachable from outside the network the node runs in.
    pub async fn remote_address_rpc<B>(&self, backend: &B) -> Result<String, Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        Ok(backend.resolve_address(&self.handle, Protocol::Rpc).await?)
    }

    pub async fn remote_address_grpc<B>(&self, backend: &B) -> Result<String, Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        Ok(backend.resolve_address(&self.handle, Protocol::Grpc).await?)
    }

    /// Write the node's configuration, keys and the shared genesis into its instance.
    ///
    /// `peers` must not contain the node's own address.
    pub async fn init<B>(
        &mut self,
        backend: &B,
        genesis: Bytes,
        peers: &[String],
        options: &RuntimeOptions,
    ) -> Result<(), Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        self.expect_state(&[NodeState::Created], "initialize")?;

        let own = self.address_p2p(backend)?;
        if peers.contains(&own) {
            return Err(Error::SelfPeer {
                name: self.spec.name.clone(),
                address: own,
            });
        }

        let ports = ListenPorts {
            p2p: self.port(backend, Protocol::P2p)?,
            rpc: self.port(backend, Protocol::Rpc)?,
            grpc: self.port(backend, Protocol::Grpc)?,
            prometheus: self.port(backend, Protocol::Prometheus)?,
        };
        let files = [
            (CONFIG_TOML, Bytes::from(render_config_toml(&self.spec.name, &ports, &peers.join(","), options))),
            (APP_TOML, Bytes::from(render_app_toml(&ports))),
            (GENESIS_JSON, genesis),
            (NODE_KEY_JSON, encode("node key", node_key_json(&self.identity.network))?),
            (
                PRIV_VALIDATOR_KEY_JSON,
                encode("validator key", priv_validator_key_json(&self.identity.signing))?,
            ),
            (ACCOUNT_KEY, Bytes::from(self.identity.account.to_pkcs8_hex()?)),
            (
                PRIV_VALIDATOR_STATE_JSON,
                encode(
                    "validator state",
                    serde_json::to_string_pretty(&json!({ "height": "0", "round": 0, "step": 0 })),
                )?,
            ),
        ];
        for (path, contents) in files {
            backend.write_file(&self.handle, path, contents).await?;
        }

        self.state = NodeState::Initialized;
        debug!(node = %self.spec.name, peers = peers.len(), "initialized node");
        Ok(())
    }

    /// Run the node. Does not wait for it to make progress.
    pub async fn start<B>(&mut self, backend: &B) -> Result<(), Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        self.expect_state(&[NodeState::Initialized, NodeState::Stopped], "start")?;
        backend.start(&self.handle).await?;
        self.state = NodeState::Started;
        info!(node = %self.spec.name, version = %self.spec.version, "started node");
        Ok(())
    }

    pub async fn stop<B>(&mut self, backend: &B) -> Result<(), Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        self.expect_state(&[NodeState::Started], "stop")?;
        backend.stop(&self.handle).await?;
        self.state = NodeState::Stopped;
        info!(node = %self.spec.name, "stopped node");
        Ok(())
    }

    /// Release the node's instance. Destroying twice is a no-op.
    pub async fn destroy<B>(&mut self, backend: &B) -> Result<(), Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        if self.state == NodeState::Destroyed {
            return Ok(());
        }
        backend.destroy(&self.handle).await?;
        self.state = NodeState::Destroyed;
        Ok(())
    }

    /// Read the events the node recorded for one of the [`TRACE_TABLES`].
    ///
    /// Only nodes set up with tracing enabled record anything.
    pub async fn pull_traces<B>(&self, backend: &B, table: &str) -> Result<Bytes, Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        if !TRACE_TABLES.contains(&table) {
            return Err(Error::UnknownTraceTable(table.to_string()));
        }
        let traces = backend
            .read_file(&self.handle, &format!("{TRACE_DIR}/{table}.jsonl"))
            .await?;
        debug!(node = %self.spec.name, table, bytes = traces.len(), "pulled traces");
        Ok(traces)
    }

    /// Whether the backend currently observes the node running.
    pub async fn is_running<B>(&self, backend: &B) -> bool
    where
        B: DeploymentBackend<Handle = H>,
    {
        backend.is_in_state(&self.handle, InstanceState::Started).await
    }

    fn expect_state(&self, allowed: &[NodeState], operation: &'static str) -> Result<(), Error> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidNodeState {
                name: self.spec.name.clone(),
                state: self.state,
                operation,
            })
        }
    }

    fn port<B>(&self, backend: &B, protocol: Protocol) -> Result<u16, Error>
    where
        B: DeploymentBackend<Handle = H>,
    {
        let address = backend.internal_address(&self.handle, protocol)?;
        Ok(address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or_else(|| protocol.default_port()))
    }
}

fn encode(what: &'static str, json: Result<String, serde_json::Error>) -> Result<Bytes, Error> {
    json.map(Bytes::from)
        .map_err(|source| Error::Encode { what, source })
}

struct ListenPorts {
    p2p: u16,
    rpc: u16,
    grpc: u16,
    prometheus: u16,
}

/// CometBFT encodes ed25519 private keys as the seed followed by the public key.
fn ed25519_private_value(key: &KeyPair) -> String {
    let mut full_key = key.secret_key_bytes();
    full_key.extend_from_slice(&key.public_key_bytes());
    BASE64.encode(full_key)
}

fn node_key_json(key: &KeyPair) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&json!({
        "priv_key": {
            "type": "tendermint/PrivKeyEd25519",
            "value": ed25519_private_value(key)
        }
    }))
}

fn priv_validator_key_json(key: &KeyPair) -> Result<String, serde_json::Error> {
    let public_key = key.public_key_bytes();
    serde_json::to_string_pretty(&json!({
        "address": crate::keygen::validator_address(&public_key),
        "pub_key": {
            "type": "tendermint/PubKeyEd25519",
            "value": BASE64.encode(&public_key)
        },
        "priv_key": {
            "type": "tendermint/PrivKeyEd25519",
            "value": ed25519_private_value(key)
        }
    }))
}

fn render_app_toml(ports: &ListenPorts) -> String {
    format!(
        r#"minimum-gas-prices = "0.002utia"

[grpc]
enable = true
address = "0.0.0.0:{grpc}"

[api]
enable = false
"#,
        grpc = ports.grpc,
    )
}

fn render_config_toml(
    moniker: &str,
    ports: &ListenPorts,
    persistent_peers: &str,
    options: &RuntimeOptions,
) -> String {
    let timeouts = options.consensus_timeouts();
    let bandwidth = options.bandwidth();
    let (trace_type, tracing_tables) = if options.tracing {
        ("local", TRACE_TABLES.join(","))
    } else {
        ("noop", String::new())
    };

    format!(
        r#"# This is a TOML config file.
# For more information, see https://github.com/toml-lang/toml

moniker = "{moniker}"
db_backend = "goleveldb"
db_dir = "data"
log_level = "info"
log_format = "plain"
genesis_file = "config/genesis.json"
priv_validator_key_file = "config/priv_validator_key.json"
priv_validator_state_file = "data/priv_validator_state.json"
priv_validator_laddr = ""
node_key_file = "config/node_key.json"
filter_peers = false

[rpc]
laddr = "tcp://0.0.0.0:{rpc_port}"
cors_allowed_origins = []
cors_allowed_methods = ["HEAD", "GET", "POST"]
cors_allowed_headers = ["Origin", "Accept", "Content-Type", "X-Requested-With", "X-Server-Time"]
unsafe = false
max_open_connections = 900
max_subscription_clients = 100
max_subscriptions_per_client = 5
timeout_broadcast_tx_commit = "{timeout_broadcast_tx_commit}"
max_body_bytes = 1000000
max_header_bytes = 1048576
tls_cert_file = ""
tls_key_file = ""
pprof_laddr = ""

[p2p]
laddr = "tcp://0.0.0.0:{p2p_port}"
external_address = ""
seeds = ""
persistent_peers = "{persistent_peers}"
upnp = false
addr_book_file = "config/addrbook.json"
addr_book_strict = false
max_num_inbound_peers = 40
max_num_outbound_peers = 10
unconditional_peer_ids = ""
persistent_peers_max_dial_period = "0s"
flush_throttle_timeout = "100ms"
max_packet_msg_payload_size = 1024
send_rate = {bandwidth}
recv_rate = {bandwidth}
pex = true
seed_mode = false
private_peer_ids = ""
allow_duplicate_ip = true
handshake_timeout = "20s"
dial_timeout = "3s"

[mempool]
version = "{mempool}"
recheck = true
broadcast = {broadcast}
wal_dir = ""
size = 5000
max_txs_bytes = 1073741824
cache_size = 10000
keep-invalid-txs-in-cache = false
max_tx_bytes = 1048576
max_batch_bytes = 0

[statesync]
enable = false

[consensus]
wal_file = "data/cs.wal/wal"
timeout_propose = "{timeout_propose}"
timeout_propose_delta = "{timeout_propose_delta}"
timeout_prevote = "{timeout_prevote}"
timeout_prevote_delta = "{timeout_prevote_delta}"
timeout_precommit = "{timeout_precommit}"
timeout_precommit_delta = "{timeout_precommit_delta}"
timeout_commit = "{timeout_commit}"
double_sign_check_height = 0
skip_timeout_commit = false
create_empty_blocks = true
create_empty_blocks_interval = "0s"
peer_gossip_sleep_duration = "100ms"
peer_query_maj23_sleep_duration = "2s"

[storage]
discard_abci_responses = false

[tx_index]
indexer = "kv"

[instrumentation]
prometheus = {prometheus}
prometheus_listen_addr = ":{prometheus_port}"
max_open_connections = 3
namespace = "cometbft"
trace_type = "{trace_type}"
tracing_tables = "{tracing_tables}"
"#,
        rpc_port = ports.rpc,
        p2p_port = ports.p2p,
        mempool = options.mempool,
        broadcast = options.broadcast_txs,
        prometheus = options.prometheus,
        prometheus_port = ports.prometheus,
        timeout_propose = timeouts.timeout_propose,
        timeout_propose_delta = timeouts.timeout_propose_delta,
        timeout_prevote = timeouts.timeout_prevote,
        timeout_prevote_delta = timeouts.timeout_prevote_delta,
        timeout_precommit = timeouts.timeout_precommit,
        timeout_precommit_delta = timeouts.timeout_precommit_delta,
        timeout_commit = timeouts.timeout_commit,
        timeout_broadcast_tx_commit = timeouts.timeout_broadcast_tx_commit,
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Mempool;
    use crate::keygen::KeyGenerator;
    use crate::testing::{Journal, MockBackend};

    fn spec(name: &str, self_delegation: u64) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            image: "celestia-appd".to_string(),
            version: "v1.0.0".to_string(),
            start_height: 0,
            self_delegation,
            upgrade_height: Some(20),
            resources: Resources::default(),
            tuning: NodeTuning::default(),
        }
    }

    async fn node(backend: &MockBackend, name: &str) -> Node<usize> {
        let mut keygen = KeyGenerator::new(7);
        Node::create(backend, spec(name, 10_000_000), keygen.identity())
            .await
            .unwrap()
    }

    fn text(backend: &MockBackend, name: &str, path: &str) -> String {
        String::from_utf8(backend.file(name, path).unwrap().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_create_passes_upgrade_height_and_tuning() {
        let backend = MockBackend::new(Journal::default());
        let node = node(&backend, "val0").await;

        let instance = backend.instance(node.handle());
        assert_eq!(
            instance.spec.args,
            ["start", "--home", ".", "--upgrade-height", "20"]
        );
        assert_eq!(instance.spec.env["CONSENSUS_USE_WAL"], "true");
        assert_eq!(node.state(), NodeState::Created);
        assert!(node.is_genesis());
        assert!(node.is_validator());
    }

    #[tokio::test]
    async fn test_init_writes_files() {
        let backend = MockBackend::new(Journal::default());
        let mut node = node(&backend, "val0").await;
        let genesis = Bytes::from_static(b"{\"chain_id\":\"test\"}");
        let options = RuntimeOptions::default()
            .with_per_peer_bandwidth(1_000)
            .with_timeout_commit(Duration::from_secs(2))
            .with_mempool(Mempool::V1)
            .with_tracing(true)
            .with_broadcast_txs(false);

        node.init(&backend, genesis.clone(), &["abc@val1:26656".to_string()], &options)
            .await
            .unwrap();

        assert_eq!(node.state(), NodeState::Initialized);
        assert_eq!(backend.file("val0", GENESIS_JSON).unwrap(), genesis);

        let config = text(&backend, "val0", CONFIG_TOML);
        assert!(config.contains("moniker = \"val0\""));
        assert!(config.contains("persistent_peers = \"abc@val1:26656\""));
        assert!(config.contains("send_rate = 1000"));
        assert!(config.contains("version = \"v1\""));
        assert!(config.contains("broadcast = false"));
        assert!(config.contains("timeout_commit = \"2s\""));
        assert!(config.contains("trace_type = \"local\""));

        let key: serde_json::Value =
            serde_json::from_str(&text(&backend, "val0", PRIV_VALIDATOR_KEY_JSON)).unwrap();
        assert_eq!(key["address"], node.identity().validator_address());
        let account = text(&backend, "val0", ACCOUNT_KEY);
        assert_eq!(account, node.identity().account.to_pkcs8_hex().unwrap());
        assert!(backend.file("val0", PRIV_VALIDATOR_STATE_JSON).is_some());
    }

    #[tokio::test]
    async fn test_init_rejects_own_address() {
        let backend = MockBackend::new(Journal::default());
        let mut node = node(&backend, "val0").await;
        let own = node.address_p2p(&backend).unwrap();
        assert_eq!(own, format!("{}@val0:26656", node.identity().node_id()));

        let err = node
            .init(&backend, Bytes::new(), &[own], &RuntimeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SelfPeer { .. }));
        assert_eq!(node.state(), NodeState::Created);
    }

    #[tokio::test]
    async fn test_lifecycle_order() {
        let backend = MockBackend::new(Journal::default());
        let mut node = node(&backend, "val0").await;

        assert!(matches!(
            node.start(&backend).await,
            Err(Error::InvalidNodeState { state: NodeState::Created, .. })
        ));
        assert!(node.remote_address_rpc(&backend).await.is_err());

        node.init(&backend, Bytes::new(), &[], &RuntimeOptions::default())
            .await
            .unwrap();
        node.start(&backend).await.unwrap();
        assert!(node.is_running(&backend).await);
        assert_eq!(
            node.remote_address_grpc(&backend).await.unwrap(),
            "203.0.113.1:9090"
        );

        node.stop(&backend).await.unwrap();
        assert!(!node.is_running(&backend).await);
        node.destroy(&backend).await.unwrap();
        node.destroy(&backend).await.unwrap();
        assert_eq!(node.state(), NodeState::Destroyed);
    }

    #[tokio::test]
    async fn test_pull_traces_reads_table_file() {
        let backend = MockBackend::new(Journal::default());
        let node = node(&backend, "val0").await;
        let events = "{\"height\":1,\"round\":0}\n";
        backend.put_file("val0", "data/traces/consensus_round_state.jsonl", events);

        let traces = node
            .pull_traces(&backend, "consensus_round_state")
            .await
            .unwrap();
        assert_eq!(traces, events.as_bytes());

        assert!(matches!(
            node.pull_traces(&backend, "mempool_tx").await,
            Err(Error::Backend(_))
        ));
        assert!(matches!(
            node.pull_traces(&backend, "../config/node_key").await,
            Err(Error::UnknownTraceTable(_))
        ));
    }
}
