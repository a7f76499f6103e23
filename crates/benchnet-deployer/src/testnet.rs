//! The test network orchestrator.
//!
//! A [`Testnet`] owns every node and load client of one network and drives them through a fixed
//! lifecycle:
//!
//! ```text
//! New ──setup──▶ SetUp ──start──▶ Started ──cleanup──▶ Cleaned
//!  │                                                      ▲
//!  └──────────────────────cleanup─────────────────────────┘
//! ```
//!
//! Nodes, accounts and load clients are created while the network is [`Phase::New`]. Setup
//! freezes the genesis: it is built exactly once, from every height-zero node and every funded
//! account, and the same bytes are written into every node. Start runs the genesis nodes in
//! creation order and only returns once each one has produced a block. Cleanup is best-effort:
//! every resource gets a stop and a destroy attempt regardless of what failed before it.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tempfile::TempDir;
use tracing::{error, info, warn};

use crate::account::{GenesisAccount, Keyring};
use crate::backend::DeploymentBackend;
use crate::config::{NodeTuning, Resources, RuntimeOptions};
use crate::error::Error;
use crate::genesis::{GenesisBuilder, GenesisError, GenesisParticipant, Modifier};
use crate::keygen::{KeyGenerator, KeyRole};
use crate::node::{Node, NodeSpec, NodeState};
use crate::poll::{PollPolicy, poll_until};
use crate::rpc::{NodeRpc, RpcConnector, RpcError};
use crate::txclient::{DEFAULT_TX_CLIENT_TOKENS, TxClient, TxClientOptions};

pub const DEFAULT_NODE_IMAGE: &str = "ghcr.io/celestiaorg/celestia-app";
pub const DEFAULT_TX_CLIENT_IMAGE: &str = "ghcr.io/celestiaorg/txsim";

/// Settings fixed when the network is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestnetConfig {
    pub name: String,
    /// Sole source of the network's key material.
    pub seed: u64,
    pub chain_id: String,
    /// Captured once so that rebuilding the genesis yields the same bytes.
    pub genesis_time: DateTime<Utc>,
    pub node_image: String,
    pub tx_client_image: String,
    pub tuning: NodeTuning,
    /// Budget for a started node to report its first block.
    pub liveness: PollPolicy,
}

impl TestnetConfig {
    pub fn new(name: impl Into<String>, seed: u64) -> Self {
        let name = name.into();
        Self {
            chain_id: name.to_lowercase(),
            name,
            seed,
            genesis_time: Utc::now(),
            node_image: DEFAULT_NODE_IMAGE.to_string(),
            tx_client_image: DEFAULT_TX_CLIENT_IMAGE.to_string(),
            tuning: NodeTuning::default(),
            liveness: PollPolicy::LIVENESS,
        }
    }

    pub fn with_chain_id(mut self, chain_id: impl Into<String>) -> Self {
        self.chain_id = chain_id.into();
        self
    }

    pub fn with_genesis_time(mut self, genesis_time: DateTime<Utc>) -> Self {
        self.genesis_time = genesis_time;
        self
    }

    pub fn with_node_image(mut self, image: impl Into<String>) -> Self {
        self.node_image = image.into();
        self
    }

    pub fn with_tx_client_image(mut self, image: impl Into<String>) -> Self {
        self.tx_client_image = image.into();
        self
    }

    pub fn with_tuning(mut self, tuning: NodeTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_liveness(mut self, liveness: PollPolicy) -> Self {
        self.liveness = liveness;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    SetUp,
    Started,
    Cleaned,
}

/// One teardown step that failed during [`Testnet::cleanup`].
#[derive(Debug)]
pub struct TeardownFailure {
    pub resource: String,
    pub operation: &'static str,
    pub error: Error,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to {} {}: {}", self.operation, self.resource, self.error)
    }
}

/// Every failure observed while tearing the network down.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub failures: Vec<TeardownFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Testnet<B: DeploymentBackend, R> {
    config: TestnetConfig,
    backend: B,
    rpc: R,
    keygen: KeyGenerator,
    modifiers: Vec<Modifier>,
    nodes: Vec<Node<B::Handle>>,
    accounts: Vec<GenesisAccount>,
    tx_clients: Vec<TxClient<B::Handle>>,
    keyrings: TempDir,
    genesis: Option<Bytes>,
    phase: Phase,
}

impl<B: DeploymentBackend, R: RpcConnector> Testnet<B, R> {
    pub fn new(config: TestnetConfig, backend: B, rpc: R) -> Result<Self, Error> {
        let keyrings = tempfile::Builder::new()
            .prefix(&format!("{}-keyrings-", config.name))
            .tempdir()
            .map_err(|source| Error::Io {
                what: "create the keyring directory",
                source,
            })?;
        info!(testnet = %config.name, seed = config.seed, chain_id = %config.chain_id, "created testnet");
        Ok(Self {
            keygen: KeyGenerator::new(config.seed),
            config,
            backend,
            rpc,
            modifiers: Vec::new(),
            nodes: Vec::new(),
            accounts: Vec::new(),
            tx_clients: Vec::new(),
            keyrings,
            genesis: None,
            phase: Phase::New,
        })
    }

    pub fn config(&self) -> &TestnetConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn nodes(&self) -> &[Node<B::Handle>] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Result<&Node<B::Handle>, Error> {
        self.nodes.get(index).ok_or(Error::UnknownNode(index))
    }

    pub fn tx_clients(&self) -> &[TxClient<B::Handle>] {
        &self.tx_clients
    }

    pub fn accounts(&self) -> &[GenesisAccount] {
        &self.accounts
    }

    /// The genesis every node received, once set up.
    pub fn genesis(&self) -> Option<&Bytes> {
        self.genesis.as_ref()
    }

    fn expect_phase(&self, phase: Phase, operation: &'static str) -> Result<(), Error> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(Error::InvalidPhase {
                operation,
                phase: self.phase,
            })
        }
    }

    /// Append a genesis modifier. Modifiers run in the order they were added.
    pub fn add_genesis_modifier(&mut self, modifier: Modifier) -> Result<(), Error> {
        self.expect_phase(Phase::New, "add a genesis modifier")?;
        self.modifiers.push(modifier);
        Ok(())
    }

    /// Create a node present in the genesis. Returns its index.
    pub async fn create_genesis_node(
        &mut self,
        version: &str,
        self_delegation: u64,
        upgrade_height: Option<u64>,
        resources: Resources,
    ) -> Result<usize, Error> {
        self.expect_phase(Phase::New, "create a genesis node")?;
        self.push_node(version, 0, self_delegation, upgrade_height, resources)
            .await
    }

    pub async fn create_genesis_nodes(
        &mut self,
        count: usize,
        version: &str,
        self_delegation: u64,
        upgrade_height: Option<u64>,
        resources: Resources,
    ) -> Result<(), Error> {
        for _ in 0..count {
            self.create_genesis_node(version, self_delegation, upgrade_height, resources.clone())
                .await?;
        }
        Ok(())
    }

    /// Create a non-validator that joins the network at `start_height`.
    pub async fn create_node(
        &mut self,
        version: &str,
        start_height: u64,
        upgrade_height: Option<u64>,
        resources: Resources,
    ) -> Result<usize, Error> {
        self.expect_phase(Phase::New, "create a node")?;
        self.push_node(version, start_height, 0, upgrade_height, resources)
            .await
    }

    async fn push_node(
        &mut self,
        version: &str,
        start_height: u64,
        self_delegation: u64,
        upgrade_height: Option<u64>,
        resources: Resources,
    ) -> Result<usize, Error> {
        let index = self.nodes.len();
        let spec = NodeSpec {
            name: format!("val{index}"),
            image: self.config.node_image.clone(),
            version: version.to_string(),
            start_height,
            self_delegation,
            upgrade_height,
            resources,
            tuning: self.config.tuning.clone(),
        };
        let identity = self.keygen.identity();
        let node = Node::create(&self.backend, spec, identity).await?;
        info!(node = %node.name(), start_height, self_delegation, "added node");
        self.nodes.push(node);
        Ok(index)
    }

    /// Mint an account held only in memory and fund it in the genesis.
    pub fn create_account(&mut self, name: &str, tokens: u64) -> Result<Keyring, Error> {
        self.expect_phase(Phase::New, "create an account")?;
        let key = self.keygen.generate(KeyRole::FundedAccount);
        let keyring = Keyring::ephemeral(name, key);
        self.fund(&keyring, tokens);
        Ok(keyring)
    }

    /// Mint an account whose keyring is persisted so it can be handed to another process, and
    /// fund it in the genesis.
    pub fn create_and_add_account_to_genesis(
        &mut self,
        name: &str,
        tokens: u64,
    ) -> Result<Keyring, Error> {
        let keyring = self.persist_account(name)?;
        self.fund(&keyring, tokens);
        Ok(keyring)
    }

    fn persist_account(&mut self, name: &str) -> Result<Keyring, Error> {
        self.expect_phase(Phase::New, "create an account")?;
        let key = self.keygen.generate(KeyRole::FundedAccount);
        Ok(Keyring::persist(name, key, &self.keyrings.path().join(name))?)
    }

    fn fund(&mut self, keyring: &Keyring, tokens: u64) {
        info!(account = %keyring.name(), tokens, "funded account in genesis");
        self.accounts.push(GenesisAccount {
            name: keyring.name().to_string(),
            public_key: keyring.key().public_key_bytes(),
            initial_tokens: tokens,
        });
    }

    /// Create a load client with its own funded account, pointed at `grpc_endpoint`.
    ///
    /// The account is only funded once the client's instance exists.
    pub async fn create_tx_client(
        &mut self,
        name: &str,
        version: &str,
        grpc_endpoint: &str,
        options: &TxClientOptions,
    ) -> Result<(), Error> {
        let keyring = self.persist_account(name)?;
        let client = TxClient::create(
            &self.backend,
            &self.config.tx_client_image,
            version,
            grpc_endpoint,
            keyring,
            options,
        )
        .await?;
        self.fund(client.keyring(), DEFAULT_TX_CLIENT_TOKENS);
        self.tx_clients.push(client);
        Ok(())
    }

    /// Create one load client per endpoint.
    pub async fn create_tx_clients(
        &mut self,
        version: &str,
        grpc_endpoints: &[String],
        options: &TxClientOptions,
    ) -> Result<(), Error> {
        for endpoint in grpc_endpoints {
            let name = format!("txsim{}", self.tx_clients.len());
            self.create_tx_client(&name, version, endpoint, options).await?;
        }
        Ok(())
    }

    /// Build the genesis and initialize every node with it and the addresses of all other nodes.
    ///
    /// Stops at the first node that fails to initialize; nodes initialized before it are left as
    /// they are for [`cleanup`](Self::cleanup).
    pub async fn setup(&mut self, options: &RuntimeOptions) -> Result<(), Error> {
        self.expect_phase(Phase::New, "set up")?;

        let participants: Vec<GenesisParticipant> = self
            .nodes
            .iter()
            .filter(|node| node.is_genesis())
            .map(Node::genesis_participant)
            .collect();
        let genesis = GenesisBuilder::new(&self.config.chain_id, self.config.genesis_time)
            .build(&participants, &self.accounts, &self.modifiers)?;
        let genesis = genesis.to_bytes().map_err(GenesisError::Serialize)?;
        info!(
            testnet = %self.config.name,
            validators = participants.iter().filter(|p| p.is_validator()).count(),
            accounts = self.accounts.len(),
            "built genesis"
        );

        let addresses = self
            .nodes
            .iter()
            .map(|node| node.address_p2p(&self.backend))
            .collect::<Result<Vec<_>, _>>()?;
        for (index, node) in self.nodes.iter_mut().enumerate() {
            let peers: Vec<String> = addresses
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != index)
                .map(|(_, address)| address.clone())
                .collect();
            node.init(&self.backend, genesis.clone(), &peers, options)
                .await?;
        }

        self.genesis = Some(genesis);
        self.phase = Phase::SetUp;
        info!(testnet = %self.config.name, nodes = self.nodes.len(), "testnet set up");
        Ok(())
    }

    /// Start every genesis node in order, then wait for each to produce a block.
    ///
    /// Nodes already started when a later one fails are left running.
    pub async fn start(&mut self) -> Result<(), Error> {
        self.expect_phase(Phase::SetUp, "start")?;

        let mut started = Vec::new();
        for (index, node) in self.nodes.iter_mut().enumerate() {
            if node.is_genesis() {
                node.start(&self.backend).await?;
                started.push(index);
            }
        }
        self.phase = Phase::Started;

        for index in started {
            self.wait_for_liveness(index).await?;
        }
        info!(testnet = %self.config.name, "testnet started");
        Ok(())
    }

    /// Start a late-joining node and wait for it to report a block.
    pub async fn start_node(&mut self, index: usize) -> Result<(), Error> {
        self.expect_phase(Phase::Started, "start a node")?;
        let backend = &self.backend;
        self.nodes
            .get_mut(index)
            .ok_or(Error::UnknownNode(index))?
            .start(backend)
            .await?;
        self.wait_for_liveness(index).await
    }

    async fn wait_for_liveness(&self, index: usize) -> Result<(), Error> {
        let node = self.node(index)?;
        let address = node.remote_address_rpc(&self.backend).await?;
        let client = self.rpc.connect(&address)?;
        let client = &client;

        let height = poll_until(
            &self.config.liveness,
            &format!("node {} producing blocks", node.name()),
            move || async move {
                let status = client.status().await?;
                Ok::<_, RpcError>(
                    (status.latest_block_height > 0).then_some(status.latest_block_height),
                )
            },
        )
        .await
        .map_err(|source| Error::Liveness {
            name: node.name().to_string(),
            source,
        })?;

        info!(node = %node.name(), height, "node is live");
        Ok(())
    }

    /// Internal RPC addresses of every node.
    pub fn rpc_endpoints(&self) -> Result<Vec<String>, Error> {
        self.nodes
            .iter()
            .map(|node| node.address_rpc(&self.backend))
            .collect()
    }

    /// Internal gRPC addresses of every node.
    pub fn grpc_endpoints(&self) -> Result<Vec<String>, Error> {
        self.nodes
            .iter()
            .map(|node| node.address_grpc(&self.backend))
            .collect()
    }

    /// Externally reachable RPC addresses of every node, or the first resolution error.
    pub async fn remote_rpc_endpoints(&self) -> Result<Vec<String>, Error> {
        let mut endpoints = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            endpoints.push(node.remote_address_rpc(&self.backend).await?);
        }
        Ok(endpoints)
    }

    /// Externally reachable gRPC addresses of every node, or the first resolution error.
    pub async fn remote_grpc_endpoints(&self) -> Result<Vec<String>, Error> {
        let mut endpoints = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            endpoints.push(node.remote_address_grpc(&self.backend).await?);
        }
        Ok(endpoints)
    }

    /// RPC clients for every node, connected through their remote addresses.
    pub async fn rpc_clients(&self) -> Result<Vec<R::Client>, Error> {
        let mut clients = Vec::with_capacity(self.nodes.len());
        for endpoint in self.remote_rpc_endpoints().await? {
            clients.push(self.rpc.connect(&endpoint)?);
        }
        Ok(clients)
    }

    pub async fn start_tx_clients(&self) -> Result<(), Error> {
        self.expect_phase(Phase::Started, "start load clients")?;
        for client in &self.tx_clients {
            client.start(&self.backend).await?;
        }
        Ok(())
    }

    /// Stop every running load client, logging failures.
    pub async fn stop_tx_clients(&self) {
        for client in &self.tx_clients {
            if !client.is_running(&self.backend).await {
                continue;
            }
            if let Err(e) = client.stop(&self.backend).await {
                warn!(client = %client.name(), "failed to stop load client: {e}");
            }
        }
    }

    /// Stop and destroy every node and load client.
    ///
    /// Never stops early: each resource that is running gets a stop attempt, and every resource
    /// not yet destroyed gets a destroy attempt even when its stop failed. Failures are logged and
    /// collected. Resources whose destroy failed are retried by the next call; the network is
    /// [`Phase::Cleaned`] once every resource is destroyed.
    pub async fn cleanup(&mut self) -> CleanupReport {
        if self.phase == Phase::Cleaned {
            return CleanupReport::default();
        }
        info!(testnet = %self.config.name, "cleaning up testnet");

        let backend = &self.backend;
        let nodes = self
            .nodes
            .iter_mut()
            .filter(|node| node.state() != NodeState::Destroyed)
            .map(|node| async move {
                let mut failures = Vec::new();
                if node.is_running(backend).await {
                    if let Err(error) = node.stop(backend).await {
                        failures.push(failure(node.name(), "stop", error));
                    }
                }
                if let Err(error) = node.destroy(backend).await {
                    failures.push(failure(node.name(), "destroy", error));
                }
                failures
            });
        let clients = self
            .tx_clients
            .iter_mut()
            .filter(|client| !client.is_destroyed())
            .map(|client| async move {
                let mut failures = Vec::new();
                if client.is_running(backend).await {
                    if let Err(error) = client.stop(backend).await {
                        failures.push(failure(client.name(), "stop", error));
                    }
                }
                if let Err(error) = client.destroy(backend).await {
                    failures.push(failure(client.name(), "destroy", error));
                }
                failures
            });
        let (nodes, clients) = futures::join!(join_all(nodes), join_all(clients));

        let report = CleanupReport {
            failures: nodes.into_iter().chain(clients).flatten().collect(),
        };
        let leftover = self
            .nodes
            .iter()
            .filter(|node| node.state() != NodeState::Destroyed)
            .count()
            + self.tx_clients.iter().filter(|c| !c.is_destroyed()).count();
        if leftover == 0 {
            self.phase = Phase::Cleaned;
        }
        if report.is_clean() {
            info!(testnet = %self.config.name, "testnet cleaned up");
        } else {
            warn!(
                testnet = %self.config.name,
                failures = report.failures.len(),
                leftover,
                "testnet cleaned up with errors"
            );
        }
        report
    }
}

fn failure(resource: &str, operation: &'static str, error: Error) -> TeardownFailure {
    let failure = TeardownFailure {
        resource: resource.to_string(),
        operation,
        error,
    };
    error!("{failure}");
    failure
}
