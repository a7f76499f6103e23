//! Read-only access to a node's status endpoint.

use tendermint::block::Height;
use tendermint_rpc::HttpClient;
use tendermint_rpc::client::Client;

/// Subset of a node's `/status` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStatus {
    pub latest_block_height: u64,
    pub earliest_block_height: u64,
    pub syncing: bool,
}

/// Subset of a committed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSummary {
    pub height: u64,
    pub tx_count: usize,
    /// Total size of the block's transactions.
    pub size_bytes: u64,
    /// Block header time, in nanoseconds since the Unix epoch.
    pub time_unix_nanos: i128,
    /// Round in which the previous block's commit was reached.
    pub last_commit_round: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error("invalid RPC address {address}")]
    InvalidAddress {
        address: String,
        #[source]
        source: tendermint_rpc::Error,
    },
    #[error("invalid height {height}")]
    InvalidHeight {
        height: u64,
        #[source]
        source: tendermint::Error,
    },
    #[error("{operation} request to {address} failed")]
    Request {
        address: String,
        operation: &'static str,
        #[source]
        source: tendermint_rpc::Error,
    },
    #[error("node at {address} is unavailable: {reason}")]
    Unavailable { address: String, reason: String },
}

/// Queries against one node.
pub trait NodeRpc: Send + Sync {
    fn address(&self) -> &str;

    fn status(&self) -> impl Future<Output = Result<NodeStatus, RpcError>> + Send;

    fn block(&self, height: u64) -> impl Future<Output = Result<BlockSummary, RpcError>> + Send;
}

/// Opens [`NodeRpc`] clients from `host:port` addresses.
pub trait RpcConnector: Send + Sync {
    type Client: NodeRpc;

    fn connect(&self, address: &str) -> Result<Self::Client, RpcError>;
}

/// Connects to CometBFT's JSON-RPC over HTTP.
#[derive(Debug, Clone, Copy, Default)]
pub struct CometRpcConnector;

impl RpcConnector for CometRpcConnector {
    type Client = CometRpc;

    fn connect(&self, address: &str) -> Result<CometRpc, RpcError> {
        let url = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let client = HttpClient::new(url.as_str()).map_err(|source| RpcError::InvalidAddress {
            address: address.to_string(),
            source,
        })?;
        Ok(CometRpc {
            address: address.to_string(),
            client,
        })
    }
}

pub struct CometRpc {
    address: String,
    client: HttpClient,
}

impl CometRpc {
    fn request_error(&self, operation: &'static str) -> impl FnOnce(tendermint_rpc::Error) -> RpcError {
        let address = self.address.clone();
        move |source| RpcError::Request {
            address,
            operation,
            source,
        }
    }
}

impl NodeRpc for CometRpc {
    fn address(&self) -> &str {
        &self.address
    }

    async fn status(&self) -> Result<NodeStatus, RpcError> {
        let status = self
            .client
            .status()
            .await
            .map_err(self.request_error("status"))?;
        Ok(NodeStatus {
            latest_block_height: status.sync_info.latest_block_height.value(),
            earliest_block_height: status.sync_info.earliest_block_height.value(),
            syncing: status.sync_info.catching_up,
        })
    }

    async fn block(&self, height: u64) -> Result<BlockSummary, RpcError> {
        let at = Height::try_from(height)
            .map_err(|source| RpcError::InvalidHeight { height, source })?;
        let response = self
            .client
            .block(at)
            .await
            .map_err(self.request_error("block"))?;
        let block = response.block;
        Ok(BlockSummary {
            height: block.header.height.value(),
            tx_count: block.data.len(),
            size_bytes: block.data.iter().map(|tx| tx.len() as u64).sum(),
            time_unix_nanos: block.header.time.unix_timestamp_nanos(),
            last_commit_round: block
                .last_commit
                .map(|commit| commit.round.value())
                .unwrap_or_default(),
        })
    }
}
