use crate::account::AccountError;
use crate::backend::BackendError;
use crate::genesis::GenesisError;
use crate::keygen::KeyError;
use crate::node::NodeState;
use crate::poll::PollError;
use crate::rpc::RpcError;
use crate::testnet::Phase;

/// Errors raised by the orchestrator. Each variant names the resource and operation it failed on.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot {operation} while the testnet is {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },
    #[error("cannot {operation} node {name} while it is {state:?}")]
    InvalidNodeState {
        name: String,
        state: NodeState,
        operation: &'static str,
    },
    #[error("peer list of node {name} contains its own address {address}")]
    SelfPeer { name: String, address: String },
    #[error("no node at index {0}")]
    UnknownNode(usize),
    #[error("unknown trace table {0:?}")]
    UnknownTraceTable(String),
    #[error("failed to encode {what}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to {what}")]
    Io {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("node {name} did not produce a block")]
    Liveness {
        name: String,
        #[source]
        source: PollError<RpcError>,
    },
    #[error(transparent)]
    Genesis(#[from] GenesisError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}
