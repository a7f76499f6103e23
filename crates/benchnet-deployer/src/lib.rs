//! benchnet-deployer: provision, start, drive and tear down ephemeral CometBFT test networks.
//!
//! This crate provides both a CLI and library interface. A [`Testnet`] owns every node and
//! load client of one network and deploys them through a [`DeploymentBackend`]: local
//! processes with [`LocalBackend`](backend::local::LocalBackend), or one provisioned machine
//! per instance with [`BareMetalBackend`](backend::bare_metal::BareMetalBackend).
//!
//! # Example
//!
//! ```rust,no_run
//! use benchnet_deployer::backend::local::LocalBackend;
//! use benchnet_deployer::{CometRpcConnector, Resources, RuntimeOptions, Testnet, TestnetConfig};
//!
//! # async fn example() -> Result<(), benchnet_deployer::Error> {
//! let config = TestnetConfig::new("throughput", 42);
//! let backend = LocalBackend::new("/tmp/benchnet");
//! let mut testnet = Testnet::new(config, backend, CometRpcConnector)?;
//!
//! testnet
//!     .create_genesis_nodes(2, "v1.0.0", 10_000_000, None, Resources::default())
//!     .await?;
//! testnet.setup(&RuntimeOptions::default()).await?;
//! testnet.start().await?;
//! // ... drive load ...
//! let report = testnet.cleanup().await;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod backend;
pub mod config;
pub mod error;
pub mod genesis;
pub mod keygen;
pub mod machine;
pub mod manifest;
pub mod node;
pub mod poll;
pub mod ports;
pub mod report;
pub mod rpc;
pub mod testnet;
pub mod txclient;

#[cfg(test)]
pub(crate) mod testing;

pub use account::{GenesisAccount, Keyring};
pub use backend::{DeploymentBackend, InstanceSpec, InstanceState, Protocol};
pub use config::{Mempool, NodeTuning, Resources, RuntimeOptions};
pub use error::Error;
pub use genesis::{GenesisBuilder, GenesisDocument, Modifier};
pub use keygen::{KeyGenerator, KeyPair, KeyRole, NodeIdentity};
pub use manifest::Manifest;
pub use node::{Node, NodeState};
pub use poll::PollPolicy;
pub use ports::{NodePorts, PortAllocationStrategy};
pub use rpc::{CometRpcConnector, NodeRpc, RpcConnector};
pub use testnet::{CleanupReport, Phase, Testnet, TestnetConfig};
pub use txclient::{TxClient, TxClientOptions};
