//! CLI command definitions for benchnet-deployer.

use std::future::Future;
use std::path::{Path, PathBuf};

use benchnet_deployer::backend::local::LocalBackend;
use benchnet_deployer::{CometRpcConnector, Manifest, Testnet, TestnetConfig};
use clap::{Args, Parser};
use color_eyre::eyre::{Context, Result};

mod create_network;
mod run_benchmark;

/// CLI options for benchnet-deployer.
#[derive(Parser)]
#[command(name = "benchnet-deployer")]
#[command(about = "Provision, start, drive and tear down ephemeral CometBFT test networks")]
pub enum Options {
    /// Create and initialize a network without starting it.
    CreateNetwork(create_network::CreateNetwork),
    /// Run a benchmark end to end and export block timings.
    RunBenchmark(run_benchmark::RunBenchmark),
}

/// Trait for running CLI commands.
pub trait Run {
    fn run(self) -> impl Future<Output = color_eyre::Result<()>> + Send;
}

impl Run for Options {
    async fn run(self) -> color_eyre::Result<()> {
        match self {
            Self::CreateNetwork(cmd) => cmd.run().await,
            Self::RunBenchmark(cmd) => cmd.run().await,
        }
    }
}

/// Options shared by every command that builds a network.
#[derive(Args)]
pub struct NetworkArgs {
    /// Benchmark manifest (JSON). Defaults apply to every field it omits.
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Name of the network; also the prefix of its chain ID.
    #[arg(long, default_value = "benchnet")]
    pub name: String,

    /// Path to the node binary.
    #[arg(long, default_value = "celestia-appd")]
    pub node_bin: String,

    /// Override the manifest's number of validators.
    #[arg(long)]
    pub validators: Option<usize>,
}

impl NetworkArgs {
    pub fn manifest(&self) -> Result<Manifest> {
        let mut manifest = match &self.manifest {
            Some(path) => Manifest::load(path)?,
            None => Manifest::default(),
        };
        if let Some(validators) = self.validators {
            manifest.validators = validators;
        }
        Ok(manifest)
    }

    /// Create the testnet and its genesis validators on a local backend rooted at `directory`.
    pub async fn create(
        &self,
        manifest: &Manifest,
        directory: &Path,
        tx_client_bin: Option<&str>,
    ) -> Result<Testnet<LocalBackend, CometRpcConnector>> {
        let mut config = TestnetConfig::new(&self.name, manifest.seed)
            .with_chain_id(&manifest.chain_id)
            .with_node_image(&self.node_bin);
        if let Some(bin) = tx_client_bin {
            config = config.with_tx_client_image(bin);
        }
        let mut testnet = Testnet::new(config, LocalBackend::new(directory), CometRpcConnector)?;
        for modifier in manifest.genesis_modifiers() {
            testnet.add_genesis_modifier(modifier)?;
        }
        testnet
            .create_genesis_nodes(
                manifest.validators,
                &manifest.node_version,
                manifest.self_delegation,
                manifest.upgrade_height,
                manifest.validator_resources.clone(),
            )
            .await
            .wrap_err("failed to create genesis nodes")?;
        Ok(testnet)
    }
}
