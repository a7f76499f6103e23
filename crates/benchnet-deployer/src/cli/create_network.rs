//! Create network command implementation.

use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::Context;
use tracing::info;

use super::{NetworkArgs, Run};

/// Create and initialize a network in a directory, leaving it stopped.
#[derive(Parser)]
pub struct CreateNetwork {
    #[command(flatten)]
    pub network: NetworkArgs,

    /// Output directory for the network. Each node gets a home directory inside it.
    #[arg(long)]
    pub directory: PathBuf,
}

impl Run for CreateNetwork {
    async fn run(self) -> color_eyre::Result<()> {
        let manifest = self.network.manifest()?;
        info!(
            "Creating network with {} validators in {:?}",
            manifest.validators, self.directory
        );

        let mut testnet = self
            .network
            .create(&manifest, &self.directory, None)
            .await?;
        let options = manifest.runtime_options()?;
        if let Err(e) = testnet.setup(&options).await {
            // Leave nothing half-written behind.
            let report = testnet.cleanup().await;
            return Err(e).wrap_err_with(|| {
                format!(
                    "failed to set up network ({} teardown failures)",
                    report.failures.len()
                )
            });
        }

        info!("Network created successfully!");
        for node in testnet.nodes() {
            info!(
                "  {}: P2P={}, RPC={}, gRPC={}",
                node.name(),
                node.address_p2p(testnet.backend())?,
                node.address_rpc(testnet.backend())?,
                node.address_grpc(testnet.backend())?,
            );
        }

        println!("\nTo start a node:");
        println!(
            "  cd {} && {} start --home .",
            self.directory.join("val0").display(),
            self.network.node_bin
        );

        Ok(())
    }
}
