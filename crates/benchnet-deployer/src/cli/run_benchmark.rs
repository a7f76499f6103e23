//! Run benchmark command implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use benchnet_deployer::backend::local::LocalBackend;
use benchnet_deployer::node::TRACE_TABLES;
use benchnet_deployer::report::{collect_block_timings, write_block_timings_csv, write_traces};
use benchnet_deployer::{CleanupReport, CometRpcConnector, Manifest, Testnet};
use clap::Parser;
use color_eyre::eyre::{Context, Result, eyre};
use tracing::{error, info, warn};

use super::{NetworkArgs, Run};

/// Run a benchmark: set up and start a network, drive load against it, export block timings,
/// and tear everything down.
#[derive(Parser)]
pub struct RunBenchmark {
    #[command(flatten)]
    pub network: NetworkArgs,

    /// Directory the node homes are created in.
    /// If not specified, a temporary directory is used.
    #[arg(long)]
    pub directory: Option<PathBuf>,

    /// Path to the load client binary.
    #[arg(long, default_value = "txsim")]
    pub tx_client_bin: String,

    /// Where to write the block timings.
    #[arg(long, default_value = "blocks.csv")]
    pub output: PathBuf,

    /// Override the manifest's test duration, e.g. "30s" or "5m".
    #[arg(long)]
    pub duration: Option<humantime::Duration>,
}

impl Run for RunBenchmark {
    async fn run(self) -> Result<()> {
        let mut manifest = self.network.manifest()?;
        if let Some(duration) = self.duration {
            manifest.test_duration = duration.into();
        }

        let (directory, _temp_dir_guard) = match self.directory {
            Some(ref dir) => (dir.clone(), None),
            None => {
                let temp_dir =
                    tempfile::tempdir().wrap_err("failed to create temporary directory")?;
                warn!(
                    "No --directory specified, using {:?}; it is deleted on exit",
                    temp_dir.path()
                );
                (temp_dir.path().to_path_buf(), Some(temp_dir))
            }
        };

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        ctrlc::set_handler(move || {
            warn!("Received Ctrl+C, shutting down...");
            shutdown_clone.store(true, Ordering::SeqCst);
        })
        .wrap_err("failed to set Ctrl+C handler")?;

        let mut testnet = self
            .network
            .create(&manifest, &directory, Some(&self.tx_client_bin))
            .await?;

        let outcome = self.benchmark(&mut testnet, &manifest, &shutdown).await;

        info!("Cleaning up testnet");
        let report = testnet.cleanup().await;
        finish(outcome, &report)
    }
}

/// The command's result: the benchmark's own. Teardown failures are logged but never fail a run.
fn finish(outcome: Result<()>, report: &CleanupReport) -> Result<()> {
    if !report.is_clean() {
        error!(
            failures = report.failures.len(),
            "teardown left resources behind"
        );
    }
    outcome
}

impl RunBenchmark {
    async fn benchmark(
        &self,
        testnet: &mut Testnet<LocalBackend, CometRpcConnector>,
        manifest: &Manifest,
        shutdown: &AtomicBool,
    ) -> Result<()> {
        // Load clients are funded in the genesis, so they must exist before setup.
        let endpoints = testnet.grpc_endpoints()?;
        if endpoints.is_empty() {
            return Err(eyre!("network has no nodes to send load to"));
        }
        let endpoints: Vec<String> = endpoints
            .iter()
            .cycle()
            .take(manifest.tx_clients)
            .cloned()
            .collect();
        testnet
            .create_tx_clients(
                &manifest.tx_client_version,
                &endpoints,
                &manifest.tx_client_options()?,
            )
            .await
            .wrap_err("failed to create tx clients")?;

        info!("Setting up testnet");
        testnet
            .setup(&manifest.runtime_options()?)
            .await
            .wrap_err("failed to set up testnet")?;
        info!("Starting testnet");
        testnet.start().await.wrap_err("failed to start testnet")?;

        info!("Starting tx clients");
        testnet
            .start_tx_clients()
            .await
            .wrap_err("failed to start tx clients")?;

        info!(duration = %humantime::format_duration(manifest.test_duration), "Running load");
        let deadline = tokio::time::Instant::now() + manifest.test_duration;
        while tokio::time::Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        testnet.stop_tx_clients().await;

        info!("Reading blockchain");
        let clients = testnet.rpc_clients().await?;
        let timings = collect_block_timings(&clients).await?;
        write_block_timings_csv(&self.output, &timings)?;

        if manifest.tracing {
            let dir = self
                .output
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join("traces");
            let node = testnet.node(0)?;
            for table in TRACE_TABLES {
                let traces = node
                    .pull_traces(testnet.backend(), table)
                    .await
                    .wrap_err_with(|| format!("failed to pull {table} traces"))?;
                write_traces(&dir, node.name(), table, &traces)?;
            }
        }
        info!(
            blocks = timings.len(),
            output = %self.output.display(),
            "Benchmark finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use benchnet_deployer::Error;
    use benchnet_deployer::testnet::TeardownFailure;

    use super::*;

    fn report_with_failure() -> CleanupReport {
        CleanupReport {
            failures: vec![TeardownFailure {
                resource: "val1".to_string(),
                operation: "destroy",
                error: Error::UnknownNode(1),
            }],
        }
    }

    #[test]
    fn test_teardown_failures_do_not_fail_a_successful_run() {
        assert!(finish(Ok(()), &report_with_failure()).is_ok());
        assert!(finish(Ok(()), &CleanupReport::default()).is_ok());
    }

    #[test]
    fn test_benchmark_failure_is_reported() {
        let err = finish(Err(eyre!("no blocks")), &report_with_failure()).unwrap_err();
        assert_eq!(err.to_string(), "no blocks");
    }
}
